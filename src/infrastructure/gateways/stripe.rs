use super::http::{GatewayHttp, Rejection, Reply};
use super::signature::verify_hmac_sha256_hex;
use super::{decode_webhook, flatten_metadata, require_field, webhook_currency};
use crate::config::StripeSettings;
use crate::domain::gateway::{
    CancelReceipt, CreatePayment, GatewayKind, GatewayStatus, ParsedWebhook, PaymentCreated,
    PaymentGateway, PaymentVerification, ProviderRefundStatus, RefundReceipt, RefundRequest,
};
use crate::domain::money::{Currency, from_minor_units};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const SUPPORTED_CURRENCIES: &[Currency] = &[
    Currency::USD,
    Currency::EUR,
    Currency::GBP,
    Currency::SGD,
    Currency::JPY,
    Currency::PHP,
];

/// Timestamps this far ahead of our clock are still accepted.
const FUTURE_SKEW_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    amount: i64,
    currency: String,
    client_secret: Option<String>,
    created: Option<i64>,
    last_payment_error: Option<Value>,
    latest_charge: Option<LatestCharge>,
}

/// `latest_charge` is an id unless expanded.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LatestCharge {
    Expanded(Charge),
    Id(String),
}

#[derive(Debug, Deserialize)]
struct Charge {
    amount_refunded: i64,
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Refund {
    id: String,
    status: String,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    data: Option<StripeEventData>,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeEventObject,
}

/// Payment intents and charges share the fields we read.
#[derive(Debug, Deserialize)]
struct StripeEventObject {
    id: Option<String>,
    object: Option<String>,
    payment_intent: Option<String>,
    amount: Option<i64>,
    amount_refunded: Option<i64>,
    currency: Option<String>,
    metadata: Option<Value>,
}

/// Stripe PaymentIntents API.
pub struct StripeGateway {
    http: GatewayHttp,
    secret_key: String,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl StripeGateway {
    pub fn new(settings: &StripeSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: GatewayHttp::new(GatewayKind::Stripe, &settings.base_url, timeout)?,
            secret_key: settings.secret_key.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            tolerance_secs: settings.webhook_tolerance_secs,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .client()
            .post(self.http.url(path))
            .basic_auth(&self.secret_key, None::<&str>)
    }

    fn translate(
        &self,
        rejection: Rejection,
        reference: &str,
        requested: Option<Decimal>,
    ) -> PaymentError {
        let code = rejection
            .body
            .pointer("/error/code")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match code {
            "charge_already_refunded" => PaymentError::AlreadyRefunded,
            "amount_too_large" => PaymentError::RefundExceedsAmount {
                requested: requested.unwrap_or_default(),
                remaining: Decimal::ZERO,
            },
            "payment_intent_unexpected_state" => PaymentError::AlreadyFinalized(rejection.message()),
            "resource_missing" => PaymentError::TransactionNotFound(reference.to_string()),
            _ if rejection.status == StatusCode::NOT_FOUND => {
                PaymentError::TransactionNotFound(reference.to_string())
            }
            _ => PaymentError::rejected(GatewayKind::Stripe, rejection.message()),
        }
    }

    async fn send_intent(
        &self,
        builder: reqwest::RequestBuilder,
        reference: &str,
    ) -> Result<PaymentIntent> {
        match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body),
            Reply::Rejected(rejection) => Err(self.translate(rejection, reference, None)),
        }
    }

    /// Verifies a `Stripe-Signature` header against the clock value `now`.
    pub fn verify_signature_at(&self, payload: &[u8], header: &str, now: i64) -> bool {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            let part = part.trim();
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(sig) = part.strip_prefix("v1=") {
                candidates.push(sig);
            }
        }
        let Some(timestamp_str) = timestamp else {
            return false;
        };
        let Ok(timestamp) = timestamp_str.parse::<i64>() else {
            return false;
        };

        let age = now - timestamp;
        if age > self.tolerance_secs {
            tracing::warn!(age, max = self.tolerance_secs, "stripe webhook timestamp too old");
            return false;
        }
        if age < -FUTURE_SKEW_SECS {
            tracing::warn!(age, "stripe webhook timestamp in the future");
            return false;
        }

        candidates.into_iter().any(|sig| {
            verify_hmac_sha256_hex(
                self.webhook_secret.as_bytes(),
                &[timestamp_str.as_bytes(), b".", payload],
                sig,
            )
        })
    }
}

fn intent_status(intent: &PaymentIntent) -> GatewayStatus {
    match intent.status.as_str() {
        "succeeded" => GatewayStatus::Succeeded,
        "canceled" => GatewayStatus::Cancelled,
        "requires_payment_method" if intent.last_payment_error.is_some() => GatewayStatus::Failed,
        _ => GatewayStatus::Pending,
    }
}

fn event_status(event_type: &str) -> Option<GatewayStatus> {
    match event_type {
        "payment_intent.succeeded" => Some(GatewayStatus::Succeeded),
        "payment_intent.payment_failed" => Some(GatewayStatus::Failed),
        "payment_intent.canceled" => Some(GatewayStatus::Cancelled),
        "payment_intent.processing" => Some(GatewayStatus::Pending),
        "charge.refunded" => Some(GatewayStatus::Refunded),
        _ => None,
    }
}

fn refund_status(status: &str) -> ProviderRefundStatus {
    match status {
        "succeeded" => ProviderRefundStatus::Completed,
        "failed" | "canceled" => ProviderRefundStatus::Failed,
        _ => ProviderRefundStatus::Pending,
    }
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Stripe
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        SUPPORTED_CURRENCIES
    }

    fn minimum_amount(&self, currency: Currency) -> Option<Decimal> {
        match currency {
            Currency::USD | Currency::EUR | Currency::SGD => Some(dec!(0.50)),
            Currency::GBP => Some(dec!(0.30)),
            Currency::JPY => Some(dec!(50)),
            Currency::PHP => Some(dec!(20)),
            Currency::AUD => None,
        }
    }

    fn signature_header(&self) -> &'static str {
        "Stripe-Signature"
    }

    async fn create_payment(&self, request: &CreatePayment) -> Result<PaymentCreated> {
        let mut form = vec![
            ("amount".to_string(), request.amount.to_minor_units(request.currency)?.to_string()),
            ("currency".to_string(), request.currency.code().to_ascii_lowercase()),
            ("description".to_string(), request.description.clone()),
            ("receipt_email".to_string(), request.customer_email.clone()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
            ("metadata[order_id]".to_string(), request.order_id.clone()),
        ];
        for (key, value) in &request.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }
        let builder = self
            .post("/v1/payment_intents")
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form);

        let intent = self.send_intent(builder, &request.order_id).await?;
        tracing::debug!(gateway = "stripe", gateway_transaction_id = %intent.id, "payment intent created");

        Ok(PaymentCreated {
            status: intent_status(&intent),
            gateway_transaction_id: intent.id,
            payment_url: None,
            client_secret: intent.client_secret,
            message: "Confirm the payment with the client secret".to_string(),
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentVerification> {
        let builder = self
            .http
            .client()
            .get(self.http.url(&format!("/v1/payment_intents/{gateway_transaction_id}")))
            .basic_auth(&self.secret_key, None::<&str>)
            .query(&[("expand[]", "latest_charge")]);
        let intent = self.send_intent(builder, gateway_transaction_id).await?;

        let currency: Currency = intent.currency.parse()?;
        let mut status = intent_status(&intent);
        let mut refunded_total = None;
        let mut paid_at = None;
        match &intent.latest_charge {
            Some(LatestCharge::Expanded(charge)) => {
                paid_at = timestamp(charge.created);
                if charge.amount_refunded > 0 {
                    status = GatewayStatus::Refunded;
                    refunded_total = Some(from_minor_units(charge.amount_refunded, currency));
                }
            }
            Some(LatestCharge::Id(charge_id)) => {
                tracing::debug!(gateway = "stripe", charge_id = %charge_id, "latest charge not expanded");
            }
            None => {}
        }
        if status == GatewayStatus::Succeeded && paid_at.is_none() {
            paid_at = timestamp(intent.created);
        }

        Ok(PaymentVerification {
            gateway_transaction_id: intent.id,
            status,
            amount: from_minor_units(intent.amount, currency),
            currency,
            paid_at,
            refunded_total,
        })
    }

    async fn refund_payment(&self, request: &RefundRequest) -> Result<RefundReceipt> {
        let mut form = vec![(
            "payment_intent".to_string(),
            request.gateway_transaction_id.clone(),
        )];
        if let Some(amount) = request.amount {
            form.push((
                "amount".to_string(),
                amount.to_minor_units(request.currency)?.to_string(),
            ));
        }
        if let Some(reason) = &request.reason {
            form.push(("metadata[reason]".to_string(), reason.clone()));
        }
        let builder = self.post("/v1/refunds").form(&form);

        let refund: Refund = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(
                    rejection,
                    &request.gateway_transaction_id,
                    request.amount.map(|a| a.value()),
                ));
            }
        };

        Ok(RefundReceipt {
            refund_id: refund.id,
            status: refund_status(&refund.status),
            amount: from_minor_units(refund.amount, request.currency),
            message: "Refund created".to_string(),
        })
    }

    async fn cancel_payment(&self, gateway_transaction_id: &str) -> Result<CancelReceipt> {
        let builder = self.post(&format!("/v1/payment_intents/{gateway_transaction_id}/cancel"));
        let intent = self.send_intent(builder, gateway_transaction_id).await?;

        Ok(CancelReceipt {
            status: intent_status(&intent),
            message: "Payment intent canceled".to_string(),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> bool {
        self.verify_signature_at(payload, signature_header, Utc::now().timestamp())
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        let event: StripeEvent = decode_webhook(payload)?;
        let event_type = require_field(event.event_type, "type")?;
        let object = event
            .data
            .ok_or_else(|| PaymentError::MalformedWebhook("missing data.object".to_string()))?
            .object;

        // Charges point back at their payment intent.
        let transaction_id = if object.object.as_deref() == Some("charge") {
            require_field(object.payment_intent, "data.object.payment_intent")?
        } else {
            require_field(object.id, "data.object.id")?
        };
        let currency = webhook_currency(object.currency.as_deref())?;
        let to_major = |units: i64| currency.map(|c| from_minor_units(units, c));
        let status = event_status(&event_type);

        Ok(ParsedWebhook {
            amount: object.amount.and_then(to_major),
            refunded_total: match status {
                Some(GatewayStatus::Refunded) => object.amount_refunded.and_then(to_major),
                _ => None,
            },
            status,
            event_type,
            transaction_id,
            currency,
            metadata: flatten_metadata(object.metadata),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::gateways::signature::hmac_sha256_hex;

    fn gateway() -> StripeGateway {
        let settings = StripeSettings {
            enabled: true,
            secret_key: "sk_test".into(),
            webhook_secret: "whsec_test".into(),
            ..StripeSettings::default()
        };
        StripeGateway::new(&settings, Duration::from_secs(5)).unwrap()
    }

    fn header(payload: &[u8], t: i64) -> String {
        let sig = hmac_sha256_hex(b"whsec_test", &[t.to_string().as_bytes(), b".", payload]);
        format!("t={t},v1={sig}")
    }

    #[test]
    fn test_signature_within_tolerance() {
        let gw = gateway();
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let now = 1_700_000_000;
        assert!(gw.verify_signature_at(payload, &header(payload, now - 10), now));
        assert!(gw.verify_signature_at(payload, &header(payload, now + 30), now));
    }

    #[test]
    fn test_signature_rejects_stale_future_and_tampered() {
        let gw = gateway();
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let now = 1_700_000_000;
        assert!(!gw.verify_signature_at(payload, &header(payload, now - 301), now));
        assert!(!gw.verify_signature_at(payload, &header(payload, now + 61), now));
        assert!(!gw.verify_signature_at(b"{}", &header(payload, now), now));
        assert!(!gw.verify_signature_at(payload, "v1=abc", now));
        assert!(!gw.verify_signature_at(payload, "t=abc,v1=abc", now));
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let gw = gateway();
        let payload = b"{}";
        let now = 1_700_000_000;
        let good = header(payload, now);
        let sig = good.split("v1=").nth(1).unwrap();
        let rotated = format!("t={now},v1={},v1={sig}", "00".repeat(32));
        assert!(gw.verify_signature_at(payload, &rotated, now));
    }

    #[test]
    fn test_parse_succeeded_intent() {
        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_1","object":"payment_intent","amount":1250,"currency":"usd","metadata":{"order_id":"1001"}}}}"#;
        let parsed = gateway().parse_webhook(payload).unwrap();
        assert_eq!(parsed.transaction_id, "pi_1");
        assert_eq!(parsed.status, Some(GatewayStatus::Succeeded));
        assert_eq!(parsed.amount, Some(dec!(12.50)));
        assert_eq!(parsed.currency, Some(Currency::USD));
        assert_eq!(parsed.refunded_total, None);
        assert_eq!(parsed.metadata.get("order_id").map(String::as_str), Some("1001"));
    }

    #[test]
    fn test_parse_charge_refunded_uses_intent_id() {
        let payload = br#"{"type":"charge.refunded","data":{"object":{"id":"ch_1","object":"charge","payment_intent":"pi_1","amount":1000,"amount_refunded":400,"currency":"usd"}}}"#;
        let parsed = gateway().parse_webhook(payload).unwrap();
        assert_eq!(parsed.transaction_id, "pi_1");
        assert_eq!(parsed.status, Some(GatewayStatus::Refunded));
        assert_eq!(parsed.refunded_total, Some(dec!(4.00)));
    }

    #[test]
    fn test_other_events_are_informational() {
        let payload = br#"{"type":"payment_intent.created","data":{"object":{"id":"pi_1","object":"payment_intent"}}}"#;
        assert_eq!(gateway().parse_webhook(payload).unwrap().status, None);
    }

    #[test]
    fn test_malformed_payloads() {
        let gw = gateway();
        let payloads: [&[u8]; 4] = [
            b"[]",
            br#"{"data":{"object":{"id":"pi_1"}}}"#,
            br#"{"type":"payment_intent.succeeded"}"#,
            br#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_1","amount":"x"}}}"#,
        ];
        for payload in payloads {
            assert!(matches!(
                gw.parse_webhook(payload),
                Err(PaymentError::MalformedWebhook(_))
            ));
        }
    }

    #[test]
    fn test_minimums() {
        let gw = gateway();
        assert_eq!(gw.minimum_amount(Currency::USD), Some(dec!(0.50)));
        assert!(!gw.supports_currency(Currency::AUD));
        assert!(matches!(
            gw.validate_charge(dec!(0.25), Currency::USD),
            Err(PaymentError::BelowMinimumAmount { .. })
        ));
        assert!(matches!(
            gw.validate_charge(dec!(100.5), Currency::JPY),
            Err(PaymentError::InvalidAmount(_))
        ));
    }
}
