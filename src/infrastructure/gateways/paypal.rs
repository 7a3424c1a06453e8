use super::http::{GatewayHttp, Rejection, Reply};
use super::signature::verify_hmac_sha256_hex;
use super::{decode_webhook, require_field, webhook_currency};
use crate::config::PayPalSettings;
use crate::domain::gateway::{
    CancelReceipt, CreatePayment, GatewayKind, GatewayStatus, ParsedWebhook, PaymentCreated,
    PaymentGateway, PaymentVerification, ProviderRefundStatus, RefundReceipt, RefundRequest,
};
use crate::domain::money::{Currency, format_major};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const SUPPORTED_CURRENCIES: &[Currency] = &[
    Currency::USD,
    Currency::EUR,
    Currency::GBP,
    Currency::PHP,
    Currency::JPY,
    Currency::AUD,
];

/// Tokens are refreshed this long before PayPal says they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Money {
    currency_code: String,
    value: Decimal,
}

#[derive(Serialize)]
struct CreateOrderBody<'a> {
    intent: &'static str,
    purchase_units: [PurchaseUnitRequest<'a>; 1],
    application_context: ApplicationContext<'a>,
}

#[derive(Serialize)]
struct PurchaseUnitRequest<'a> {
    reference_id: &'a str,
    custom_id: &'a str,
    description: &'a str,
    amount: AmountRequest<'a>,
}

#[derive(Serialize)]
struct AmountRequest<'a> {
    currency_code: &'a str,
    value: String,
}

#[derive(Serialize)]
struct ApplicationContext<'a> {
    return_url: &'a str,
    cancel_url: &'a str,
    user_action: &'static str,
}

#[derive(Serialize)]
struct RefundBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<AmountRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    note_to_payer: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    amount: Option<Money>,
    payments: Option<Payments>,
}

#[derive(Debug, Default, Deserialize)]
struct Payments {
    #[serde(default)]
    captures: Vec<Capture>,
    #[serde(default)]
    refunds: Vec<RefundResource>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
    create_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RefundResource {
    id: String,
    status: String,
    amount: Option<Money>,
}

#[derive(Debug, Deserialize)]
struct PayPalEvent {
    event_type: Option<String>,
    resource: Option<PayPalResource>,
}

/// Captures, refunds and orders share the fields we read.
#[derive(Debug, Deserialize)]
struct PayPalResource {
    id: Option<String>,
    amount: Option<Money>,
    custom_id: Option<String>,
    supplementary_data: Option<SupplementaryData>,
    seller_payable_breakdown: Option<SellerPayableBreakdown>,
}

#[derive(Debug, Deserialize)]
struct SupplementaryData {
    related_ids: Option<RelatedIds>,
}

#[derive(Debug, Deserialize)]
struct RelatedIds {
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SellerPayableBreakdown {
    total_refunded_amount: Option<Money>,
}

/// PayPal Orders v2 API with OAuth2 client credentials.
pub struct PayPalGateway {
    http: GatewayHttp,
    client_id: String,
    client_secret: String,
    webhook_id: String,
    webhook_secret: String,
    return_url: String,
    cancel_url: String,
    token: Mutex<Option<AccessToken>>,
}

impl PayPalGateway {
    pub fn new(settings: &PayPalSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: GatewayHttp::new(GatewayKind::PayPal, &settings.base_url, timeout)?,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            webhook_id: settings.webhook_id.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            return_url: settings.return_url.clone(),
            cancel_url: settings.cancel_url.clone(),
            token: Mutex::new(None),
        })
    }

    /// Returns a cached bearer token, fetching a new one when close to expiry.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at
        {
            return Ok(token.value.clone());
        }

        let builder = self
            .http
            .client()
            .post(self.http.url("/v1/oauth2/token"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")]);
        let response: TokenResponse = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                tracing::error!(gateway = "paypal", status = rejection.status.as_u16(), "oauth token request rejected");
                return Err(PaymentError::rejected(
                    GatewayKind::PayPal,
                    format!("authentication failed: {}", rejection.message()),
                ));
            }
        };

        let token = AccessToken {
            value: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        };
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    fn translate(
        &self,
        rejection: Rejection,
        reference: &str,
        requested: Option<Decimal>,
    ) -> PaymentError {
        let issue = rejection
            .body
            .pointer("/details/0/issue")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match issue {
            "CAPTURE_FULLY_REFUNDED" => PaymentError::AlreadyRefunded,
            "REFUND_AMOUNT_EXCEEDED" => PaymentError::RefundExceedsAmount {
                requested: requested.unwrap_or_default(),
                remaining: Decimal::ZERO,
            },
            "REFUND_NOT_ALLOWED" | "REFUND_TIME_LIMIT_EXCEEDED" => {
                PaymentError::TransactionNotRefundable(rejection.message())
            }
            "ORDER_ALREADY_CAPTURED" | "ORDER_COMPLETED_OR_VOIDED" => {
                PaymentError::AlreadyFinalized(rejection.message())
            }
            _ if rejection.status == StatusCode::NOT_FOUND => {
                PaymentError::TransactionNotFound(reference.to_string())
            }
            _ => PaymentError::rejected(GatewayKind::PayPal, rejection.message()),
        }
    }

    async fn fetch_order(&self, order_id: &str) -> Result<Order> {
        let token = self.access_token().await?;
        let builder = self
            .http
            .client()
            .get(self.http.url(&format!("/v2/checkout/orders/{order_id}")))
            .bearer_auth(token);
        match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body),
            Reply::Rejected(rejection) => Err(self.translate(rejection, order_id, None)),
        }
    }
}

impl Order {
    fn first_capture(&self) -> Option<&Capture> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next()
    }

    fn refunded_total(&self) -> Decimal {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.refunds.iter())
            .filter(|refund| refund.status != "CANCELLED" && refund.status != "FAILED")
            .filter_map(|refund| refund.amount.as_ref())
            .map(|money| money.value)
            .sum()
    }

    fn status(&self) -> GatewayStatus {
        match self.status.as_str() {
            "VOIDED" => GatewayStatus::Cancelled,
            "COMPLETED" => match self.first_capture().map(|c| c.status.as_str()) {
                Some("DECLINED") | Some("FAILED") => GatewayStatus::Failed,
                Some("REFUNDED") | Some("PARTIALLY_REFUNDED") => GatewayStatus::Refunded,
                Some("PENDING") => GatewayStatus::Pending,
                _ => GatewayStatus::Succeeded,
            },
            _ => GatewayStatus::Pending,
        }
    }
}

fn event_status(event_type: &str) -> Option<GatewayStatus> {
    match event_type {
        "PAYMENT.CAPTURE.COMPLETED" => Some(GatewayStatus::Succeeded),
        "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => Some(GatewayStatus::Failed),
        "PAYMENT.CAPTURE.REFUNDED" => Some(GatewayStatus::Refunded),
        "PAYMENT.CAPTURE.PENDING" => Some(GatewayStatus::Pending),
        "CHECKOUT.ORDER.VOIDED" => Some(GatewayStatus::Cancelled),
        _ => None,
    }
}

fn refund_status(status: &str) -> ProviderRefundStatus {
    match status {
        "COMPLETED" => ProviderRefundStatus::Completed,
        "CANCELLED" | "FAILED" => ProviderRefundStatus::Failed,
        _ => ProviderRefundStatus::Pending,
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::PayPal
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        SUPPORTED_CURRENCIES
    }

    fn minimum_amount(&self, currency: Currency) -> Option<Decimal> {
        self.supports_currency(currency).then_some(dec!(1))
    }

    fn signature_header(&self) -> &'static str {
        "PayPal-Transmission-Sig"
    }

    async fn create_payment(&self, request: &CreatePayment) -> Result<PaymentCreated> {
        let token = self.access_token().await?;
        let body = CreateOrderBody {
            intent: "CAPTURE",
            purchase_units: [PurchaseUnitRequest {
                reference_id: &request.order_id,
                custom_id: &request.order_id,
                description: &request.description,
                amount: AmountRequest {
                    currency_code: request.currency.code(),
                    value: format_major(request.amount.value(), request.currency),
                },
            }],
            application_context: ApplicationContext {
                return_url: &self.return_url,
                cancel_url: &self.cancel_url,
                user_action: "PAY_NOW",
            },
        };
        let builder = self
            .http
            .client()
            .post(self.http.url("/v2/checkout/orders"))
            .bearer_auth(token)
            .header("PayPal-Request-Id", &request.idempotency_key)
            .json(&body);

        let order: Order = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(rejection, &request.order_id, None));
            }
        };
        let approve_url = order
            .links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href.clone())
            .ok_or_else(|| {
                PaymentError::rejected(GatewayKind::PayPal, "order has no approval link")
            })?;
        tracing::debug!(gateway = "paypal", gateway_transaction_id = %order.id, "order created");

        Ok(PaymentCreated {
            status: order.status(),
            gateway_transaction_id: order.id,
            payment_url: Some(approve_url),
            client_secret: None,
            message: "Redirect the customer to PayPal to approve the order".to_string(),
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentVerification> {
        let order = self.fetch_order(gateway_transaction_id).await?;
        let status = order.status();
        let amount = order
            .purchase_units
            .first()
            .and_then(|unit| unit.amount.as_ref())
            .ok_or_else(|| PaymentError::rejected(GatewayKind::PayPal, "order has no amount"))?;
        let refunded = order.refunded_total();
        let fully_refunded = order
            .first_capture()
            .is_some_and(|capture| capture.status == "REFUNDED");
        let refunded_total = if refunded > Decimal::ZERO {
            Some(refunded)
        } else {
            fully_refunded.then_some(amount.value)
        };

        Ok(PaymentVerification {
            gateway_transaction_id: order.id.clone(),
            status,
            amount: amount.value,
            currency: amount.currency_code.parse()?,
            paid_at: order.first_capture().and_then(|c| c.create_time),
            refunded_total,
        })
    }

    async fn refund_payment(&self, request: &RefundRequest) -> Result<RefundReceipt> {
        let order = self.fetch_order(&request.gateway_transaction_id).await?;
        let capture_id = order
            .first_capture()
            .map(|capture| capture.id.clone())
            .ok_or_else(|| {
                PaymentError::TransactionNotRefundable("order has no capture".to_string())
            })?;

        let token = self.access_token().await?;
        let body = RefundBody {
            amount: request.amount.map(|amount| AmountRequest {
                currency_code: request.currency.code(),
                value: format_major(amount.value(), request.currency),
            }),
            note_to_payer: request.reason.as_deref(),
        };
        let builder = self
            .http
            .client()
            .post(self.http.url(&format!("/v2/payments/captures/{capture_id}/refund")))
            .bearer_auth(token)
            .json(&body);

        let refund: RefundResource = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(
                    rejection,
                    &request.gateway_transaction_id,
                    request.amount.map(|a| a.value()),
                ));
            }
        };
        let amount = refund
            .amount
            .as_ref()
            .map(|money| money.value)
            .or(request.amount.map(|a| a.value()))
            .ok_or_else(|| {
                PaymentError::rejected(GatewayKind::PayPal, "refund response has no amount")
            })?;

        Ok(RefundReceipt {
            refund_id: refund.id,
            status: refund_status(&refund.status),
            amount,
            message: "Refund submitted to PayPal".to_string(),
        })
    }

    async fn cancel_payment(&self, gateway_transaction_id: &str) -> Result<CancelReceipt> {
        // Unapproved orders simply expire on PayPal's side.
        let order = self.fetch_order(gateway_transaction_id).await?;
        if order.status == "COMPLETED" {
            return Err(PaymentError::AlreadyFinalized(format!(
                "order {gateway_transaction_id} is already captured"
            )));
        }
        Ok(CancelReceipt {
            status: GatewayStatus::Cancelled,
            message: "Order abandoned".to_string(),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> bool {
        verify_hmac_sha256_hex(
            self.webhook_secret.as_bytes(),
            &[self.webhook_id.as_bytes(), b"|", payload],
            signature_header,
        )
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        let event: PayPalEvent = decode_webhook(payload)?;
        let event_type = require_field(event.event_type, "event_type")?;
        let resource = event
            .resource
            .ok_or_else(|| PaymentError::MalformedWebhook("missing resource".to_string()))?;

        let related_order = resource
            .supplementary_data
            .and_then(|data| data.related_ids)
            .and_then(|ids| ids.order_id);
        let transaction_id = if event_type.starts_with("CHECKOUT.ORDER.") {
            require_field(resource.id, "resource.id")?
        } else {
            require_field(related_order, "resource.supplementary_data.related_ids.order_id")?
        };
        let status = event_status(&event_type);

        let mut metadata = BTreeMap::new();
        if let Some(custom_id) = resource.custom_id {
            metadata.insert("custom_id".to_string(), custom_id);
        }

        // A refund resource's amount is the refund, not the payment.
        let (amount, currency, refunded_total) = if status == Some(GatewayStatus::Refunded) {
            let total = resource
                .seller_payable_breakdown
                .and_then(|b| b.total_refunded_amount);
            let currency = webhook_currency(total.as_ref().map(|m| m.currency_code.as_str()))?;
            (None, currency, total.map(|m| m.value))
        } else {
            let currency =
                webhook_currency(resource.amount.as_ref().map(|m| m.currency_code.as_str()))?;
            (resource.amount.map(|m| m.value), currency, None)
        };

        Ok(ParsedWebhook {
            event_type,
            transaction_id,
            status,
            amount,
            currency,
            refunded_total,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::gateways::signature::hmac_sha256_hex;

    fn gateway() -> PayPalGateway {
        let settings = PayPalSettings {
            enabled: true,
            client_id: "client".into(),
            client_secret: "secret".into(),
            webhook_id: "WH-1".into(),
            webhook_secret: "paypal-secret".into(),
            ..PayPalSettings::default()
        };
        PayPalGateway::new(&settings, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_signature_binds_webhook_id() {
        let gw = gateway();
        let payload = br#"{"event_type":"PAYMENT.CAPTURE.COMPLETED"}"#;
        let good = hmac_sha256_hex(b"paypal-secret", &[b"WH-1|", payload]);
        let other_hook = hmac_sha256_hex(b"paypal-secret", &[b"WH-2|", payload]);
        assert!(gw.verify_webhook_signature(payload, &good));
        assert!(!gw.verify_webhook_signature(payload, &other_hook));
    }

    #[test]
    fn test_capture_completed_uses_related_order() {
        let payload = br#"{"id":"WH-EVT-1","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{"id":"CAP-1","status":"COMPLETED","amount":{"currency_code":"USD","value":"12.50"},"supplementary_data":{"related_ids":{"order_id":"ORDER-1"}}}}"#;
        let parsed = gateway().parse_webhook(payload).unwrap();
        assert_eq!(parsed.transaction_id, "ORDER-1");
        assert_eq!(parsed.status, Some(GatewayStatus::Succeeded));
        assert_eq!(parsed.amount, Some(dec!(12.50)));
        assert_eq!(parsed.currency, Some(Currency::USD));
    }

    #[test]
    fn test_refund_event_reports_cumulative_total() {
        let payload = br#"{"event_type":"PAYMENT.CAPTURE.REFUNDED","resource":{"id":"REF-1","amount":{"currency_code":"USD","value":"2.00"},"seller_payable_breakdown":{"total_refunded_amount":{"currency_code":"USD","value":"5.00"}},"supplementary_data":{"related_ids":{"order_id":"ORDER-1"}}}}"#;
        let parsed = gateway().parse_webhook(payload).unwrap();
        assert_eq!(parsed.status, Some(GatewayStatus::Refunded));
        assert_eq!(parsed.refunded_total, Some(dec!(5.00)));
        assert_eq!(parsed.amount, None);
    }

    #[test]
    fn test_order_approved_is_informational() {
        let payload = br#"{"event_type":"CHECKOUT.ORDER.APPROVED","resource":{"id":"ORDER-1","status":"APPROVED"}}"#;
        let parsed = gateway().parse_webhook(payload).unwrap();
        assert_eq!(parsed.transaction_id, "ORDER-1");
        assert_eq!(parsed.status, None);
    }

    #[test]
    fn test_malformed_payloads() {
        let gw = gateway();
        let payloads: [&[u8]; 4] = [
            b"null",
            br#"{"resource":{"id":"ORDER-1"}}"#,
            br#"{"event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{"id":"CAP-1"}}"#,
            br#"{"event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{"amount":{"currency_code":"USD","value":"abc"},"supplementary_data":{"related_ids":{"order_id":"O"}}}}"#,
        ];
        for payload in payloads {
            assert!(matches!(
                gw.parse_webhook(payload),
                Err(PaymentError::MalformedWebhook(_))
            ));
        }
    }

    #[test]
    fn test_order_status_mapping() {
        let order: Order = serde_json::from_str(
            r#"{"id":"O","status":"COMPLETED","purchase_units":[{"amount":{"currency_code":"USD","value":"10.00"},"payments":{"captures":[{"id":"C","status":"PARTIALLY_REFUNDED"}],"refunds":[{"id":"R1","status":"COMPLETED","amount":{"currency_code":"USD","value":"3.00"}},{"id":"R2","status":"FAILED","amount":{"currency_code":"USD","value":"1.00"}}]}}]}"#,
        )
        .unwrap();
        assert_eq!(order.status(), GatewayStatus::Refunded);
        assert_eq!(order.refunded_total(), dec!(3.00));

        let approved: Order = serde_json::from_str(r#"{"id":"O","status":"APPROVED"}"#).unwrap();
        assert_eq!(approved.status(), GatewayStatus::Pending);
    }
}
