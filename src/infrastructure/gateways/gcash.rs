use super::http::{GatewayHttp, Rejection, Reply};
use super::signature::verify_hmac_sha256_hex;
use super::{decode_webhook, flatten_metadata, require_field, webhook_currency};
use crate::config::GCashSettings;
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
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const SUPPORTED_CURRENCIES: &[Currency] = &[Currency::PHP];
const MINIMUM_PHP: Decimal = dec!(20);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePaymentBody<'a> {
    amount: i64,
    currency: &'a str,
    reference_id: &'a str,
    description: &'a str,
    customer: Customer<'a>,
    redirect_urls: RedirectUrls<'a>,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Customer<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct RedirectUrls<'a> {
    success: &'a str,
    failure: &'a str,
}

#[derive(Serialize)]
struct RefundBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
    currency: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResource {
    id: String,
    status: String,
    amount: Option<i64>,
    currency: Option<String>,
    checkout_url: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    refunded_amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RefundResource {
    id: String,
    status: String,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct GCashEvent {
    event: Option<String>,
    data: Option<GCashEventData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GCashEventData {
    id: Option<String>,
    amount: Option<i64>,
    currency: Option<String>,
    refunded_amount: Option<i64>,
    metadata: Option<Value>,
}

/// GCash merchant payments API.
pub struct GCashGateway {
    http: GatewayHttp,
    api_key: String,
    merchant_id: String,
    webhook_secret: String,
    success_url: String,
    failure_url: String,
}

impl GCashGateway {
    pub fn new(settings: &GCashSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: GatewayHttp::new(GatewayKind::GCash, &settings.base_url, timeout)?,
            api_key: settings.api_key.clone(),
            merchant_id: settings.merchant_id.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            success_url: settings.success_url.clone(),
            failure_url: settings.failure_url.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .client()
            .post(self.http.url(path))
            .bearer_auth(&self.api_key)
            .header("X-Merchant-Id", &self.merchant_id)
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
            "ALREADY_REFUNDED" => PaymentError::AlreadyRefunded,
            "REFUND_EXCEEDS_AMOUNT" => PaymentError::RefundExceedsAmount {
                requested: requested.unwrap_or_default(),
                remaining: rejection
                    .body
                    .pointer("/error/remainingAmount")
                    .and_then(Value::as_i64)
                    .map(|units| from_minor_units(units, Currency::PHP))
                    .unwrap_or_default(),
            },
            "NOT_REFUNDABLE" => PaymentError::TransactionNotRefundable(rejection.message()),
            "ALREADY_FINALIZED" => PaymentError::AlreadyFinalized(rejection.message()),
            _ if rejection.status == StatusCode::NOT_FOUND => {
                PaymentError::TransactionNotFound(reference.to_string())
            }
            _ => PaymentError::rejected(GatewayKind::GCash, rejection.message()),
        }
    }
}

fn payment_status(status: &str) -> Option<GatewayStatus> {
    match status.to_ascii_uppercase().as_str() {
        "CREATED" | "PENDING" | "PROCESSING" => Some(GatewayStatus::Pending),
        "SUCCESS" | "COMPLETED" | "PAID" => Some(GatewayStatus::Succeeded),
        "FAILED" | "EXPIRED" => Some(GatewayStatus::Failed),
        "CANCELLED" => Some(GatewayStatus::Cancelled),
        "REFUNDED" | "PARTIALLY_REFUNDED" => Some(GatewayStatus::Refunded),
        _ => None,
    }
}

fn event_status(event: &str) -> Option<GatewayStatus> {
    match event {
        "payment.completed" => Some(GatewayStatus::Succeeded),
        "payment.failed" | "payment.expired" => Some(GatewayStatus::Failed),
        "payment.cancelled" => Some(GatewayStatus::Cancelled),
        "payment.refunded" => Some(GatewayStatus::Refunded),
        "payment.pending" => Some(GatewayStatus::Pending),
        _ => None,
    }
}

fn refund_status(status: &str) -> ProviderRefundStatus {
    match status.to_ascii_uppercase().as_str() {
        "SUCCESS" | "COMPLETED" => ProviderRefundStatus::Completed,
        "FAILED" | "REJECTED" => ProviderRefundStatus::Failed,
        _ => ProviderRefundStatus::Pending,
    }
}

#[async_trait]
impl PaymentGateway for GCashGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::GCash
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        SUPPORTED_CURRENCIES
    }

    fn minimum_amount(&self, currency: Currency) -> Option<Decimal> {
        (currency == Currency::PHP).then_some(MINIMUM_PHP)
    }

    fn signature_header(&self) -> &'static str {
        "X-GCash-Signature"
    }

    async fn create_payment(&self, request: &CreatePayment) -> Result<PaymentCreated> {
        let body = CreatePaymentBody {
            amount: request.amount.to_minor_units(request.currency)?,
            currency: request.currency.code(),
            reference_id: &request.order_id,
            description: &request.description,
            customer: Customer {
                email: &request.customer_email,
            },
            redirect_urls: RedirectUrls {
                success: &self.success_url,
                failure: &self.failure_url,
            },
            metadata: &request.metadata,
        };
        let builder = self
            .post("/v1/payments")
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&body);

        let payment: PaymentResource = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(rejection, &request.order_id, None));
            }
        };
        let status = payment_status(&payment.status).unwrap_or(GatewayStatus::Pending);
        tracing::debug!(gateway = "gcash", gateway_transaction_id = %payment.id, "payment created");

        Ok(PaymentCreated {
            gateway_transaction_id: payment.id,
            status,
            payment_url: payment.checkout_url,
            client_secret: None,
            message: "Redirect the customer to GCash to approve the payment".to_string(),
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentVerification> {
        let builder = self
            .http
            .client()
            .get(self.http.url(&format!("/v1/payments/{gateway_transaction_id}")))
            .bearer_auth(&self.api_key)
            .header("X-Merchant-Id", &self.merchant_id);

        let payment: PaymentResource = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(rejection, gateway_transaction_id, None));
            }
        };
        let status = payment_status(&payment.status).ok_or_else(|| {
            PaymentError::rejected(GatewayKind::GCash, format!("unknown status {}", payment.status))
        })?;
        let currency = match payment.currency.as_deref() {
            Some(code) => code.parse()?,
            None => Currency::PHP,
        };
        let amount = payment
            .amount
            .map(|units| from_minor_units(units, currency))
            .ok_or_else(|| {
                PaymentError::rejected(GatewayKind::GCash, "payment response has no amount")
            })?;
        // A fully refunded payment implies its total; a partial one must say how much.
        let refunded_total = match payment.refunded_amount {
            Some(units) => Some(from_minor_units(units, currency)),
            None if payment.status.eq_ignore_ascii_case("REFUNDED") => Some(amount),
            None => None,
        };

        Ok(PaymentVerification {
            gateway_transaction_id: payment.id,
            status,
            amount,
            currency,
            paid_at: payment.paid_at,
            refunded_total,
        })
    }

    async fn refund_payment(&self, request: &RefundRequest) -> Result<RefundReceipt> {
        let amount = request
            .amount
            .map(|a| a.to_minor_units(request.currency))
            .transpose()?;
        let body = RefundBody {
            amount,
            currency: request.currency.code(),
            reason: request.reason.as_deref(),
        };
        let builder = self
            .post(&format!("/v1/payments/{}/refunds", request.gateway_transaction_id))
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

        Ok(RefundReceipt {
            refund_id: refund.id,
            status: refund_status(&refund.status),
            amount: from_minor_units(refund.amount, request.currency),
            message: "Refund submitted to GCash".to_string(),
        })
    }

    async fn cancel_payment(&self, gateway_transaction_id: &str) -> Result<CancelReceipt> {
        let builder = self.post(&format!("/v1/payments/{gateway_transaction_id}/cancel"));
        let payment: PaymentResource = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(rejection, gateway_transaction_id, None));
            }
        };

        Ok(CancelReceipt {
            status: payment_status(&payment.status).unwrap_or(GatewayStatus::Cancelled),
            message: "Payment cancelled".to_string(),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> bool {
        verify_hmac_sha256_hex(self.webhook_secret.as_bytes(), &[payload], signature_header)
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        let event: GCashEvent = decode_webhook(payload)?;
        let event_type = require_field(event.event, "event")?;
        let data = event
            .data
            .ok_or_else(|| PaymentError::MalformedWebhook("missing data".to_string()))?;
        let transaction_id = require_field(data.id, "data.id")?;
        let currency = webhook_currency(data.currency.as_deref())?;
        let unit_currency = currency.unwrap_or(Currency::PHP);

        Ok(ParsedWebhook {
            status: event_status(&event_type),
            event_type,
            transaction_id,
            amount: data.amount.map(|u| from_minor_units(u, unit_currency)),
            currency,
            refunded_total: data
                .refunded_amount
                .map(|u| from_minor_units(u, unit_currency)),
            metadata: flatten_metadata(data.metadata),
        })
    }
}
