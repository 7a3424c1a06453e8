use super::http::{GatewayHttp, Rejection, Reply};
use super::signature::verify_hmac_sha256_hex;
use super::{decode_webhook, flatten_metadata, require_field, webhook_currency};
use crate::config::MayaSettings;
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
use std::time::Duration;

const SUPPORTED_CURRENCIES: &[Currency] = &[Currency::PHP];
const MINIMUM_PHP: Decimal = dec!(20);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutBody<'a> {
    total_amount: Money<'a>,
    buyer: Buyer<'a>,
    items: [Item<'a>; 1],
    redirect_url: RedirectUrls<'a>,
    request_reference_number: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Money<'a> {
    value: String,
    currency: &'a str,
}

#[derive(Serialize)]
struct Buyer<'a> {
    contact: Contact<'a>,
}

#[derive(Serialize)]
struct Contact<'a> {
    email: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Item<'a> {
    name: &'a str,
    quantity: u32,
    total_amount: Money<'a>,
}

#[derive(Serialize)]
struct RedirectUrls<'a> {
    success: &'a str,
    failure: &'a str,
    cancel: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefundBody<'a> {
    total_amount: Money<'a>,
    reason: &'a str,
}

#[derive(Serialize)]
struct VoidBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutResource {
    checkout_id: String,
    redirect_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResource {
    id: String,
    status: String,
    amount: Decimal,
    currency: String,
    payment_at: Option<DateTime<Utc>>,
    refunded_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundResource {
    id: String,
    status: String,
    total_amount: Option<RefundAmount>,
}

#[derive(Debug, Deserialize)]
struct RefundAmount {
    amount: Decimal,
}

/// Maya posts the payment resource itself; its status doubles as the event type.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MayaEvent {
    id: Option<String>,
    status: Option<String>,
    amount: Option<Decimal>,
    currency: Option<String>,
    refunded_amount: Option<Decimal>,
    metadata: Option<Value>,
}

/// Maya Checkout and Payments APIs.
pub struct MayaGateway {
    http: GatewayHttp,
    public_key: String,
    secret_key: String,
    webhook_secret: String,
    success_url: String,
    failure_url: String,
    cancel_url: String,
}

impl MayaGateway {
    pub fn new(settings: &MayaSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: GatewayHttp::new(GatewayKind::Maya, &settings.base_url, timeout)?,
            public_key: settings.public_key.clone(),
            secret_key: settings.secret_key.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            success_url: settings.success_url.clone(),
            failure_url: settings.failure_url.clone(),
            cancel_url: settings.cancel_url.clone(),
        })
    }

    fn translate(
        &self,
        rejection: Rejection,
        reference: &str,
        requested: Option<Decimal>,
    ) -> PaymentError {
        let code = rejection
            .body
            .pointer("/code")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match code {
            "PAYMENT_ALREADY_REFUNDED" => PaymentError::AlreadyRefunded,
            "REFUND_AMOUNT_EXCEEDED" => PaymentError::RefundExceedsAmount {
                requested: requested.unwrap_or_default(),
                remaining: rejection
                    .body
                    .pointer("/remainingAmount")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default(),
            },
            "PAYMENT_NOT_REFUNDABLE" => PaymentError::TransactionNotRefundable(rejection.message()),
            "PAYMENT_NOT_VOIDABLE" => PaymentError::AlreadyFinalized(rejection.message()),
            _ if rejection.status == StatusCode::NOT_FOUND => {
                PaymentError::TransactionNotFound(reference.to_string())
            }
            _ => PaymentError::rejected(GatewayKind::Maya, rejection.message()),
        }
    }

    async fn fetch_payment(&self, gateway_transaction_id: &str) -> Result<PaymentResource> {
        let builder = self
            .http
            .client()
            .get(self.http.url(&format!("/payments/v1/payments/{gateway_transaction_id}")))
            .basic_auth(&self.secret_key, None::<&str>);
        match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body),
            Reply::Rejected(rejection) => Err(self.translate(rejection, gateway_transaction_id, None)),
        }
    }
}

fn payment_status(status: &str) -> Option<GatewayStatus> {
    match status {
        "PENDING_TOKEN" | "PENDING_PAYMENT" | "FOR_AUTHENTICATION" | "AUTHENTICATING"
        | "AUTH_SUCCESS" | "PAYMENT_PROCESSING" => Some(GatewayStatus::Pending),
        "PAYMENT_SUCCESS" | "CAPTURED" => Some(GatewayStatus::Succeeded),
        "PAYMENT_FAILED" | "PAYMENT_EXPIRED" | "AUTH_FAILED" => Some(GatewayStatus::Failed),
        "PAYMENT_CANCELLED" | "VOIDED" => Some(GatewayStatus::Cancelled),
        "REFUNDED" | "PARTIALLY_REFUNDED" => Some(GatewayStatus::Refunded),
        _ => None,
    }
}

fn refund_status(status: &str) -> ProviderRefundStatus {
    match status {
        "SUCCESS" | "REFUNDED" => ProviderRefundStatus::Completed,
        "FAILED" => ProviderRefundStatus::Failed,
        _ => ProviderRefundStatus::Pending,
    }
}

#[async_trait]
impl PaymentGateway for MayaGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Maya
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        SUPPORTED_CURRENCIES
    }

    fn minimum_amount(&self, currency: Currency) -> Option<Decimal> {
        (currency == Currency::PHP).then_some(MINIMUM_PHP)
    }

    fn signature_header(&self) -> &'static str {
        "X-Maya-Signature"
    }

    async fn create_payment(&self, request: &CreatePayment) -> Result<PaymentCreated> {
        let value = format_major(request.amount.value(), request.currency);
        let body = CheckoutBody {
            total_amount: Money {
                value: value.clone(),
                currency: request.currency.code(),
            },
            buyer: Buyer {
                contact: Contact {
                    email: &request.customer_email,
                },
            },
            items: [Item {
                name: &request.description,
                quantity: 1,
                total_amount: Money {
                    value,
                    currency: request.currency.code(),
                },
            }],
            redirect_url: RedirectUrls {
                success: &self.success_url,
                failure: &self.failure_url,
                cancel: &self.cancel_url,
            },
            request_reference_number: &request.idempotency_key,
            metadata: &request.metadata,
        };
        let builder = self
            .http
            .client()
            .post(self.http.url("/checkout/v1/checkouts"))
            .basic_auth(&self.public_key, None::<&str>)
            .json(&body);

        let checkout: CheckoutResource = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(rejection, &request.order_id, None));
            }
        };
        tracing::debug!(gateway = "maya", gateway_transaction_id = %checkout.checkout_id, "checkout created");

        Ok(PaymentCreated {
            gateway_transaction_id: checkout.checkout_id,
            status: GatewayStatus::Pending,
            payment_url: Some(checkout.redirect_url),
            client_secret: None,
            message: "Redirect the customer to Maya checkout".to_string(),
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentVerification> {
        let payment = self.fetch_payment(gateway_transaction_id).await?;
        let status = payment_status(&payment.status).ok_or_else(|| {
            PaymentError::rejected(GatewayKind::Maya, format!("unknown status {}", payment.status))
        })?;

        Ok(PaymentVerification {
            gateway_transaction_id: payment.id,
            status,
            amount: payment.amount,
            currency: payment.currency.parse()?,
            paid_at: payment.payment_at,
            refunded_total: match payment.refunded_amount {
                None if payment.status.eq_ignore_ascii_case("REFUNDED") => Some(payment.amount),
                total => total,
            },
        })
    }

    async fn refund_payment(&self, request: &RefundRequest) -> Result<RefundReceipt> {
        // Maya needs an explicit amount; a full refund is whatever is left.
        let amount = match request.amount {
            Some(amount) => amount.value(),
            None => {
                let payment = self.fetch_payment(&request.gateway_transaction_id).await?;
                payment.amount - payment.refunded_amount.unwrap_or_default()
            }
        };
        let body = RefundBody {
            total_amount: Money {
                value: format_major(amount, request.currency),
                currency: request.currency.code(),
            },
            reason: request.reason.as_deref().unwrap_or("requested_by_customer"),
        };
        let builder = self
            .http
            .client()
            .post(self.http.url(&format!(
                "/payments/v1/payments/{}/refunds",
                request.gateway_transaction_id
            )))
            .basic_auth(&self.secret_key, None::<&str>)
            .json(&body);

        let refund: RefundResource = match self.http.send(builder).await? {
            Reply::Success(body) => self.http.decode(body)?,
            Reply::Rejected(rejection) => {
                return Err(self.translate(rejection, &request.gateway_transaction_id, Some(amount)));
            }
        };

        Ok(RefundReceipt {
            refund_id: refund.id,
            status: refund_status(&refund.status),
            amount: refund.total_amount.map(|t| t.amount).unwrap_or(amount),
            message: "Refund submitted to Maya".to_string(),
        })
    }

    async fn cancel_payment(&self, gateway_transaction_id: &str) -> Result<CancelReceipt> {
        let builder = self
            .http
            .client()
            .post(self.http.url(&format!("/payments/v1/payments/{gateway_transaction_id}/voids")))
            .basic_auth(&self.secret_key, None::<&str>)
            .json(&VoidBody {
                reason: "cancelled_by_merchant",
            });

        match self.http.send(builder).await? {
            Reply::Success(_) => Ok(CancelReceipt {
                status: GatewayStatus::Cancelled,
                message: "Payment voided".to_string(),
            }),
            Reply::Rejected(rejection) => Err(self.translate(rejection, gateway_transaction_id, None)),
        }
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> bool {
        verify_hmac_sha256_hex(self.webhook_secret.as_bytes(), &[payload], signature_header)
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        let event: MayaEvent = decode_webhook(payload)?;
        let transaction_id = require_field(event.id, "id")?;
        let event_type = require_field(event.status, "status")?;

        Ok(ParsedWebhook {
            status: payment_status(&event_type),
            event_type,
            transaction_id,
            amount: event.amount,
            currency: webhook_currency(event.currency.as_deref())?,
            refunded_total: event.refunded_amount,
            metadata: flatten_metadata(event.metadata),
        })
    }
}
