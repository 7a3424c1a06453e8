use super::money::{Amount, Currency};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    GCash,
    Maya,
    Stripe,
    PayPal,
}

impl GatewayKind {
    pub const ALL: [GatewayKind; 4] = [
        GatewayKind::GCash,
        GatewayKind::Maya,
        GatewayKind::Stripe,
        GatewayKind::PayPal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::GCash => "gcash",
            GatewayKind::Maya => "maya",
            GatewayKind::Stripe => "stripe",
            GatewayKind::PayPal => "paypal",
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayKind {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gcash" => Ok(GatewayKind::GCash),
            "maya" | "paymaya" => Ok(GatewayKind::Maya),
            "stripe" => Ok(GatewayKind::Stripe),
            "paypal" => Ok(GatewayKind::PayPal),
            other => Err(PaymentError::UnknownGateway(other.to_string())),
        }
    }
}

/// Provider-side payment state, normalized across gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    /// Some or all of the payment was refunded; see `refunded_total`.
    Refunded,
}

#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub amount: Amount,
    pub currency: Currency,
    pub order_id: String,
    pub customer_email: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    /// Forwarded to providers that support request idempotency.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCreated {
    pub gateway_transaction_id: String,
    pub status: GatewayStatus,
    pub payment_url: Option<String>,
    pub client_secret: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentVerification {
    pub gateway_transaction_id: String,
    pub status: GatewayStatus,
    pub amount: Decimal,
    pub currency: Currency,
    pub paid_at: Option<DateTime<Utc>>,
    /// Cumulative refunded amount, when the provider reports it.
    pub refunded_total: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub gateway_transaction_id: String,
    /// `None` refunds whatever is left on the provider side.
    pub amount: Option<Amount>,
    pub currency: Currency,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRefundStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub status: ProviderRefundStatus,
    pub amount: Decimal,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelReceipt {
    pub status: GatewayStatus,
    pub message: String,
}

/// Normalized content of an authenticated webhook payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWebhook {
    /// Provider event type exactly as sent, e.g. `payment_intent.succeeded`.
    pub event_type: String,
    pub transaction_id: String,
    /// `None` for informational events that carry no state change.
    pub status: Option<GatewayStatus>,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub refunded_total: Option<Decimal>,
    pub metadata: BTreeMap<String, String>,
}

/// Contract every payment provider client implements.
///
/// Network-facing operations are async and must translate provider errors
/// into [`PaymentError`] before returning. Metadata queries and webhook
/// authentication are pure.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn supported_currencies(&self) -> &'static [Currency];

    fn supports_currency(&self, currency: Currency) -> bool {
        self.supported_currencies().contains(&currency)
    }

    fn minimum_amount(&self, currency: Currency) -> Option<Decimal>;

    /// Name of the HTTP header carrying the webhook signature.
    fn signature_header(&self) -> &'static str;

    /// Checks a charge against the gateway's static limits without any I/O.
    fn validate_charge(&self, amount: Decimal, currency: Currency) -> Result<Amount> {
        let amount = Amount::new(amount)?;
        if !self.supports_currency(currency) {
            return Err(PaymentError::UnsupportedCurrency(currency.to_string()));
        }
        let minimum = self
            .minimum_amount(currency)
            .ok_or_else(|| PaymentError::UnsupportedCurrency(currency.to_string()))?;
        if amount.value() < minimum {
            return Err(PaymentError::BelowMinimumAmount {
                amount: amount.value(),
                currency,
                minimum,
            });
        }
        amount.to_minor_units(currency)?;
        Ok(amount)
    }

    async fn create_payment(&self, request: &CreatePayment) -> Result<PaymentCreated>;

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentVerification>;

    async fn refund_payment(&self, request: &RefundRequest) -> Result<RefundReceipt>;

    async fn cancel_payment(&self, gateway_transaction_id: &str) -> Result<CancelReceipt>;

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> bool;

    fn parse_webhook(&self, payload: &[u8]) -> Result<ParsedWebhook>;
}

pub type SharedGateway = Arc<dyn PaymentGateway>;
