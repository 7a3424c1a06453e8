use crate::domain::gateway::GatewayKind;
use crate::domain::money::Currency;
use crate::domain::transaction::TransactionStatus;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Broad category of a [`PaymentError`], used to pick HTTP status codes and
/// to decide whether a caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Transient,
    Conflict,
    Security,
    NotFound,
    Internal,
}

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Currency {0} is not supported by this gateway")]
    UnsupportedCurrency(String),
    #[error("Amount {amount} {currency} is below the gateway minimum of {minimum}")]
    BelowMinimumAmount {
        amount: Decimal,
        currency: Currency,
        minimum: Decimal,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Malformed webhook: {0}")]
    MalformedWebhook(String),

    #[error("Gateway {gateway} unreachable: {message}")]
    GatewayUnreachable {
        gateway: GatewayKind,
        message: String,
    },
    #[error("Transaction {0} was modified concurrently")]
    StaleTransaction(Uuid),
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Order {order_id} already has an active payment ({existing})")]
    DuplicatePendingPayment { order_id: String, existing: Uuid },
    #[error("Gateway reference {gateway}/{reference} is already recorded")]
    DuplicateGatewayReference {
        gateway: GatewayKind,
        reference: String,
    },
    #[error("Idempotency key {0} was already used for a different order")]
    IdempotencyKeyConflict(String),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("Payment is already finalized ({0})")]
    AlreadyFinalized(String),
    #[error("Payment is already fully refunded")]
    AlreadyRefunded,
    #[error("Refund of {requested} exceeds the refundable amount of {remaining}")]
    RefundExceedsAmount {
        requested: Decimal,
        remaining: Decimal,
    },
    #[error("Transaction is not refundable: {0}")]
    TransactionNotRefundable(String),
    #[error("Reported amount {reported} {reported_currency} does not match {expected} {expected_currency}")]
    AmountMismatch {
        expected: Decimal,
        expected_currency: Currency,
        reported: Decimal,
        reported_currency: Currency,
    },
    #[error("Gateway {gateway} rejected the request: {message}")]
    GatewayRejected {
        gateway: GatewayKind,
        message: String,
    },

    #[error("Webhook signature is invalid")]
    SignatureInvalid,

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Unknown gateway: {0}")]
    UnknownGateway(String),
    #[error("Gateway {0} is disabled")]
    GatewayDisabled(GatewayKind),

    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl PaymentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAmount(_)
            | Self::UnsupportedCurrency(_)
            | Self::BelowMinimumAmount { .. }
            | Self::ValidationError(_)
            | Self::MalformedWebhook(_) => ErrorClass::Validation,
            Self::GatewayUnreachable { .. } | Self::StaleTransaction(_) | Self::Storage(_) => {
                ErrorClass::Transient
            }
            Self::DuplicatePendingPayment { .. }
            | Self::DuplicateGatewayReference { .. }
            | Self::IdempotencyKeyConflict(_)
            | Self::InvalidStateTransition { .. }
            | Self::AlreadyFinalized(_)
            | Self::AlreadyRefunded
            | Self::RefundExceedsAmount { .. }
            | Self::TransactionNotRefundable(_)
            | Self::AmountMismatch { .. }
            | Self::GatewayRejected { .. } => ErrorClass::Conflict,
            Self::SignatureInvalid => ErrorClass::Security,
            Self::TransactionNotFound(_) | Self::UnknownGateway(_) | Self::GatewayDisabled(_) => {
                ErrorClass::NotFound
            }
            Self::Configuration(_) | Self::InternalError(_) => ErrorClass::Internal,
        }
    }

    /// Only transient failures are worth retrying; everything else needs the
    /// caller to inspect current state first.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable identifier used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "invalid_amount",
            Self::UnsupportedCurrency(_) => "unsupported_currency",
            Self::BelowMinimumAmount { .. } => "below_minimum_amount",
            Self::ValidationError(_) => "validation_error",
            Self::MalformedWebhook(_) => "malformed_webhook",
            Self::GatewayUnreachable { .. } => "gateway_unreachable",
            Self::StaleTransaction(_) => "stale_transaction",
            Self::Storage(_) => "storage_error",
            Self::DuplicatePendingPayment { .. } => "duplicate_pending_payment",
            Self::DuplicateGatewayReference { .. } => "duplicate_gateway_reference",
            Self::IdempotencyKeyConflict(_) => "idempotency_key_conflict",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::AlreadyFinalized(_) => "already_finalized",
            Self::AlreadyRefunded => "already_refunded",
            Self::RefundExceedsAmount { .. } => "refund_exceeds_amount",
            Self::TransactionNotRefundable(_) => "transaction_not_refundable",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::GatewayRejected { .. } => "gateway_rejected",
            Self::SignatureInvalid => "signature_invalid",
            Self::TransactionNotFound(_) => "transaction_not_found",
            Self::UnknownGateway(_) => "unknown_gateway",
            Self::GatewayDisabled(_) => "gateway_disabled",
            Self::Configuration(_) => "configuration_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    pub fn unreachable(gateway: GatewayKind, message: impl Into<String>) -> Self {
        Self::GatewayUnreachable {
            gateway,
            message: message.into(),
        }
    }

    pub(crate) fn rejected(gateway: GatewayKind, message: impl Into<String>) -> Self {
        Self::GatewayRejected {
            gateway,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        PaymentError::InternalError(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(PaymentError::unreachable(GatewayKind::Stripe, "timeout").is_retryable());
        assert!(PaymentError::Storage("disk".into()).is_retryable());
        assert!(!PaymentError::AlreadyRefunded.is_retryable());
        assert!(!PaymentError::SignatureInvalid.is_retryable());
        assert!(
            !PaymentError::BelowMinimumAmount {
                amount: dec!(1),
                currency: Currency::PHP,
                minimum: dec!(20),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            PaymentError::UnsupportedCurrency("XYZ".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            PaymentError::RefundExceedsAmount {
                requested: dec!(200),
                remaining: dec!(150),
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(PaymentError::SignatureInvalid.class(), ErrorClass::Security);
        assert_eq!(
            PaymentError::TransactionNotFound("x".into()).class(),
            ErrorClass::NotFound
        );
        assert_eq!(PaymentError::AlreadyRefunded.code(), "already_refunded");
    }
}
