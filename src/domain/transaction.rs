use super::gateway::GatewayKind;
use super::money::Currency;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    AwaitingRedirect,
    Completed,
    Failed,
    Cancelled,
    PartiallyRefunded,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingRedirect => "awaiting_redirect",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Refunded => "refunded",
        }
    }

    /// No transition ever leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Refunded)
    }

    /// Payment has not settled yet and may still be cancelled.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::AwaitingRedirect)
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyRefunded)
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingRedirect)
                | (Pending | AwaitingRedirect, Completed | Failed | Cancelled)
                | (Completed, PartiallyRefunded | Refunded)
                | (PartiallyRefunded, PartiallyRefunded | Refunded)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking a transaction to move to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    /// The transaction was already in the requested state; nothing to persist.
    Unchanged(TransactionStatus),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// What the client must do next to complete a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientAction {
    Redirect { url: String },
    ClientSecret { secret: String },
}

/// One payment attempt for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub gateway_transaction_id: String,
    pub order_id: String,
    pub gateway: GatewayKind,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub client_action: Option<ClientAction>,
    pub customer_email: String,
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Sum of every non-failed refund recorded against this transaction.
    pub refunded_amount: Decimal,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Bumped on every persisted change; stores compare it before writing.
    pub version: u64,
}

impl Transaction {
    /// Moves the transaction to `next`, enforcing the state machine.
    ///
    /// Requesting the current state is reported as [`Transition::Unchanged`]
    /// rather than an error, which lets a late webhook and a poll that both
    /// observed the same provider state converge without double effects.
    /// `partially_refunded -> partially_refunded` is the one self-loop that
    /// counts as applied, since each additional partial refund is a change.
    pub fn transition_to(&mut self, next: TransactionStatus) -> Result<Transition, PaymentError> {
        let from = self.status;
        if from == next && next != TransactionStatus::PartiallyRefunded {
            return Ok(Transition::Unchanged(from));
        }
        if !from.can_transition_to(next) {
            return Err(PaymentError::InvalidStateTransition { from, to: next });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next == TransactionStatus::Completed && self.paid_at.is_none() {
            self.paid_at = Some(self.updated_at);
        }
        Ok(Transition::Applied { from, to: next })
    }

    pub fn remaining_refundable(&self) -> Decimal {
        (self.amount - self.refunded_amount).max(Decimal::ZERO)
    }

    /// Status after the cumulative refunded amount reaches `refunded_total`.
    pub fn refund_status_for(&self, refunded_total: Decimal) -> TransactionStatus {
        if refunded_total >= self.amount {
            TransactionStatus::Refunded
        } else {
            TransactionStatus::PartiallyRefunded
        }
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            transaction_id: self.id,
            order_id: self.order_id.clone(),
            gateway: self.gateway,
            status: self.status,
            amount: self.amount,
            currency: self.currency,
            refunded_amount: self.refunded_amount,
            payment_url: match &self.client_action {
                Some(ClientAction::Redirect { url }) => Some(url.clone()),
                _ => None,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
            paid_at: self.paid_at,
        }
    }
}

/// Client-facing view of a transaction. Leaves out provider identifiers and
/// client secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub transaction_id: Uuid,
    pub order_id: String,
    pub gateway: GatewayKind,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub currency: Currency,
    pub refunded_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}
