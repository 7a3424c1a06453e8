use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

/// Where a refund was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundSource {
    /// Requested through the orchestrator.
    Api,
    /// Issued outside this service (provider dashboard) and picked up from a
    /// webhook or a status poll.
    Gateway,
}

/// One refund against a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub refund_id: String,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub source: RefundSource,
    pub created_at: DateTime<Utc>,
}

impl RefundRecord {
    pub fn new(
        transaction_id: Uuid,
        refund_id: String,
        amount: Decimal,
        reason: Option<String>,
        status: RefundStatus,
        source: RefundSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            refund_id,
            amount,
            reason,
            status,
            source,
            created_at: Utc::now(),
        }
    }

    /// Pending refunds reserve their amount until the provider settles them.
    pub fn counts_against_amount(&self) -> bool {
        self.status != RefundStatus::Failed
    }
}

/// Sum of refunds that count against the original amount.
pub fn refunded_total(refunds: &[RefundRecord]) -> Decimal {
    refunds
        .iter()
        .filter(|r| r.counts_against_amount())
        .map(|r| r.amount)
        .sum()
}
