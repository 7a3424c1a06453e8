use super::gateway::GatewayKind;
use super::money::Currency;
use super::refund::RefundRecord;
use super::transaction::{Transaction, TransactionStatus};
use super::webhook::{DedupKey, WebhookEvent};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Persistence for transactions and their refunds.
///
/// Implementations must enforce, atomically with the write:
/// - at most one non-terminal transaction per order,
/// - unique `(gateway, gateway_transaction_id)`,
/// - unique idempotency keys,
/// - compare-and-swap on `version` for updates.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, tx: Transaction) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>>;

    async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_transaction_id: &str,
    ) -> Result<Option<Transaction>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>>;

    async fn find_active_for_order(&self, order_id: &str) -> Result<Option<Transaction>>;

    async fn count_for_order(&self, order_id: &str) -> Result<usize>;

    /// Writes `tx` if the stored version still equals `expected_version`.
    /// The stored copy gets `expected_version + 1`.
    async fn update(&self, tx: Transaction, expected_version: u64) -> Result<Transaction>;

    /// Persists a refund together with the updated transaction in one step.
    async fn record_refund(
        &self,
        refund: RefundRecord,
        tx: Transaction,
        expected_version: u64,
    ) -> Result<Transaction>;

    async fn refunds_for(&self, transaction_id: Uuid) -> Result<Vec<RefundRecord>>;
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn insert(&self, event: WebhookEvent) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>>;

    /// Overwrites an existing event (processing flag, rejection marker).
    async fn update(&self, event: WebhookEvent) -> Result<()>;

    /// Returns the processed event with this identity, if any.
    async fn find_processed(&self, key: &DedupKey) -> Result<Option<WebhookEvent>>;
}

/// Payment-status change pushed to the order subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPaymentUpdate {
    pub order_id: String,
    pub transaction_id: Uuid,
    pub gateway: GatewayKind,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub refunded_amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    PaymentReceived,
    PaymentFailed,
    RefundIssued,
}

/// Customer-facing message to enqueue with the notification subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerNotice {
    pub kind: NoticeKind,
    pub customer_email: String,
    pub order_id: String,
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub currency: Currency,
}

#[async_trait]
pub trait OrderStatusSink: Send + Sync {
    async fn payment_status_changed(&self, update: OrderPaymentUpdate) -> Result<()>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn enqueue(&self, notice: CustomerNotice) -> Result<()>;
}

pub type TransactionStoreRef = Arc<dyn TransactionStore>;
pub type WebhookEventStoreRef = Arc<dyn WebhookEventStore>;
pub type OrderStatusSinkRef = Arc<dyn OrderStatusSink>;
pub type NotificationSinkRef = Arc<dyn NotificationSink>;
