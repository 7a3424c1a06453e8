use crate::domain::gateway::GatewayKind;
use crate::domain::ports::{TransactionStore, WebhookEventStore};
use crate::domain::refund::RefundRecord;
use crate::domain::transaction::Transaction;
use crate::domain::webhook::{DedupKey, WebhookEvent};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct TransactionTables {
    transactions: HashMap<Uuid, Transaction>,
    by_gateway_reference: HashMap<(GatewayKind, String), Uuid>,
    by_idempotency_key: HashMap<String, Uuid>,
    by_order: HashMap<String, Vec<Uuid>>,
    refunds: HashMap<Uuid, Vec<RefundRecord>>,
}

impl TransactionTables {
    fn active_for_order(&self, order_id: &str) -> Option<&Transaction> {
        self.by_order
            .get(order_id)?
            .iter()
            .filter_map(|id| self.transactions.get(id))
            .find(|tx| !tx.status.is_terminal())
    }

    fn check_version(&self, tx: &Transaction, expected_version: u64) -> Result<()> {
        let current = self
            .transactions
            .get(&tx.id)
            .ok_or_else(|| PaymentError::TransactionNotFound(tx.id.to_string()))?;
        if current.version != expected_version {
            return Err(PaymentError::StaleTransaction(tx.id));
        }
        Ok(())
    }
}

/// A thread-safe in-memory transaction store.
///
/// All tables live behind one `RwLock`, so the uniqueness checks and the
/// insert they guard happen atomically. Suited to tests and single-node
/// deployments where losing state on restart is acceptable.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    tables: Arc<RwLock<TransactionTables>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: Transaction) -> Result<()> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.active_for_order(&tx.order_id) {
            return Err(PaymentError::DuplicatePendingPayment {
                order_id: tx.order_id.clone(),
                existing: existing.id,
            });
        }
        let reference = (tx.gateway, tx.gateway_transaction_id.clone());
        if tables.by_gateway_reference.contains_key(&reference) {
            return Err(PaymentError::DuplicateGatewayReference {
                gateway: tx.gateway,
                reference: tx.gateway_transaction_id.clone(),
            });
        }
        if tables.by_idempotency_key.contains_key(&tx.idempotency_key) {
            return Err(PaymentError::IdempotencyKeyConflict(
                tx.idempotency_key.clone(),
            ));
        }

        tables.by_gateway_reference.insert(reference, tx.id);
        tables
            .by_idempotency_key
            .insert(tx.idempotency_key.clone(), tx.id);
        tables
            .by_order
            .entry(tx.order_id.clone())
            .or_default()
            .push(tx.id);
        tables.transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.get(&id).cloned())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_gateway_reference
            .get(&(gateway, gateway_transaction_id.to_string()))
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_idempotency_key
            .get(key)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn find_active_for_order(&self, order_id: &str) -> Result<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.active_for_order(order_id).cloned())
    }

    async fn count_for_order(&self, order_id: &str) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables.by_order.get(order_id).map_or(0, Vec::len))
    }

    async fn update(&self, mut tx: Transaction, expected_version: u64) -> Result<Transaction> {
        let mut tables = self.tables.write().await;
        tables.check_version(&tx, expected_version)?;
        tx.version = expected_version + 1;
        tables.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn record_refund(
        &self,
        refund: RefundRecord,
        mut tx: Transaction,
        expected_version: u64,
    ) -> Result<Transaction> {
        let mut tables = self.tables.write().await;
        tables.check_version(&tx, expected_version)?;
        tx.version = expected_version + 1;
        tables.refunds.entry(tx.id).or_default().push(refund);
        tables.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn refunds_for(&self, transaction_id: Uuid) -> Result<Vec<RefundRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .refunds
            .get(&transaction_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct WebhookTables {
    events: HashMap<Uuid, WebhookEvent>,
    processed: HashMap<DedupKey, Uuid>,
}

/// A thread-safe in-memory log of inbound webhook deliveries.
#[derive(Default, Clone)]
pub struct InMemoryWebhookEventStore {
    tables: Arc<RwLock<WebhookTables>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored delivery, oldest first.
    pub async fn all(&self) -> Vec<WebhookEvent> {
        let tables = self.tables.read().await;
        let mut events: Vec<_> = tables.events.values().cloned().collect();
        events.sort_by_key(|e| e.received_at);
        events
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryWebhookEventStore {
    async fn insert(&self, event: WebhookEvent) -> Result<()> {
        let mut tables = self.tables.write().await;
        if event.processed
            && let Some(key) = event.dedup_key()
        {
            tables.processed.insert(key, event.id);
        }
        tables.events.insert(event.id, event);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>> {
        let tables = self.tables.read().await;
        Ok(tables.events.get(&id).cloned())
    }

    async fn update(&self, event: WebhookEvent) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.events.contains_key(&event.id) {
            return Err(PaymentError::Storage(format!(
                "webhook event {} does not exist",
                event.id
            )));
        }
        if event.processed
            && let Some(key) = event.dedup_key()
        {
            tables.processed.entry(key).or_insert(event.id);
        }
        tables.events.insert(event.id, event);
        Ok(())
    }

    async fn find_processed(&self, key: &DedupKey) -> Result<Option<WebhookEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .processed
            .get(key)
            .and_then(|id| tables.events.get(id))
            .cloned())
    }
}
