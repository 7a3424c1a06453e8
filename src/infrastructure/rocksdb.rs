use crate::domain::gateway::GatewayKind;
use crate::domain::ports::{TransactionStore, WebhookEventStore};
use crate::domain::refund::RefundRecord;
use crate::domain::transaction::Transaction;
use crate::domain::webhook::{DedupKey, WebhookEvent};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for transaction records, keyed by id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for refunds, keyed by transaction id then refund id.
pub const CF_REFUNDS: &str = "refunds";
/// Column Family for raw webhook deliveries, keyed by id.
pub const CF_WEBHOOK_EVENTS: &str = "webhook_events";
/// Column Family for secondary indexes.
pub const CF_INDEXES: &str = "indexes";

const SEP: char = '\u{1f}';

impl From<rocksdb::Error> for PaymentError {
    fn from(e: rocksdb::Error) -> Self {
        PaymentError::Storage(e.to_string())
    }
}

fn gateway_reference_key(gateway: GatewayKind, reference: &str) -> String {
    format!("gwref{SEP}{gateway}{SEP}{reference}")
}

fn idempotency_key(key: &str) -> String {
    format!("idem{SEP}{key}")
}

fn order_prefix(order_id: &str) -> String {
    format!("order{SEP}{order_id}{SEP}")
}

fn processed_key(key: &DedupKey) -> String {
    format!("processed{SEP}{}", key.encode())
}

/// A persistent store implementation using RocksDB.
///
/// Transactions, refunds and webhook deliveries live in separate Column
/// Families; lookups by gateway reference, idempotency key, order and dedup
/// key go through the `indexes` family. Check-then-write sequences run under
/// one writer lock and land in a single `WriteBatch`, so uniqueness and
/// version checks hold across concurrent tasks.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_TRANSACTIONS, CF_REFUNDS, CF_WEBHOOK_EVENTS, CF_INDEXES]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::Storage(format!("column family {name} not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn index(&self, key: &str) -> Result<Option<Uuid>> {
        match self.db.get_cf(self.cf(CF_INDEXES)?, key.as_bytes())? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PaymentError::Storage(format!("corrupt index {key}: {e}"))),
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.read(CF_TRANSACTIONS, id.as_bytes())
    }

    fn transactions_for_order(&self, order_id: &str) -> Result<Vec<Transaction>> {
        let prefix = order_prefix(order_id);
        let mut found = Vec::new();
        for (key, _) in self.scan_prefix(CF_INDEXES, prefix.as_bytes())? {
            let id = Uuid::try_parse_ascii(&key[prefix.len()..])
                .map_err(|e| PaymentError::Storage(format!("corrupt order index: {e}")))?;
            if let Some(tx) = self.transaction(id)? {
                found.push(tx);
            }
        }
        Ok(found)
    }

    fn check_version(&self, tx: &Transaction, expected_version: u64) -> Result<()> {
        let current = self
            .transaction(tx.id)?
            .ok_or_else(|| PaymentError::TransactionNotFound(tx.id.to_string()))?;
        if current.version != expected_version {
            return Err(PaymentError::StaleTransaction(tx.id));
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PaymentError::Storage(format!("serialization error: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| PaymentError::Storage(format!("deserialization error: {e}")))
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn insert(&self, tx: Transaction) -> Result<()> {
        let _writer = self.writer.lock().await;

        if let Some(active) = self
            .transactions_for_order(&tx.order_id)?
            .into_iter()
            .find(|t| !t.status.is_terminal())
        {
            return Err(PaymentError::DuplicatePendingPayment {
                order_id: tx.order_id.clone(),
                existing: active.id,
            });
        }
        let reference_key = gateway_reference_key(tx.gateway, &tx.gateway_transaction_id);
        if self.index(&reference_key)?.is_some() {
            return Err(PaymentError::DuplicateGatewayReference {
                gateway: tx.gateway,
                reference: tx.gateway_transaction_id.clone(),
            });
        }
        let idem_key = idempotency_key(&tx.idempotency_key);
        if self.index(&idem_key)?.is_some() {
            return Err(PaymentError::IdempotencyKeyConflict(tx.idempotency_key.clone()));
        }

        let indexes = self.cf(CF_INDEXES)?;
        let id = tx.id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, &id, encode(&tx)?);
        batch.put_cf(indexes, reference_key.as_bytes(), &id);
        batch.put_cf(indexes, idem_key.as_bytes(), &id);
        batch.put_cf(
            indexes,
            format!("{}{}", order_prefix(&tx.order_id), tx.id).as_bytes(),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.transaction(id)
    }

    async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        match self.index(&gateway_reference_key(gateway, gateway_transaction_id))? {
            Some(id) => self.transaction(id),
            None => Ok(None),
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>> {
        match self.index(&idempotency_key(key))? {
            Some(id) => self.transaction(id),
            None => Ok(None),
        }
    }

    async fn find_active_for_order(&self, order_id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .transactions_for_order(order_id)?
            .into_iter()
            .find(|t| !t.status.is_terminal()))
    }

    async fn count_for_order(&self, order_id: &str) -> Result<usize> {
        let prefix = order_prefix(order_id);
        Ok(self.scan_prefix(CF_INDEXES, prefix.as_bytes())?.len())
    }

    async fn update(&self, mut tx: Transaction, expected_version: u64) -> Result<Transaction> {
        let _writer = self.writer.lock().await;
        self.check_version(&tx, expected_version)?;
        tx.version = expected_version + 1;
        self.db
            .put_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes(), encode(&tx)?)?;
        Ok(tx)
    }

    async fn record_refund(
        &self,
        refund: RefundRecord,
        mut tx: Transaction,
        expected_version: u64,
    ) -> Result<Transaction> {
        let _writer = self.writer.lock().await;
        self.check_version(&tx, expected_version)?;
        tx.version = expected_version + 1;

        let mut refund_key = tx.id.as_bytes().to_vec();
        refund_key.extend_from_slice(refund.id.as_bytes());
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_REFUNDS)?, refund_key, encode(&refund)?);
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes(), encode(&tx)?);
        self.db.write(batch)?;
        Ok(tx)
    }

    async fn refunds_for(&self, transaction_id: Uuid) -> Result<Vec<RefundRecord>> {
        let mut refunds = self
            .scan_prefix(CF_REFUNDS, transaction_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode::<RefundRecord>(&value))
            .collect::<Result<Vec<_>>>()?;
        refunds.sort_by_key(|r| r.created_at);
        Ok(refunds)
    }
}

#[async_trait]
impl WebhookEventStore for RocksDBStore {
    async fn insert(&self, event: WebhookEvent) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_WEBHOOK_EVENTS)?, event.id.as_bytes(), encode(&event)?);
        if event.processed
            && let Some(key) = event.dedup_key()
        {
            batch.put_cf(self.cf(CF_INDEXES)?, processed_key(&key).as_bytes(), event.id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>> {
        self.read(CF_WEBHOOK_EVENTS, id.as_bytes())
    }

    async fn update(&self, event: WebhookEvent) -> Result<()> {
        let _writer = self.writer.lock().await;
        let events = self.cf(CF_WEBHOOK_EVENTS)?;
        if self.db.get_pinned_cf(events, event.id.as_bytes())?.is_none() {
            return Err(PaymentError::Storage(format!(
                "webhook event {} does not exist",
                event.id
            )));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(events, event.id.as_bytes(), encode(&event)?);
        if event.processed
            && let Some(key) = event.dedup_key()
        {
            let index_key = processed_key(&key);
            if self.index(&index_key)?.is_none() {
                batch.put_cf(self.cf(CF_INDEXES)?, index_key.as_bytes(), event.id.as_bytes());
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn find_processed(&self, key: &DedupKey) -> Result<Option<WebhookEvent>> {
        match self.index(&processed_key(key))? {
            Some(id) => self.read(CF_WEBHOOK_EVENTS, id.as_bytes()),
            None => Ok(None),
        }
    }
}
