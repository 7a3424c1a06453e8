mod common;

use async_trait::async_trait;
use cafe_payments::application::dispatcher::{WebhookDispatcher, WebhookOutcome};
use cafe_payments::application::orchestrator::PaymentOrchestrator;
use cafe_payments::application::registry::GatewayRegistry;
use cafe_payments::domain::gateway::{GatewayKind, GatewayStatus, PaymentVerification};
use cafe_payments::domain::ports::TransactionStore;
use cafe_payments::domain::refund::{RefundRecord, RefundSource};
use cafe_payments::domain::transaction::{Transaction, TransactionStatus, Transition};
use cafe_payments::domain::webhook::RejectionReason;
use cafe_payments::error::{PaymentError, Result};
use cafe_payments::infrastructure::in_memory::{
    InMemoryTransactionStore, InMemoryWebhookEventStore,
};
use common::{FakeGateway, Harness, RecordingSink, order, sign, verification, webhook_body};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

async fn awaiting(h: &Harness, order_id: &str) -> Transaction {
    let initiated = h
        .orchestrator
        .initiate_payment(&order(order_id, dec!(250)), GatewayKind::GCash)
        .await
        .unwrap();
    h.transactions
        .get(initiated.transaction_id)
        .await
        .unwrap()
        .unwrap()
}

// GCash ₱250 for order 1001, then `payment.completed`, then a duplicate.
#[tokio::test]
async fn test_completion_webhook_then_duplicate() {
    let h = Harness::new();
    let tx = awaiting(&h, "1001").await;
    assert_eq!(tx.status, TransactionStatus::AwaitingRedirect);

    let body = webhook_body(
        "payment.completed",
        &tx.gateway_transaction_id,
        json!({ "amount": "250.00", "currency": "PHP" }),
    );
    let outcome = h.deliver(&body).await;
    assert!(matches!(
        outcome,
        WebhookOutcome::Processed {
            transition: Transition::Applied {
                to: TransactionStatus::Completed,
                ..
            },
            ..
        }
    ));
    assert_eq!(outcome.status_code(), 200);

    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert!(stored.paid_at.is_some());
    assert_eq!(h.sink.updates().len(), 1);

    let duplicate = h.deliver(&body).await;
    assert!(matches!(duplicate, WebhookOutcome::Duplicate { .. }));
    assert_eq!(duplicate.status_code(), 200);
    assert_eq!(h.sink.updates().len(), 1);
    assert_eq!(h.sink.notices().len(), 1);

    let events = h.events.all().await;
    assert_eq!(events.len(), 2);
    assert!(events[0].processed);
    assert_eq!(events[1].rejection, Some(RejectionReason::Duplicate));
}

#[tokio::test]
async fn test_tampered_payload_is_rejected() {
    let h = Harness::new();
    let tx = awaiting(&h, "1002").await;

    let body = webhook_body("payment.completed", &tx.gateway_transaction_id, json!({}));
    let signature = sign(&body);
    let tampered = webhook_body("payment.completed", &tx.gateway_transaction_id, json!({"x": 1}));

    let outcome = h
        .dispatcher
        .dispatch("gcash", Some(&signature), &tampered)
        .await;
    assert!(matches!(outcome, WebhookOutcome::SignatureInvalid { .. }));
    assert_eq!(outcome.status_code(), 400);

    let missing = h.dispatcher.dispatch("gcash", None, &body).await;
    assert!(matches!(missing, WebhookOutcome::SignatureInvalid { .. }));

    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::AwaitingRedirect);
    assert!(h.sink.updates().is_empty());

    let events = h.events.all().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| !e.processed));
    assert!(
        events
            .iter()
            .all(|e| e.rejection == Some(RejectionReason::SignatureInvalid))
    );
    // Raw bytes are kept for audit.
    assert_eq!(events[0].raw_payload, tampered);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let h = Harness::new();
    let body = b"{not json".to_vec();
    let outcome = h.deliver(&body).await;

    assert!(matches!(outcome, WebhookOutcome::Malformed { .. }));
    assert_eq!(outcome.status_code(), 400);
    let events = h.events.all().await;
    assert_eq!(events[0].rejection, Some(RejectionReason::Malformed));
}

#[tokio::test]
async fn test_unknown_gateway_is_not_found() {
    let h = Harness::new();
    let outcome = h.dispatcher.dispatch("bitcoin", Some("sig"), b"{}").await;
    assert_eq!(outcome, WebhookOutcome::UnknownGateway("bitcoin".to_string()));
    assert_eq!(outcome.status_code(), 404);

    // Known but not enabled in this deployment.
    let disabled = h.dispatcher.dispatch("maya", Some("sig"), b"{}").await;
    assert_eq!(disabled.status_code(), 404);
    assert!(h.events.all().await.is_empty());
}

#[tokio::test]
async fn test_unknown_transaction_is_acknowledged_and_kept_unprocessed() {
    let h = Harness::new();
    let body = webhook_body("payment.completed", "gc_missing", json!({}));

    let outcome = h.deliver(&body).await;
    assert!(matches!(outcome, WebhookOutcome::UnknownTransaction { .. }));
    assert_eq!(outcome.status_code(), 200);

    let events = h.events.all().await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].processed);
    assert_eq!(events[0].rejection, Some(RejectionReason::UnknownTransaction));

    // A redelivery is not treated as a duplicate.
    let again = h.deliver(&body).await;
    assert!(matches!(again, WebhookOutcome::UnknownTransaction { .. }));
}

#[tokio::test]
async fn test_informational_and_pending_events() {
    let h = Harness::new();
    let tx = awaiting(&h, "1003").await;

    let viewed = webhook_body("checkout.viewed", &tx.gateway_transaction_id, json!({}));
    assert!(matches!(
        h.deliver(&viewed).await,
        WebhookOutcome::Informational { .. }
    ));

    let pending = webhook_body("payment.pending", &tx.gateway_transaction_id, json!({}));
    assert!(matches!(
        h.deliver(&pending).await,
        WebhookOutcome::Processed {
            transition: Transition::Unchanged(TransactionStatus::AwaitingRedirect),
            ..
        }
    ));
    assert!(h.sink.updates().is_empty());
}

#[tokio::test]
async fn test_late_failure_after_completion_is_not_applicable() {
    let h = Harness::new();
    let tx = awaiting(&h, "1004").await;
    let reference = tx.gateway_transaction_id.clone();

    h.deliver(&webhook_body("payment.completed", &reference, json!({})))
        .await;
    let outcome = h
        .deliver(&webhook_body("payment.failed", &reference, json!({})))
        .await;

    assert!(matches!(outcome, WebhookOutcome::NotApplicable { .. }));
    assert_eq!(outcome.status_code(), 200);
    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert_eq!(h.sink.updates().len(), 1);
}

#[tokio::test]
async fn test_amount_mismatch_is_not_applied() {
    let h = Harness::new();
    let tx = awaiting(&h, "1005").await;

    let outcome = h
        .deliver(&webhook_body(
            "payment.completed",
            &tx.gateway_transaction_id,
            json!({ "amount": "25.00", "currency": "PHP" }),
        ))
        .await;
    assert!(matches!(outcome, WebhookOutcome::NotApplicable { .. }));
    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::AwaitingRedirect);
}

#[tokio::test]
async fn test_provider_refund_is_reconciled() {
    let h = Harness::new();
    let tx = awaiting(&h, "1006").await;
    let reference = tx.gateway_transaction_id.clone();
    h.deliver(&webhook_body("payment.completed", &reference, json!({})))
        .await;

    let outcome = h
        .deliver(&webhook_body(
            "payment.refunded",
            &reference,
            json!({ "refunded_total": "100.00" }),
        ))
        .await;
    assert!(matches!(
        outcome,
        WebhookOutcome::Processed {
            transition: Transition::Applied {
                to: TransactionStatus::PartiallyRefunded,
                ..
            },
            ..
        }
    ));

    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.refunded_amount, dec!(100));
    let refunds = h.orchestrator.refunds(tx.id).await.unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].source, RefundSource::Gateway);
    assert_eq!(refunds[0].amount, dec!(100));

    // An API refund afterwards only sees what is left.
    assert!(matches!(
        h.orchestrator.refund(tx.id, Some(dec!(200)), None).await,
        Err(PaymentError::RefundExceedsAmount { .. })
    ));
}

#[tokio::test]
async fn test_full_refund_before_completion_completes_first() {
    let h = Harness::new();
    let tx = awaiting(&h, "1007").await;
    h.gateway.push_verification(Ok(PaymentVerification {
        refunded_total: Some(dec!(250)),
        ..verification(&tx.gateway_transaction_id, GatewayStatus::Refunded, dec!(250))
    }));

    h.deliver(&webhook_body(
        "payment.refunded",
        &tx.gateway_transaction_id,
        json!({}),
    ))
    .await;

    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Refunded);
    assert_eq!(stored.refunded_amount, dec!(250));
    let statuses: Vec<_> = h.sink.updates().into_iter().map(|u| u.status).collect();
    assert_eq!(
        statuses,
        vec![TransactionStatus::Completed, TransactionStatus::Refunded]
    );
}

#[tokio::test]
async fn test_refund_event_without_total_asks_the_provider() {
    let h = Harness::new();
    let tx = awaiting(&h, "1010").await;
    let reference = tx.gateway_transaction_id.clone();
    h.deliver(&webhook_body("payment.completed", &reference, json!({})))
        .await;
    h.orchestrator
        .refund(tx.id, Some(dec!(100)), None)
        .await
        .unwrap();
    h.gateway.push_verification(Ok(PaymentVerification {
        refunded_total: Some(dec!(100)),
        ..verification(&reference, GatewayStatus::Refunded, dec!(250))
    }));

    // Announces the ₱100 refund already recorded; it is not a full refund.
    let outcome = h
        .deliver(&webhook_body(
            "payment.refunded",
            &reference,
            json!({ "amount": "100.00", "currency": "PHP" }),
        ))
        .await;
    assert!(matches!(
        outcome,
        WebhookOutcome::Processed {
            transition: Transition::Unchanged(TransactionStatus::PartiallyRefunded),
            ..
        }
    ));
    assert_eq!(FakeGateway::calls(&h.gateway.verify_calls), 1);

    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::PartiallyRefunded);
    assert_eq!(stored.refunded_amount, dec!(100));
    assert_eq!(h.orchestrator.refunds(tx.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_refund_event_with_no_known_total_changes_nothing() {
    let h = Harness::new();
    let tx = awaiting(&h, "1011").await;
    let reference = tx.gateway_transaction_id.clone();
    h.deliver(&webhook_body("payment.completed", &reference, json!({})))
        .await;
    h.gateway.push_verification(Ok(verification(
        &reference,
        GatewayStatus::Refunded,
        dec!(250),
    )));

    let outcome = h
        .deliver(&webhook_body("payment.refunded", &reference, json!({})))
        .await;
    assert!(matches!(outcome, WebhookOutcome::NotApplicable { .. }));
    assert_eq!(outcome.status_code(), 200);

    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert_eq!(stored.refunded_amount, dec!(0));
    assert!(h.orchestrator.refunds(tx.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_refund_lookup_outage_defers_the_event() {
    let h = Harness::new();
    let tx = awaiting(&h, "1012").await;
    let reference = tx.gateway_transaction_id.clone();
    h.deliver(&webhook_body("payment.completed", &reference, json!({})))
        .await;
    for _ in 0..3 {
        h.gateway.push_verification(Err(PaymentError::GatewayUnreachable {
            gateway: GatewayKind::GCash,
            message: "timeout".to_string(),
        }));
    }

    let outcome = h
        .deliver(&webhook_body("payment.refunded", &reference, json!({})))
        .await;
    assert!(matches!(outcome, WebhookOutcome::Deferred { .. }));
    assert_eq!(outcome.status_code(), 500);
    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_duplicate_deliveries_apply_once() {
    let h = Arc::new(Harness::new());
    let tx = awaiting(&h, "1008").await;
    let body = webhook_body("payment.completed", &tx.gateway_transaction_id, json!({}));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move { h.deliver(&body).await }));
    }
    let mut processed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            WebhookOutcome::Processed { .. } => processed += 1,
            WebhookOutcome::Duplicate { .. } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(h.sink.updates().len(), 1);
    let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
}

/// Transaction store whose reads can be switched to fail.
struct FlakyStore {
    inner: InMemoryTransactionStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PaymentError::Storage("database unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for FlakyStore {
    async fn insert(&self, tx: Transaction) -> Result<()> {
        self.inner.insert(tx).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.inner.get(id).await
    }

    async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        self.check()?;
        self.inner
            .find_by_gateway_reference(gateway, gateway_transaction_id)
            .await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn find_active_for_order(&self, order_id: &str) -> Result<Option<Transaction>> {
        self.inner.find_active_for_order(order_id).await
    }

    async fn count_for_order(&self, order_id: &str) -> Result<usize> {
        self.inner.count_for_order(order_id).await
    }

    async fn update(&self, tx: Transaction, expected_version: u64) -> Result<Transaction> {
        self.inner.update(tx, expected_version).await
    }

    async fn record_refund(
        &self,
        refund: RefundRecord,
        tx: Transaction,
        expected_version: u64,
    ) -> Result<Transaction> {
        self.inner.record_refund(refund, tx, expected_version).await
    }

    async fn refunds_for(&self, transaction_id: Uuid) -> Result<Vec<RefundRecord>> {
        self.inner.refunds_for(transaction_id).await
    }
}

#[tokio::test]
async fn test_transient_failure_defers_then_redelivery_applies() {
    let gateway = Arc::new(FakeGateway::gcash());
    let store = Arc::new(FlakyStore {
        inner: InMemoryTransactionStore::new(),
        down: AtomicBool::new(false),
    });
    let events = InMemoryWebhookEventStore::new();
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        GatewayRegistry::new().with(gateway.clone()),
        store.clone(),
        sink.clone(),
        sink.clone(),
    ));
    let dispatcher = WebhookDispatcher::new(orchestrator.clone(), Arc::new(events.clone()));

    let initiated = orchestrator
        .initiate_payment(&order("1009", dec!(250)), GatewayKind::GCash)
        .await
        .unwrap();
    let reference = store
        .get(initiated.transaction_id)
        .await
        .unwrap()
        .unwrap()
        .gateway_transaction_id;
    let body = webhook_body("payment.completed", &reference, json!({}));

    store.down.store(true, Ordering::SeqCst);
    let outcome = dispatcher.dispatch("gcash", Some(&sign(&body)), &body).await;
    assert!(matches!(outcome, WebhookOutcome::Deferred { .. }));
    assert_eq!(outcome.status_code(), 500);
    assert!(sink.updates().is_empty());

    store.down.store(false, Ordering::SeqCst);
    let retried = dispatcher.dispatch("gcash", Some(&sign(&body)), &body).await;
    assert!(matches!(retried, WebhookOutcome::Processed { .. }));
    assert_eq!(sink.updates().len(), 1);
}
