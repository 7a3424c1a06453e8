use super::locks::KeyedLocks;
use super::registry::GatewayRegistry;
use crate::domain::gateway::{
    CreatePayment, GatewayKind, GatewayStatus, ParsedWebhook, PaymentVerification,
    ProviderRefundStatus, RefundRequest, SharedGateway,
};
use crate::domain::money::{Amount, Currency, to_minor_units};
use crate::domain::ports::{
    CustomerNotice, NoticeKind, NotificationSinkRef, OrderPaymentUpdate, OrderStatusSinkRef,
    TransactionStoreRef,
};
use crate::domain::refund::{RefundRecord, RefundSource, RefundStatus};
use crate::domain::transaction::{
    ClientAction, Transaction, TransactionSnapshot, TransactionStatus, Transition,
};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_VERIFY_RETRIES: u32 = 2;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// A checkout request for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPayment {
    pub order_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub customer_email: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    /// Client-supplied key; derived from the order and attempt number when absent.
    pub idempotency_key: Option<String>,
}

/// Client-facing result of starting a payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentInitiated {
    pub transaction_id: Uuid,
    pub gateway: GatewayKind,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub message: String,
    /// True when an earlier attempt with the same idempotency key was returned.
    #[serde(skip)]
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundOutcome {
    pub transaction_id: Uuid,
    pub refund_id: String,
    pub amount: Decimal,
    pub refund_status: RefundStatus,
    pub status: TransactionStatus,
    pub refunded_amount: Decimal,
    pub remaining: Decimal,
}

/// Provider-observed state, from a status poll or a webhook.
struct StatusReport {
    status: GatewayStatus,
    amount: Option<Decimal>,
    currency: Option<Currency>,
    refunded_total: Option<Decimal>,
    paid_at: Option<DateTime<Utc>>,
    /// Where the report came from; names gateway-sourced refund records.
    source: String,
    /// Fetched from the provider's status endpoint rather than pushed to us.
    polled: bool,
}

impl StatusReport {
    fn from_verification(v: PaymentVerification) -> Self {
        Self {
            status: v.status,
            amount: Some(v.amount),
            currency: Some(v.currency),
            refunded_total: v.refunded_total,
            paid_at: v.paid_at,
            source: "status_poll".to_string(),
            polled: true,
        }
    }

    fn from_webhook(event: &ParsedWebhook, status: GatewayStatus) -> Self {
        Self {
            status,
            amount: event.amount,
            currency: event.currency,
            refunded_total: event.refunded_total,
            paid_at: None,
            source: event.event_type.clone(),
            polled: false,
        }
    }

    fn bare(status: GatewayStatus, source: &str) -> Self {
        Self {
            status,
            amount: None,
            currency: None,
            refunded_total: None,
            paid_at: None,
            source: source.to_string(),
            polled: false,
        }
    }
}

/// Drives payments through their lifecycle.
///
/// Every path that changes a transaction (confirm, refund, cancel, webhook)
/// runs under a per-transaction lock and writes through the store's
/// compare-and-swap, so a status poll racing a webhook applies one
/// transition and triggers one round of side effects.
pub struct PaymentOrchestrator {
    gateways: GatewayRegistry,
    transactions: TransactionStoreRef,
    order_sink: OrderStatusSinkRef,
    notifications: NotificationSinkRef,
    transaction_locks: KeyedLocks<Uuid>,
    order_locks: KeyedLocks<String>,
    verify_retries: u32,
    retry_backoff: Duration,
}

impl PaymentOrchestrator {
    /// Creates a new `PaymentOrchestrator`.
    ///
    /// # Arguments
    ///
    /// * `gateways` - The enabled provider clients.
    /// * `transactions` - Storage for transactions and refunds.
    /// * `order_sink` - Receives every payment status change.
    /// * `notifications` - Queue for customer-facing notices.
    pub fn new(
        gateways: GatewayRegistry,
        transactions: TransactionStoreRef,
        order_sink: OrderStatusSinkRef,
        notifications: NotificationSinkRef,
    ) -> Self {
        Self {
            gateways,
            transactions,
            order_sink,
            notifications,
            transaction_locks: KeyedLocks::new(),
            order_locks: KeyedLocks::new(),
            verify_retries: DEFAULT_VERIFY_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Sets how often a transiently failing status check is retried, and the
    /// first backoff delay (doubled on each attempt).
    pub fn with_verify_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.verify_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    pub async fn initiate_payment(
        &self,
        order: &OrderPayment,
        kind: GatewayKind,
    ) -> Result<PaymentInitiated> {
        let gateway = self.gateways.get(kind)?;
        if order.order_id.trim().is_empty() {
            return Err(PaymentError::ValidationError("order_id is required".to_string()));
        }
        let amount = gateway.validate_charge(order.amount, order.currency)?;

        let _order_guard = self.order_locks.lock(&order.order_id).await;

        if let Some(key) = &order.idempotency_key
            && let Some(existing) = self.transactions.find_by_idempotency_key(key).await?
        {
            if existing.order_id != order.order_id {
                return Err(PaymentError::IdempotencyKeyConflict(key.clone()));
            }
            tracing::info!(
                transaction_id = %existing.id,
                order_id = %order.order_id,
                "replaying payment for repeated idempotency key"
            );
            return Ok(initiated(&existing, "Existing payment returned", true));
        }

        if let Some(active) = self.transactions.find_active_for_order(&order.order_id).await? {
            return Err(PaymentError::DuplicatePendingPayment {
                order_id: order.order_id.clone(),
                existing: active.id,
            });
        }

        let idempotency_key = match &order.idempotency_key {
            Some(key) => key.clone(),
            None => {
                let attempt = self.transactions.count_for_order(&order.order_id).await? + 1;
                format!("{}-{attempt}", order.order_id)
            }
        };

        let request = CreatePayment {
            amount,
            currency: order.currency,
            order_id: order.order_id.clone(),
            customer_email: order.customer_email.clone(),
            description: order.description.clone(),
            metadata: order.metadata.clone(),
            idempotency_key: idempotency_key.clone(),
        };
        let created = gateway.create_payment(&request).await.inspect_err(|e| {
            tracing::warn!(order_id = %order.order_id, gateway = %kind, error = %e, "payment creation failed");
        })?;

        let now = Utc::now();
        let client_action = match (&created.payment_url, &created.client_secret) {
            (Some(url), _) => Some(ClientAction::Redirect { url: url.clone() }),
            (None, Some(secret)) => Some(ClientAction::ClientSecret {
                secret: secret.clone(),
            }),
            (None, None) => None,
        };
        let tx = Transaction {
            id: Uuid::new_v4(),
            gateway_transaction_id: created.gateway_transaction_id.clone(),
            order_id: order.order_id.clone(),
            gateway: kind,
            amount: amount.value(),
            currency: order.currency,
            status: if created.payment_url.is_some() {
                TransactionStatus::AwaitingRedirect
            } else {
                TransactionStatus::Pending
            },
            client_action,
            customer_email: order.customer_email.clone(),
            description: order.description.clone(),
            metadata: order.metadata.clone(),
            refunded_amount: Decimal::ZERO,
            idempotency_key,
            created_at: now,
            updated_at: now,
            paid_at: None,
            version: 0,
        };
        self.transactions.insert(tx.clone()).await?;
        tracing::info!(
            transaction_id = %tx.id,
            order_id = %tx.order_id,
            gateway = %kind,
            status = %tx.status,
            "payment initiated"
        );

        // Some providers settle instantly.
        let tx = match created.status {
            GatewayStatus::Succeeded | GatewayStatus::Failed | GatewayStatus::Cancelled => {
                let _guard = self.transaction_locks.lock(&tx.id).await;
                let report = StatusReport::bare(created.status, "create");
                self.apply_status(tx, report).await?.0
            }
            _ => tx,
        };

        Ok(initiated(&tx, &created.message, false))
    }

    /// Polls the provider and applies what it reports. Terminal transactions
    /// are returned as they are, without a provider call.
    pub async fn confirm_payment(&self, id: Uuid) -> Result<TransactionSnapshot> {
        let _guard = self.transaction_locks.lock(&id).await;
        let tx = self.load(id).await?;
        if tx.status.is_terminal() {
            return Ok(tx.snapshot());
        }

        let gateway = self.gateways.get(tx.gateway)?;
        let verification = self
            .verify_with_retry(&gateway, &tx.gateway_transaction_id)
            .await?;
        let (tx, _) = self
            .apply_status(tx, StatusReport::from_verification(verification))
            .await?;
        Ok(tx.snapshot())
    }

    pub async fn refund(
        &self,
        id: Uuid,
        amount: Option<Decimal>,
        reason: Option<String>,
    ) -> Result<RefundOutcome> {
        let _guard = self.transaction_locks.lock(&id).await;
        let mut tx = self.load(id).await?;
        match tx.status {
            TransactionStatus::Refunded => return Err(PaymentError::AlreadyRefunded),
            status if !status.is_refundable() => {
                return Err(PaymentError::TransactionNotRefundable(format!(
                    "transaction is {status}"
                )));
            }
            _ => {}
        }

        let remaining = tx.remaining_refundable();
        let requested = match amount {
            Some(value) => Amount::new(value)?,
            None => Amount::new(remaining)?,
        };
        if requested.value() > remaining {
            return Err(PaymentError::RefundExceedsAmount {
                requested: requested.value(),
                remaining,
            });
        }
        to_minor_units(requested.value(), tx.currency)?;

        let gateway = self.gateways.get(tx.gateway)?;
        let receipt = gateway
            .refund_payment(&RefundRequest {
                gateway_transaction_id: tx.gateway_transaction_id.clone(),
                amount: Some(requested),
                currency: tx.currency,
                reason: reason.clone(),
            })
            .await?;

        let refund_status = match receipt.status {
            ProviderRefundStatus::Pending => RefundStatus::Pending,
            ProviderRefundStatus::Completed => RefundStatus::Completed,
            ProviderRefundStatus::Failed => RefundStatus::Failed,
        };
        let record = RefundRecord::new(
            tx.id,
            receipt.refund_id.clone(),
            requested.value(),
            reason,
            refund_status,
            RefundSource::Api,
        );

        let version = tx.version;
        let transition = if record.counts_against_amount() {
            let total = tx.refunded_amount + requested.value();
            let transition = tx.transition_to(tx.refund_status_for(total))?;
            tx.refunded_amount = total;
            transition
        } else {
            Transition::Unchanged(tx.status)
        };

        let tx = self
            .transactions
            .record_refund(record, tx, version)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    transaction_id = %id,
                    refund_id = %receipt.refund_id,
                    error = %e,
                    "refund accepted by provider but not recorded"
                );
            })?;
        tracing::info!(
            transaction_id = %tx.id,
            refund_id = %receipt.refund_id,
            amount = %requested,
            status = %tx.status,
            "refund recorded"
        );
        self.notify(&tx, transition, requested.value()).await;

        Ok(RefundOutcome {
            transaction_id: tx.id,
            refund_id: receipt.refund_id,
            amount: requested.value(),
            refund_status,
            status: tx.status,
            refunded_amount: tx.refunded_amount,
            remaining: tx.remaining_refundable(),
        })
    }

    pub async fn cancel(&self, id: Uuid) -> Result<TransactionSnapshot> {
        let _guard = self.transaction_locks.lock(&id).await;
        let tx = self.load(id).await?;
        if !tx.status.is_open() {
            return Err(PaymentError::AlreadyFinalized(format!(
                "transaction is {}",
                tx.status
            )));
        }

        let gateway = self.gateways.get(tx.gateway)?;
        let receipt = gateway.cancel_payment(&tx.gateway_transaction_id).await?;
        if receipt.status != GatewayStatus::Cancelled {
            return Err(PaymentError::AlreadyFinalized(receipt.message));
        }
        let (tx, _) = self
            .apply_status(tx, StatusReport::bare(GatewayStatus::Cancelled, "cancel"))
            .await?;
        Ok(tx.snapshot())
    }

    pub async fn status(&self, id: Uuid) -> Result<TransactionSnapshot> {
        Ok(self.load(id).await?.snapshot())
    }

    pub async fn refunds(&self, id: Uuid) -> Result<Vec<RefundRecord>> {
        self.transactions.refunds_for(id).await
    }

    /// Applies an authenticated, parsed webhook to the transaction it names.
    pub async fn apply_webhook(&self, kind: GatewayKind, event: &ParsedWebhook) -> Result<Transition> {
        let found = self
            .transactions
            .find_by_gateway_reference(kind, &event.transaction_id)
            .await?
            .ok_or_else(|| PaymentError::TransactionNotFound(event.transaction_id.clone()))?;
        let Some(status) = event.status else {
            return Ok(Transition::Unchanged(found.status));
        };

        let _guard = self.transaction_locks.lock(&found.id).await;
        let tx = self.load(found.id).await?;
        let (_, transition) = self
            .apply_status(tx, StatusReport::from_webhook(event, status))
            .await?;
        Ok(transition)
    }

    async fn load(&self, id: Uuid) -> Result<Transaction> {
        self.transactions
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::TransactionNotFound(id.to_string()))
    }

    async fn verify_with_retry(
        &self,
        gateway: &SharedGateway,
        gateway_transaction_id: &str,
    ) -> Result<PaymentVerification> {
        let mut attempt = 0;
        loop {
            match gateway.verify_payment(gateway_transaction_id).await {
                Err(e) if e.is_retryable() && attempt < self.verify_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        gateway = %gateway.kind(),
                        gateway_transaction_id,
                        attempt = attempt + 1,
                        error = %e,
                        "status check failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Maps a provider status onto the state machine. Callers hold the
    /// transaction lock.
    async fn apply_status(
        &self,
        mut tx: Transaction,
        report: StatusReport,
    ) -> Result<(Transaction, Transition)> {
        match report.status {
            GatewayStatus::Pending => {
                let current = tx.status;
                Ok((tx, Transition::Unchanged(current)))
            }
            GatewayStatus::Succeeded => {
                // A late success after refunds is old news.
                if matches!(
                    tx.status,
                    TransactionStatus::PartiallyRefunded | TransactionStatus::Refunded
                ) {
                    let current = tx.status;
                    return Ok((tx, Transition::Unchanged(current)));
                }
                check_amount(&tx, &report)?;
                if tx.status.is_open() {
                    tx.paid_at = report.paid_at.or(tx.paid_at);
                }
                let amount = tx.amount;
                self.persist_transition(tx, TransactionStatus::Completed, amount)
                    .await
            }
            GatewayStatus::Failed => {
                let amount = tx.amount;
                self.persist_transition(tx, TransactionStatus::Failed, amount)
                    .await
            }
            GatewayStatus::Cancelled => {
                let amount = tx.amount;
                self.persist_transition(tx, TransactionStatus::Cancelled, amount)
                    .await
            }
            GatewayStatus::Refunded => self.reconcile_refund(tx, report).await,
        }
    }

    async fn persist_transition(
        &self,
        mut tx: Transaction,
        target: TransactionStatus,
        notice_amount: Decimal,
    ) -> Result<(Transaction, Transition)> {
        let version = tx.version;
        let transition = tx.transition_to(target)?;
        if !transition.is_applied() {
            return Ok((tx, transition));
        }
        let tx = self.transactions.update(tx, version).await?;
        tracing::info!(
            transaction_id = %tx.id,
            order_id = %tx.order_id,
            gateway = %tx.gateway,
            status = %tx.status,
            "transaction updated"
        );
        self.notify(&tx, transition, notice_amount).await;
        Ok((tx, transition))
    }

    /// Brings `refunded_amount` up to the provider's cumulative figure and
    /// records the difference as a gateway-sourced refund.
    async fn reconcile_refund(
        &self,
        mut tx: Transaction,
        report: StatusReport,
    ) -> Result<(Transaction, Transition)> {
        let total = match report.refunded_total {
            Some(total) => total,
            None => self.provider_refunded_total(&tx, &report).await?,
        };
        if total > tx.amount {
            return Err(PaymentError::RefundExceedsAmount {
                requested: total,
                remaining: tx.remaining_refundable(),
            });
        }
        if total <= tx.refunded_amount {
            let current = tx.status;
            return Ok((tx, Transition::Unchanged(current)));
        }
        // Refunded before we saw the payment complete.
        if tx.status.is_open() {
            let amount = tx.amount;
            tx = self
                .persist_transition(tx, TransactionStatus::Completed, amount)
                .await?
                .0;
        }

        let delta = total - tx.refunded_amount;
        let version = tx.version;
        let transition = tx.transition_to(tx.refund_status_for(total))?;
        tx.refunded_amount = total;
        let record = RefundRecord::new(
            tx.id,
            format!("{}:{}", tx.gateway, report.source),
            delta,
            None,
            RefundStatus::Completed,
            RefundSource::Gateway,
        );
        let tx = self.transactions.record_refund(record, tx, version).await?;
        tracing::info!(
            transaction_id = %tx.id,
            refunded_amount = %tx.refunded_amount,
            status = %tx.status,
            "provider refund reconciled"
        );
        self.notify(&tx, transition, delta).await;
        Ok((tx, transition))
    }

    /// Asks the provider for its cumulative refunded amount when a refund
    /// report arrived without one. Never assumes a full refund.
    async fn provider_refunded_total(
        &self,
        tx: &Transaction,
        report: &StatusReport,
    ) -> Result<Decimal> {
        let missing = || {
            PaymentError::rejected(
                tx.gateway,
                format!("{} reported a refund without a cumulative total", report.source),
            )
        };
        if report.polled {
            return Err(missing());
        }
        let gateway = self.gateways.get(tx.gateway)?;
        let verification = self
            .verify_with_retry(&gateway, &tx.gateway_transaction_id)
            .await?;
        if verification.currency != tx.currency {
            return Err(PaymentError::AmountMismatch {
                expected: tx.amount,
                expected_currency: tx.currency,
                reported: verification.amount,
                reported_currency: verification.currency,
            });
        }
        tracing::debug!(
            transaction_id = %tx.id,
            refunded_total = ?verification.refunded_total,
            "refund total resolved from provider"
        );
        verification.refunded_total.ok_or_else(missing)
    }

    /// Informs the order subsystem and the customer. Failures are logged;
    /// the persisted transition stands.
    async fn notify(&self, tx: &Transaction, transition: Transition, amount: Decimal) {
        let Transition::Applied { to, .. } = transition else {
            return;
        };
        if tx.status.is_open() {
            return;
        }

        let update = OrderPaymentUpdate {
            order_id: tx.order_id.clone(),
            transaction_id: tx.id,
            gateway: tx.gateway,
            status: to,
            amount: tx.amount,
            refunded_amount: tx.refunded_amount,
            currency: tx.currency,
        };
        if let Err(e) = self.order_sink.payment_status_changed(update).await {
            tracing::error!(transaction_id = %tx.id, order_id = %tx.order_id, error = %e, "order status update failed");
        }

        let kind = match to {
            TransactionStatus::Completed => NoticeKind::PaymentReceived,
            TransactionStatus::Failed => NoticeKind::PaymentFailed,
            TransactionStatus::PartiallyRefunded | TransactionStatus::Refunded => {
                NoticeKind::RefundIssued
            }
            _ => return,
        };
        if tx.customer_email.is_empty() {
            return;
        }
        let notice = CustomerNotice {
            kind,
            customer_email: tx.customer_email.clone(),
            order_id: tx.order_id.clone(),
            transaction_id: tx.id,
            amount,
            currency: tx.currency,
        };
        if let Err(e) = self.notifications.enqueue(notice).await {
            tracing::error!(transaction_id = %tx.id, error = %e, "customer notification failed");
        }
    }
}

fn check_amount(tx: &Transaction, report: &StatusReport) -> Result<()> {
    let reported_currency = report.currency.unwrap_or(tx.currency);
    let Some(reported) = report.amount else {
        return Ok(());
    };
    if reported != tx.amount || reported_currency != tx.currency {
        return Err(PaymentError::AmountMismatch {
            expected: tx.amount,
            expected_currency: tx.currency,
            reported,
            reported_currency,
        });
    }
    Ok(())
}

fn initiated(tx: &Transaction, message: &str, replayed: bool) -> PaymentInitiated {
    let (payment_url, client_secret) = match &tx.client_action {
        Some(ClientAction::Redirect { url }) => (Some(url.clone()), None),
        Some(ClientAction::ClientSecret { secret }) => (None, Some(secret.clone())),
        None => (None, None),
    };
    PaymentInitiated {
        transaction_id: tx.id,
        gateway: tx.gateway,
        status: tx.status,
        payment_url,
        client_secret,
        message: message.to_string(),
        replayed,
    }
}
