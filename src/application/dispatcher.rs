use super::locks::KeyedLocks;
use super::orchestrator::PaymentOrchestrator;
use crate::domain::ports::WebhookEventStoreRef;
use crate::domain::transaction::Transition;
use crate::domain::webhook::{DedupKey, RejectionReason, WebhookEvent};
use crate::error::PaymentError;
use std::sync::Arc;
use uuid::Uuid;

/// What happened to one inbound webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// The event was applied (or already reflected) and is now marked processed.
    Processed { event_id: Uuid, transition: Transition },
    /// Authentic event that carries no state change.
    Informational { event_id: Uuid },
    Duplicate { event_id: Uuid },
    /// Kept unprocessed; the transaction may not be visible yet.
    UnknownTransaction { event_id: Uuid },
    /// Authentic but inapplicable; acknowledged so the provider stops retrying.
    NotApplicable { event_id: Uuid, reason: String },
    SignatureInvalid { event_id: Uuid },
    Malformed { event_id: Uuid, reason: String },
    UnknownGateway(String),
    /// A transient failure; the provider should deliver again.
    Deferred { reason: String },
}

impl WebhookOutcome {
    /// HTTP status to answer the provider with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Processed { .. }
            | Self::Informational { .. }
            | Self::Duplicate { .. }
            | Self::UnknownTransaction { .. }
            | Self::NotApplicable { .. } => 200,
            Self::SignatureInvalid { .. } | Self::Malformed { .. } => 400,
            Self::UnknownGateway(_) => 404,
            Self::Deferred { .. } => 500,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Processed { .. } => "processed",
            Self::Informational { .. } => "informational",
            Self::Duplicate { .. } => "duplicate",
            Self::UnknownTransaction { .. } => "unknown_transaction",
            Self::NotApplicable { .. } => "not_applicable",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::Malformed { .. } => "malformed",
            Self::UnknownGateway(_) => "unknown_gateway",
            Self::Deferred { .. } => "deferred",
        }
    }

    pub fn event_id(&self) -> Option<Uuid> {
        match self {
            Self::Processed { event_id, .. }
            | Self::Informational { event_id }
            | Self::Duplicate { event_id }
            | Self::UnknownTransaction { event_id }
            | Self::NotApplicable { event_id, .. }
            | Self::SignatureInvalid { event_id }
            | Self::Malformed { event_id, .. } => Some(*event_id),
            Self::UnknownGateway(_) | Self::Deferred { .. } => None,
        }
    }
}

/// Authenticates, records and applies provider webhooks.
///
/// Every delivery is stored before it is acted on. A delivery is applied at
/// most once per `(gateway, transaction, event type)`: the check, the
/// application and the processed mark run under a lock on that key.
pub struct WebhookDispatcher {
    orchestrator: Arc<PaymentOrchestrator>,
    events: WebhookEventStoreRef,
    locks: KeyedLocks<DedupKey>,
}

impl WebhookDispatcher {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, events: WebhookEventStoreRef) -> Self {
        Self {
            orchestrator,
            events,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn dispatch(
        &self,
        gateway_name: &str,
        signature: Option<&str>,
        payload: &[u8],
    ) -> WebhookOutcome {
        let gateway = match self.orchestrator.gateways().resolve(gateway_name) {
            Ok(gateway) => gateway,
            Err(e) => {
                tracing::warn!(gateway = gateway_name, error = %e, "webhook for unavailable gateway");
                return WebhookOutcome::UnknownGateway(gateway_name.to_string());
            }
        };
        let kind = gateway.kind();
        let mut event = WebhookEvent::received(kind, payload, signature);
        let event_id = event.id;

        let authentic = signature.is_some_and(|sig| gateway.verify_webhook_signature(payload, sig));
        if !authentic {
            tracing::error!(
                gateway = %kind,
                event_id = %event_id,
                signature_present = signature.is_some(),
                "webhook signature verification failed"
            );
            return match self.store(event.rejected(RejectionReason::SignatureInvalid)).await {
                Ok(()) => WebhookOutcome::SignatureInvalid { event_id },
                Err(outcome) => outcome,
            };
        }

        let parsed = match gateway.parse_webhook(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(gateway = %kind, event_id = %event_id, error = %e, "malformed webhook");
                return match self.store(event.rejected(RejectionReason::Malformed)).await {
                    Ok(()) => WebhookOutcome::Malformed {
                        event_id,
                        reason: e.to_string(),
                    },
                    Err(outcome) => outcome,
                };
            }
        };
        event.event_type = Some(parsed.event_type.clone());
        event.gateway_transaction_id = Some(parsed.transaction_id.clone());

        let key = DedupKey::new(kind, &parsed.transaction_id, &parsed.event_type);
        let _guard = self.locks.lock(&key).await;

        match self.events.find_processed(&key).await {
            Ok(Some(original)) => {
                tracing::info!(
                    gateway = %kind,
                    event_type = %parsed.event_type,
                    gateway_transaction_id = %parsed.transaction_id,
                    original_event_id = %original.id,
                    "duplicate webhook acknowledged"
                );
                return match self.store(event.rejected(RejectionReason::Duplicate)).await {
                    Ok(()) => WebhookOutcome::Duplicate { event_id },
                    Err(outcome) => outcome,
                };
            }
            Ok(None) => {}
            Err(e) => return deferred(e),
        }

        if let Err(outcome) = self.store(event.clone()).await {
            return outcome;
        }

        match self.orchestrator.apply_webhook(kind, &parsed).await {
            Ok(transition) => {
                event.mark_processed();
                if let Err(e) = self.events.update(event).await {
                    return deferred(e);
                }
                tracing::info!(
                    gateway = %kind,
                    event_type = %parsed.event_type,
                    gateway_transaction_id = %parsed.transaction_id,
                    applied = transition.is_applied(),
                    "webhook processed"
                );
                if parsed.status.is_none() {
                    WebhookOutcome::Informational { event_id }
                } else {
                    WebhookOutcome::Processed {
                        event_id,
                        transition,
                    }
                }
            }
            Err(PaymentError::TransactionNotFound(reference)) => {
                tracing::warn!(
                    gateway = %kind,
                    event_type = %parsed.event_type,
                    gateway_transaction_id = %reference,
                    "webhook for unknown transaction"
                );
                let event = event.rejected(RejectionReason::UnknownTransaction);
                match self.events.update(event).await {
                    Ok(()) => WebhookOutcome::UnknownTransaction { event_id },
                    Err(e) => deferred(e),
                }
            }
            Err(e) if e.is_retryable() => deferred(e),
            Err(e) => {
                tracing::warn!(
                    gateway = %kind,
                    event_type = %parsed.event_type,
                    gateway_transaction_id = %parsed.transaction_id,
                    error = %e,
                    "webhook not applicable"
                );
                let mut event = event.rejected(RejectionReason::NotApplicable);
                event.mark_processed();
                match self.events.update(event).await {
                    Ok(()) => WebhookOutcome::NotApplicable {
                        event_id,
                        reason: e.to_string(),
                    },
                    Err(store_error) => deferred(store_error),
                }
            }
        }
    }

    async fn store(&self, event: WebhookEvent) -> Result<(), WebhookOutcome> {
        self.events.insert(event).await.map_err(deferred)
    }
}

fn deferred(e: PaymentError) -> WebhookOutcome {
    tracing::error!(error = %e, "webhook deferred, provider should redeliver");
    WebhookOutcome::Deferred {
        reason: e.to_string(),
    }
}
