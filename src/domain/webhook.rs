use super::gateway::GatewayKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why an inbound notification did not produce a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    SignatureInvalid,
    Malformed,
    Duplicate,
    UnknownTransaction,
    /// Authentic and well-formed, but the transition it asks for is not
    /// allowed (late failure after completion, amount mismatch, ...).
    NotApplicable,
}

/// A raw provider callback as received, kept for audit and replay safety.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub gateway: GatewayKind,
    pub raw_payload: Vec<u8>,
    pub signature_header: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub rejection: Option<RejectionReason>,
}

impl WebhookEvent {
    pub fn received(gateway: GatewayKind, payload: &[u8], signature: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            gateway,
            raw_payload: payload.to_vec(),
            signature_header: signature.map(str::to_string),
            received_at: Utc::now(),
            processed: false,
            processed_at: None,
            event_type: None,
            gateway_transaction_id: None,
            rejection: None,
        }
    }

    pub fn rejected(mut self, reason: RejectionReason) -> Self {
        self.rejection = Some(reason);
        self
    }

    pub fn mark_processed(&mut self) {
        self.processed = true;
        self.processed_at = Some(Utc::now());
    }

    /// The `(gateway, transaction, event type)` identity used for
    /// at-most-once processing, once the payload has been parsed.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        Some(DedupKey::new(
            self.gateway,
            self.gateway_transaction_id.as_deref()?,
            self.event_type.as_deref()?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub gateway: GatewayKind,
    pub gateway_transaction_id: String,
    pub event_type: String,
}

impl DedupKey {
    pub fn new(gateway: GatewayKind, gateway_transaction_id: &str, event_type: &str) -> Self {
        Self {
            gateway,
            gateway_transaction_id: gateway_transaction_id.to_string(),
            event_type: event_type.to_string(),
        }
    }

    /// Flat string form, used as a storage index key.
    pub fn encode(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.gateway.as_str(),
            self.gateway_transaction_id,
            self.event_type
        )
    }
}
