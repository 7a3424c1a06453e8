//! Provider clients implementing [`PaymentGateway`](crate::domain::gateway::PaymentGateway).

pub mod gcash;
pub mod http;
pub mod maya;
pub mod paypal;
pub mod signature;
pub mod stripe;

pub use gcash::GCashGateway;
pub use maya::MayaGateway;
pub use paypal::PayPalGateway;
pub use stripe::StripeGateway;

use crate::domain::money::Currency;
use crate::error::{PaymentError, Result};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Decodes an authenticated webhook body into the provider's event shape.
pub(crate) fn decode_webhook<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| PaymentError::MalformedWebhook(e.to_string()))
}

pub(crate) fn require_field(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PaymentError::MalformedWebhook(format!("missing {field}"))),
    }
}

pub(crate) fn webhook_currency(code: Option<&str>) -> Result<Option<Currency>> {
    code.map(|c| {
        c.parse::<Currency>()
            .map_err(|_| PaymentError::MalformedWebhook(format!("unknown currency {c}")))
    })
    .transpose()
}

/// Flattens a JSON object of scalars into string metadata.
pub(crate) fn flatten_metadata(value: Option<serde_json::Value>) -> BTreeMap<String, String> {
    let Some(serde_json::Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            serde_json::Value::Bool(b) => Some((k, b.to_string())),
            _ => None,
        })
        .collect()
}
