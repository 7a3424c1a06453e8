use crate::domain::gateway::GatewayKind;
use crate::error::{PaymentError, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// A 4xx answer from a provider, kept for provider-specific translation.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub body: Value,
}

impl Rejection {
    /// Best-effort human-readable message from common error envelopes.
    pub fn message(&self) -> String {
        let candidates = [
            self.body.pointer("/error/message"),
            self.body.pointer("/message"),
            self.body.pointer("/error_description"),
            self.body.pointer("/details/0/description"),
            self.body.pointer("/error"),
        ];
        candidates
            .into_iter()
            .flatten()
            .find_map(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status.as_u16()))
    }
}

pub enum Reply {
    Success(Value),
    Rejected(Rejection),
}

/// HTTP plumbing shared by the provider clients.
///
/// Every request carries the configured timeout. Transport failures,
/// timeouts, 429 and 5xx answers become `GatewayUnreachable`, which leaves
/// retry decisions to the caller. Other 4xx answers are handed back for
/// provider-specific translation.
#[derive(Debug, Clone)]
pub struct GatewayHttp {
    client: Client,
    gateway: GatewayKind,
    base_url: String,
}

impl GatewayHttp {
    pub fn new(gateway: GatewayKind, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Configuration(format!("{gateway} HTTP client: {e}")))?;
        Ok(Self {
            client,
            gateway,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn send(&self, request: RequestBuilder) -> Result<Reply> {
        let response = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "request timed out"
            } else if e.is_connect() {
                "connection failed"
            } else {
                "request failed"
            };
            tracing::warn!(gateway = %self.gateway, error = %e, "{reason}");
            PaymentError::unreachable(self.gateway, format!("{reason}: {e}"))
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            PaymentError::unreachable(self.gateway, format!("reading response body: {e}"))
        })?;

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(gateway = %self.gateway, status = status.as_u16(), "provider unavailable");
            return Err(PaymentError::unreachable(
                self.gateway,
                format!("provider answered HTTP {}", status.as_u16()),
            ));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_success() {
            Ok(Reply::Success(body))
        } else {
            tracing::debug!(gateway = %self.gateway, status = status.as_u16(), "provider rejected request");
            Ok(Reply::Rejected(Rejection { status, body }))
        }
    }

    /// Deserializes a successful provider body into `T`.
    pub fn decode<T: DeserializeOwned>(&self, body: Value) -> Result<T> {
        serde_json::from_value(body).map_err(|e| {
            PaymentError::rejected(self.gateway, format!("unexpected response shape: {e}"))
        })
    }
}
