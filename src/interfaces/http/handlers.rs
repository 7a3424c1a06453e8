use super::AppState;
use crate::application::orchestrator::OrderPayment;
use crate::domain::money::Currency;
use crate::error::{PaymentError, Result};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    order_id: String,
    amount: Decimal,
    currency: String,
    customer_email: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundBody {
    amount: Option<Decimal>,
    reason: Option<String>,
}

/// Decodes a JSON body; an empty body yields the default value.
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| PaymentError::ValidationError(format!("invalid request body: {e}")))
}

fn order_payment(body: &[u8], header_key: Option<String>) -> Result<OrderPayment> {
    let body: CreatePaymentBody = serde_json::from_slice(body)
        .map_err(|e| PaymentError::ValidationError(format!("invalid request body: {e}")))?;
    if body.customer_email.trim().is_empty() {
        return Err(PaymentError::ValidationError(
            "customer_email must not be blank".to_string(),
        ));
    }
    let currency: Currency = body.currency.parse()?;

    Ok(OrderPayment {
        order_id: body.order_id,
        amount: body.amount,
        currency,
        customer_email: body.customer_email,
        description: body.description,
        metadata: body.metadata,
        idempotency_key: body.idempotency_key.or(header_key),
    })
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| PaymentError::TransactionNotFound(id.to_string()))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

pub async fn create_payment(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let kind = state.orchestrator.gateways().resolve(&gateway)?.kind();
    let header_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let order = order_payment(&body, header_key)?;

    let initiated = state.orchestrator.initiate_payment(&order, kind).await?;
    let status = if initiated.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, ok(initiated)))
}

pub async fn payment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let snapshot = state.orchestrator.status(parse_id(&id)?).await?;
    Ok(ok(snapshot))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let snapshot = state.orchestrator.confirm_payment(parse_id(&id)?).await?;
    Ok(ok(snapshot))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let id = parse_id(&id)?;
    let body: RefundBody = parse_body(&body)?;
    let outcome = state.orchestrator.refund(id, body.amount, body.reason).await?;
    Ok(ok(outcome))
}

pub async fn list_refunds(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let refunds = state.orchestrator.refunds(parse_id(&id)?).await?;
    Ok(ok(json!({ "refunds": refunds })))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let snapshot = state.orchestrator.cancel(parse_id(&id)?).await?;
    Ok(ok(snapshot))
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = state
        .orchestrator
        .gateways()
        .resolve(&gateway)
        .ok()
        .and_then(|g| headers.get(g.signature_header()))
        .and_then(|v| v.to_str().ok());

    let outcome = state.dispatcher.dispatch(&gateway, signature, &body).await;
    let status =
        StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "received": status.is_success(),
        "outcome": outcome.label(),
        "event_id": outcome.event_id(),
    });
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_refund_body_means_full_refund() {
        let body: RefundBody = parse_body(b"").unwrap();
        assert!(body.amount.is_none());
        let body: RefundBody = parse_body(br#"{"amount": "100.00", "reason": "spilled"}"#).unwrap();
        assert_eq!(body.amount, Some(Decimal::new(10000, 2)));
    }

    #[test]
    fn test_create_body_requires_customer_email() {
        let missing = br#"{"order_id":"1001","amount":"250","currency":"PHP"}"#;
        assert!(matches!(
            order_payment(missing, None),
            Err(PaymentError::ValidationError(_))
        ));
        let blank = br#"{"order_id":"1001","amount":"250","currency":"PHP","customer_email":"  "}"#;
        assert!(matches!(
            order_payment(blank, None),
            Err(PaymentError::ValidationError(_))
        ));

        let valid = br#"{"order_id":"1001","amount":"250","currency":"php","customer_email":"ana@example.com"}"#;
        let order = order_payment(valid, Some("key-1".to_string())).unwrap();
        assert_eq!(order.currency, Currency::PHP);
        assert_eq!(order.idempotency_key.as_deref(), Some("key-1"));
        assert_eq!(order.description, "");
    }

    #[test]
    fn test_invalid_ids_are_not_found() {
        assert!(matches!(
            parse_id("not-a-uuid"),
            Err(PaymentError::TransactionNotFound(_))
        ));
    }
}
