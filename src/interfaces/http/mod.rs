//! JSON API consumed by the ordering frontend and the provider webhooks.

pub mod error;
mod handlers;

use crate::application::dispatcher::WebhookDispatcher;
use crate::application::orchestrator::PaymentOrchestrator;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub dispatcher: Arc<WebhookDispatcher>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self {
            orchestrator,
            dispatcher,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // One parameter name per segment: a gateway name on create, a
        // transaction id below it.
        .route("/payments/{id}", post(handlers::create_payment))
        .route("/payments/{id}/status", get(handlers::payment_status))
        .route("/payments/{id}/confirm", post(handlers::confirm_payment))
        .route("/payments/{id}/refund", post(handlers::refund_payment))
        .route("/payments/{id}/refunds", get(handlers::list_refunds))
        .route("/payments/{id}/cancel", post(handlers::cancel_payment))
        .route("/webhooks/{gateway}", post(handlers::receive_webhook))
        .with_state(state)
}
