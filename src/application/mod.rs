//! Application layer: payment lifecycle orchestration and webhook handling.
//!
//! `PaymentOrchestrator` owns the state machine side of every payment and
//! `WebhookDispatcher` feeds provider callbacks into it. Both reach providers
//! through the `GatewayRegistry` and persist through the domain ports.

pub mod dispatcher;
pub mod locks;
pub mod orchestrator;
pub mod registry;
