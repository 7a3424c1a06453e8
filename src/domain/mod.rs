//! Domain layer: payment records, the transaction state machine, and the
//! ports (gateways, stores, outbound sinks) the application layer drives.

pub mod gateway;
pub mod money;
pub mod ports;
pub mod refund;
pub mod transaction;
pub mod webhook;
