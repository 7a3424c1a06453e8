use crate::config::Settings;
use crate::domain::gateway::{GatewayKind, SharedGateway};
use crate::error::{PaymentError, Result};
use crate::infrastructure::gateways::{GCashGateway, MayaGateway, PayPalGateway, StripeGateway};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Enabled gateway clients, keyed by kind.
///
/// A kind that is known but absent from the registry was disabled in
/// configuration; lookups report it as `GatewayDisabled` rather than
/// `UnknownGateway`.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    gateways: BTreeMap<GatewayKind, SharedGateway>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a client for every gateway enabled in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout = settings.http.timeout();
        let g = &settings.gateways;
        let mut registry = Self::new();
        if g.gcash.enabled {
            registry.register(Arc::new(GCashGateway::new(&g.gcash, timeout)?));
        }
        if g.maya.enabled {
            registry.register(Arc::new(MayaGateway::new(&g.maya, timeout)?));
        }
        if g.stripe.enabled {
            registry.register(Arc::new(StripeGateway::new(&g.stripe, timeout)?));
        }
        if g.paypal.enabled {
            registry.register(Arc::new(PayPalGateway::new(&g.paypal, timeout)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, gateway: SharedGateway) {
        self.gateways.insert(gateway.kind(), gateway);
    }

    pub fn with(mut self, gateway: SharedGateway) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, kind: GatewayKind) -> Result<SharedGateway> {
        self.gateways
            .get(&kind)
            .cloned()
            .ok_or(PaymentError::GatewayDisabled(kind))
    }

    /// Looks a gateway up by its route name, e.g. `"gcash"`.
    pub fn resolve(&self, name: &str) -> Result<SharedGateway> {
        self.get(name.parse()?)
    }

    pub fn kinds(&self) -> Vec<GatewayKind> {
        self.gateways.keys().copied().collect()
    }
}
