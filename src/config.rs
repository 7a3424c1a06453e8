//! Service configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `CAFE_PAYMENTS_`-prefixed environment variables (`__` separates nested
//! keys, e.g. `CAFE_PAYMENTS_GATEWAYS__STRIPE__SECRET_KEY`). Each gateway's
//! secrets are handed to its client constructor; nothing reads them from
//! global state afterwards.

use crate::domain::gateway::GatewayKind;
use crate::error::{PaymentError, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "CAFE_PAYMENTS_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub http: HttpSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub callbacks: CallbackSettings,
    pub gateways: GatewaySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Upper bound for every outbound gateway call.
    pub timeout_secs: u64,
    /// Extra attempts for read-only status checks that fail transiently.
    pub verify_retries: u32,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            verify_retries: 2,
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.clamp(1, 60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Path of the RocksDB directory; in-memory storage when unset.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    /// Endpoint of the order service receiving payment status changes.
    pub order_status_url: Option<String>,
    /// Endpoint of the notification queue.
    pub notification_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub gcash: GCashSettings,
    pub maya: MayaSettings,
    pub stripe: StripeSettings,
    pub paypal: PayPalSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GCashSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub merchant_id: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub failure_url: String,
}

impl Default for GCashSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.gcash.com".to_string(),
            api_key: String::new(),
            merchant_id: String::new(),
            webhook_secret: String::new(),
            success_url: String::new(),
            failure_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MayaSettings {
    /// Off by default: the checkout flow is only switched on per deployment.
    pub enabled: bool,
    pub base_url: String,
    pub public_key: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub failure_url: String,
    pub cancel_url: String,
}

impl Default for MayaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://pg.maya.ph".to_string(),
            public_key: String::new(),
            secret_key: String::new(),
            webhook_secret: String::new(),
            success_url: String::new(),
            failure_url: String::new(),
            cancel_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StripeSettings {
    pub enabled: bool,
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
}

impl Default for StripeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.stripe.com".to_string(),
            secret_key: String::new(),
            webhook_secret: String::new(),
            webhook_tolerance_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayPalSettings {
    pub enabled: bool,
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub webhook_secret: String,
    pub return_url: String,
    pub cancel_url: String,
}

impl Default for PayPalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api-m.paypal.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            webhook_id: String::new(),
            webhook_secret: String::new(),
            return_url: String::new(),
            cancel_url: String::new(),
        }
    }
}

impl Settings {
    /// Loads defaults, then `path` if it exists, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path
            && path.exists()
        {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        figment
            .extract()
            .map_err(|e| PaymentError::Configuration(e.to_string()))
    }

    pub fn enabled_gateways(&self) -> Vec<GatewayKind> {
        GatewayKind::ALL
            .into_iter()
            .filter(|kind| self.gateways.is_enabled(*kind))
            .collect()
    }

    /// Fails if any enabled gateway is missing a required value. Every
    /// missing field is reported at once.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        let g = &self.gateways;

        if g.gcash.enabled {
            require(&mut missing, "gcash", "base_url", &g.gcash.base_url);
            require(&mut missing, "gcash", "api_key", &g.gcash.api_key);
            require(&mut missing, "gcash", "merchant_id", &g.gcash.merchant_id);
            require(&mut missing, "gcash", "webhook_secret", &g.gcash.webhook_secret);
        }
        if g.maya.enabled {
            require(&mut missing, "maya", "base_url", &g.maya.base_url);
            require(&mut missing, "maya", "public_key", &g.maya.public_key);
            require(&mut missing, "maya", "secret_key", &g.maya.secret_key);
            require(&mut missing, "maya", "webhook_secret", &g.maya.webhook_secret);
        }
        if g.stripe.enabled {
            require(&mut missing, "stripe", "base_url", &g.stripe.base_url);
            require(&mut missing, "stripe", "secret_key", &g.stripe.secret_key);
            require(&mut missing, "stripe", "webhook_secret", &g.stripe.webhook_secret);
        }
        if g.paypal.enabled {
            require(&mut missing, "paypal", "base_url", &g.paypal.base_url);
            require(&mut missing, "paypal", "client_id", &g.paypal.client_id);
            require(&mut missing, "paypal", "client_secret", &g.paypal.client_secret);
            require(&mut missing, "paypal", "webhook_id", &g.paypal.webhook_id);
            require(&mut missing, "paypal", "webhook_secret", &g.paypal.webhook_secret);
        }

        if !missing.is_empty() {
            return Err(PaymentError::Configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }
        if self.enabled_gateways().is_empty() {
            return Err(PaymentError::Configuration(
                "no payment gateway is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl GatewaySettings {
    pub fn is_enabled(&self, kind: GatewayKind) -> bool {
        match kind {
            GatewayKind::GCash => self.gcash.enabled,
            GatewayKind::Maya => self.maya.enabled,
            GatewayKind::Stripe => self.stripe.enabled,
            GatewayKind::PayPal => self.paypal.enabled,
        }
    }
}

fn require(missing: &mut Vec<String>, gateway: &str, field: &str, value: &str) {
    if value.trim().is_empty() {
        missing.push(format!("gateways.{gateway}.{field}"));
    }
}
