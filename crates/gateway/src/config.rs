//! Gateway configuration.
//!
//! Settings come from an optional JSON file named by `GATEWAY_CONFIG`, with
//! environment variables overriding the connection-level fields.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// Recognized configuration keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Service name the gateway registers under.
    pub service_name: String,
    /// Interface IP to bind.
    pub service_interface: String,
    pub service_port: u16,
    pub redis_url: String,
    pub metrics_port: u16,
    /// Forwarding timeout in seconds.
    pub request_timeout: u64,
    pub debug_logging: bool,
    /// When set, every admin route (except static assets) answers 404.
    pub disable_router_endpoint: bool,
    /// UUIDv4 required as `?token=` for non-localhost admin callers.
    pub router_token: Option<String>,
    /// CORS header overrides, merged over the defaults.
    pub cors: Option<HashMap<String, String>>,
    pub force_message_signature: bool,
    pub signature_shared_secret: Option<String>,
    /// External base URL -> route patterns proxied over plain HTTP.
    pub external_routes: HashMap<String, Vec<String>>,
    /// Logical database for the offline-queue keys.
    pub queuer_db: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: "hydra-router".to_string(),
            service_interface: "0.0.0.0".to_string(),
            service_port: 5353,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            metrics_port: 9090,
            request_timeout: 5,
            debug_logging: false,
            disable_router_endpoint: false,
            router_token: None,
            cors: None,
            force_message_signature: false,
            signature_shared_secret: None,
            external_routes: HashMap::new(),
            queuer_db: 0,
        }
    }
}

impl GatewayConfig {
    /// Load from the file named by `GATEWAY_CONFIG` (if any), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("GATEWAY_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| GatewayError::Config(format!("{path}: {e}")))?;
                serde_json::from_str(&raw)
                    .map_err(|e| GatewayError::Config(format!("{path}: {e}")))?
            }
            Err(_) => Self::default(),
        };

        if let Ok(url) = env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(port) = env::var("HTTP_PORT") {
            config.service_port = port
                .parse()
                .map_err(|_| GatewayError::Config("HTTP_PORT must be a number".into()))?;
        }
        if let Ok(port) = env::var("METRICS_PORT") {
            config.metrics_port = port
                .parse()
                .map_err(|_| GatewayError::Config("METRICS_PORT must be a number".into()))?;
        }
        if let Ok(name) = env::var("SERVICE_NAME") {
            config.service_name = name;
        }
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(if self.request_timeout == 0 {
            5
        } else {
            self.request_timeout
        })
    }

    /// CORS response headers: defaults merged with the configured overrides.
    pub fn cors_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = vec![
            ("access-control-allow-origin".into(), "*".into()),
            (
                "access-control-allow-methods".into(),
                "GET, POST, PUT, DELETE, HEAD, OPTIONS".into(),
            ),
            (
                "access-control-allow-headers".into(),
                "Accept, Authorization, Cache-Control, Content-Type, X-Requested-With".into(),
            ),
        ];
        if let Some(overrides) = &self.cors {
            for (name, value) in overrides {
                let name = name.to_lowercase();
                if let Some(slot) = headers.iter_mut().find(|(n, _)| *n == name) {
                    slot.1 = value.clone();
                } else {
                    headers.push((name, value.clone()));
                }
            }
        }
        headers
    }
}
