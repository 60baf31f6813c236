//! Service-aware gateway fronting a fleet of microservices.
//!
//! The gateway discovers live service instances from the shared registry,
//! matches inbound HTTP requests to service-owned routes and forwards them,
//! and relays framed messages between services and persistently connected
//! clients across a cluster of gateway replicas.
//!
//! ## Architecture
//!
//! ```text
//! HTTP request ──▶ RouteTable ──▶ AdminSurface | HTTPForwarder ──▶ Registry
//! WS frame     ──▶ MessageRouter ─▶ admin | forward | directed send | queue
//! Registry bus ──▶ MessageRouter ─▶ local deliver | relay | queue | gossip
//! ```

pub mod admin;
pub mod config;
pub mod directory;
pub mod error;
pub mod forwarder;
pub mod http_server;
pub mod issue_log;
pub mod message_router;
pub mod offline_queue;
pub mod pattern;
pub mod route_table;
pub mod stats;
pub mod ws_server;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use registry_client::Registry;
use tracing::{error, info};

pub use config::GatewayConfig;
pub use directory::{ClientConnection, ClientDirectory};
pub use error::{GatewayError, Result};
pub use issue_log::{IssueLog, Severity};
pub use offline_queue::OfflineQueue;
pub use route_table::{RouteMatch, RouteTable};
pub use stats::StatsRing;

/// Method-tagged route patterns the gateway owns.
const OWN_ROUTES: &[&str] = &[
    "[get]/",
    "[get]/v1/router/health",
    "[get]/v1/router/list/:thing",
    "[get]/v1/router/version",
    "[get]/v1/router/clear",
    "[get]/v1/router/refresh",
    "[get]/v1/router/refresh/:service",
    "[get]/v1/router/log",
    "[get]/v1/router/stats",
    "[post]/v1/router/message",
    "[post]/v1/router/send",
    "[post]/v1/router/queue",
];

/// Process-wide gateway state, constructed once at start and shared by every
/// handler.
pub struct Gateway {
    pub config: GatewayConfig,
    pub instance_id: String,
    pub registry: Arc<dyn Registry>,
    pub route_table: RouteTable,
    pub directory: ClientDirectory,
    pub offline: OfflineQueue,
    pub http_stats: StatsRing,
    pub ws_stats: StatsRing,
    pub error_stats: StatsRing,
    pub issues: IssueLog,
    pub http_client: reqwest::Client,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        instance_id: impl Into<String>,
        registry: Arc<dyn Registry>,
    ) -> Arc<Self> {
        let instance_id = instance_id.into();
        let gateway = Arc::new(Self {
            route_table: RouteTable::new(),
            directory: ClientDirectory::new(instance_id.clone()),
            offline: OfflineQueue::new(registry.clone()),
            http_stats: StatsRing::new(),
            ws_stats: StatsRing::new(),
            error_stats: StatsRing::new(),
            issues: IssueLog::new(),
            http_client: reqwest::Client::new(),
            config,
            instance_id,
            registry,
        });

        for (base_url, patterns) in &gateway.config.external_routes {
            if let Err(e) = gateway.route_table.update_service(base_url, patterns, true) {
                error!("skipping external routes for {}: {}", base_url, e);
            }
        }
        gateway.seed_own_routes();
        gateway
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// `from` route identifying this gateway instance.
    pub fn self_from(&self) -> String {
        format!("{}@{}:/", self.instance_id, self.service_name())
    }

    /// The gateway's own route list, as registered with the registry.
    pub fn own_routes(&self) -> Vec<String> {
        OWN_ROUTES.iter().map(|s| s.to_string()).collect()
    }

    fn seed_own_routes(&self) {
        let own = self.own_routes();
        if let Err(e) = self
            .route_table
            .update_service(&self.config.service_name, &own, false)
        {
            error!("failed seeding own routes: {}", e);
        }
    }

    /// Re-pull routes from the registry, for all services or one, and re-seed
    /// the gateway's own routes so they can never be shadowed.
    pub async fn refresh_routes(&self, service: Option<&str>) -> Result<()> {
        self.route_table.refresh(self.registry.as_ref(), service).await?;
        self.seed_own_routes();
        info!("route refresh complete ({})", service.unwrap_or("all"));
        Ok(())
    }

    /// Record a diagnostic both to tracing and to the in-memory issue log.
    pub fn log_issue(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => tracing::info!("{}", message),
            Severity::Error => tracing::error!("{}", message),
            Severity::Fatal => tracing::error!(fatal = true, "{}", message),
        }
        self.issues.push(severity, message);
    }
}
