//! Gateway service entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use gateway::http_server::build_router;
use gateway::{Gateway, GatewayConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use registry_client::{NodeEntry, RedisRegistry, RegistryConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = GatewayConfig::load()?;

    let default_filter = if config.debug_logging { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("starting {}", config.service_name);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("failed to start Prometheus exporter");
    info!("metrics listening on port {}", config.metrics_port);

    let instance_id = Uuid::new_v4().simple().to_string();
    info!("instance id {}", instance_id);

    let (registry, mut inbound) = RedisRegistry::connect(RegistryConfig {
        redis_url: config.redis_url.clone(),
        service_name: config.service_name.clone(),
        instance_id: instance_id.clone(),
        queuer_db: config.queuer_db,
    })
    .await?;
    let registry = Arc::new(registry);
    info!("connected to registry at {}", config.redis_url);

    let bind_addr: SocketAddr = format!("{}:{}", config.service_interface, config.service_port)
        .parse()?;
    let gateway = Gateway::new(config, instance_id.clone(), registry.clone());

    // Register ourselves: routes, node entry, presence keepalive.
    gateway
        .registry
        .register_routes(gateway.service_name(), &gateway.own_routes())
        .await?;
    let node = NodeEntry {
        service_name: gateway.service_name().to_string(),
        instance_id: instance_id.clone(),
        ip: advertised_ip(&gateway.config),
        port: gateway.config.service_port,
        host_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        updated_on: Utc::now(),
    };
    gateway.registry.update_presence(&node).await?;
    {
        let gateway = gateway.clone();
        let mut node = node;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                node.updated_on = Utc::now();
                if let Err(e) = gateway.registry.update_presence(&node).await {
                    error!("presence update failed: {}", e);
                }
            }
        });
    }

    if let Err(e) = gateway.refresh_routes(None).await {
        error!("initial route refresh failed: {}", e);
    }

    // Consume the registry broadcast channel.
    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                gateway.handle_bus_message(msg).await;
            }
            error!("registry inbound channel closed");
        });
    }

    // Ask peer replicas for their client directories.
    gateway.gossip_wsdir("wsdir.sha", json!({})).await;

    let app = build_router(gateway.clone());
    let listener = TcpListener::bind(bind_addr).await?;
    info!("gateway listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Let peers prune our directory entry before we vanish.
    info!("shutting down, announcing directory removal");
    gateway.gossip_wsdir("wsdir.rem", json!({})).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("gateway stopped");
    Ok(())
}

fn advertised_ip(config: &GatewayConfig) -> String {
    if config.service_interface == "0.0.0.0" {
        "127.0.0.1".to_string()
    } else {
        config.service_interface.clone()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
