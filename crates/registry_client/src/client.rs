//! The [`Registry`] capability trait and its redis-backed implementation.
//!
//! One multiplexed connection serves keyspace commands; a dedicated pubsub
//! connection feeds the inbound channel reader. Replies to in-flight API
//! requests are matched by `rmid` and resolved before anything reaches the
//! inbound queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{UmfMessage, UmfRoute};
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::types::{ApiResponse, NodeEntry, PresenceEntry};

/// Key prefix shared with the registry.
const KEY_BASE: &str = "hydra:service";

/// Presence keys expire after this many seconds unless refreshed.
const PRESENCE_TTL_SECS: u64 = 3;

/// Capabilities the gateway needs from the discovery registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Route patterns per service, as published by each service.
    async fn get_all_routes(&self) -> Result<HashMap<String, Vec<String>>>;

    /// Live instances of one service, in the registry's order.
    async fn get_presence(&self, service: &str) -> Result<Vec<PresenceEntry>>;

    /// Every registered instance with its last-refresh time.
    async fn get_nodes(&self) -> Result<Vec<NodeEntry>>;

    /// Per-instance health snapshots.
    async fn get_health(&self) -> Result<Vec<serde_json::Value>>;

    /// Publish this service's route list.
    async fn register_routes(&self, service: &str, routes: &[String]) -> Result<()>;

    /// Refresh this instance's presence and node entry.
    async fn update_presence(&self, node: &NodeEntry) -> Result<()>;

    /// Drop node entries older than `max_elapsed`. Returns how many.
    async fn remove_stale_nodes(&self, max_elapsed: Duration) -> Result<u64>;

    /// Publish to every instance of the target service.
    async fn send_broadcast_message(&self, msg: &UmfMessage) -> Result<()>;

    /// Publish to one instance (the addressed one, or the first live one).
    async fn send_message(&self, msg: &UmfMessage) -> Result<()>;

    /// Directed send awaiting a correlated reply. Timeouts and delivery
    /// failures come back as the registry's failure-shaped [`ApiResponse`].
    async fn make_api_request(&self, msg: &UmfMessage, timeout: Duration) -> Result<ApiResponse>;

    /// Append to the target service's job queue.
    async fn queue_message(&self, msg: &UmfMessage) -> Result<()>;

    // Queue-store list primitives (the offline queue builds on these).

    /// Append a value at the tail of a list.
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically move the head of `src` to the tail of `dst`.
    async fn list_move_head(&self, src: &str, dst: &str) -> Result<Option<String>>;

    /// Remove one entry equal to `value`. Returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<u64>;

    /// Refresh a key's TTL.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// Connection settings for the redis-backed registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub redis_url: String,
    /// Service name this process registers under.
    pub service_name: String,
    /// Instance id this process registers under.
    pub instance_id: String,
    /// Logical database holding the offline-queue keys (0 = same as main).
    pub queuer_db: i64,
}

/// Redis-backed [`Registry`].
pub struct RedisRegistry {
    conn: redis::aio::MultiplexedConnection,
    queue_conn: redis::aio::MultiplexedConnection,
    service_name: String,
    instance_id: String,
    pending: Arc<DashMap<String, oneshot::Sender<UmfMessage>>>,
}

impl RedisRegistry {
    /// Connect, subscribe this instance's channels, and return the adapter
    /// plus the stream of inbound channel messages.
    pub async fn connect(config: RegistryConfig) -> Result<(Self, mpsc::Receiver<UmfMessage>)> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        let mut queue_conn = client.get_multiplexed_async_connection().await?;
        if config.queuer_db != 0 {
            let _: () = redis::cmd("SELECT")
                .arg(config.queuer_db)
                .query_async(&mut queue_conn)
                .await?;
        }

        let pending: Arc<DashMap<String, oneshot::Sender<UmfMessage>>> = Arc::new(DashMap::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);

        let mut pubsub = client.get_async_pubsub().await?;
        let service_channel = format!("{KEY_BASE}:mc:{}", config.service_name);
        let instance_channel = format!("{service_channel}:{}", config.instance_id);
        pubsub.subscribe(&service_channel).await?;
        pubsub.subscribe(&instance_channel).await?;
        info!(
            "subscribed to {} and {}",
            service_channel, instance_channel
        );

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("unreadable channel payload: {}", e);
                        continue;
                    }
                };
                let umf = match UmfMessage::from_json(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("dropping malformed channel message: {}", e);
                        continue;
                    }
                };
                if let Some(rmid) = &umf.rmid {
                    if let Some((_, tx)) = reader_pending.remove(rmid) {
                        let _ = tx.send(umf);
                        continue;
                    }
                }
                if inbound_tx.send(umf).await.is_err() {
                    debug!("inbound receiver dropped, stopping channel reader");
                    break;
                }
            }
        });

        Ok((
            Self {
                conn,
                queue_conn,
                service_name: config.service_name,
                instance_id: config.instance_id,
                pending,
            },
            inbound_rx,
        ))
    }

    fn routes_key(service: &str) -> String {
        format!("{KEY_BASE}:{service}:routes")
    }

    fn nodes_key() -> String {
        format!("{KEY_BASE}:nodes")
    }

    /// Channel for one instance of a service.
    fn instance_channel(service: &str, instance: &str) -> String {
        format!("{KEY_BASE}:mc:{service}:{instance}")
    }

    /// Channel every instance of a service subscribes to.
    fn service_channel(service: &str) -> String {
        format!("{KEY_BASE}:mc:{service}")
    }

    async fn publish(&self, channel: &str, msg: &UmfMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = msg.to_json()?;
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Resolve the channel for a directed send, consulting presence when the
    /// route names no instance.
    async fn directed_channel(&self, route: &UmfRoute) -> Result<String> {
        if !route.instance.is_empty() {
            return Ok(Self::instance_channel(&route.service, &route.instance));
        }
        let presence = self.get_presence(&route.service).await?;
        let first = presence
            .first()
            .ok_or_else(|| RegistryError::NoInstance(route.service.clone()))?;
        Ok(Self::instance_channel(&route.service, &first.instance_id))
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn get_all_routes(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{KEY_BASE}:*:routes")).await?;
        let mut out = HashMap::new();
        let prefix = format!("{KEY_BASE}:");
        for key in keys {
            let Some(service) = key
                .strip_prefix(&prefix)
                .and_then(|k| k.strip_suffix(":routes"))
            else {
                continue;
            };
            let routes: Vec<String> = conn.smembers(&key).await?;
            out.insert(service.to_string(), routes);
        }
        Ok(out)
    }

    async fn get_presence(&self, service: &str) -> Result<Vec<PresenceEntry>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(format!("{KEY_BASE}:{service}:*:presence"))
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let nodes: HashMap<String, String> = conn.hgetall(Self::nodes_key()).await?;
        let mut out = Vec::new();
        for key in keys {
            let Some(instance_id) = key
                .strip_suffix(":presence")
                .and_then(|k| k.rsplit(':').next())
            else {
                continue;
            };
            if let Some(raw) = nodes.get(instance_id) {
                if let Ok(node) = serde_json::from_str::<NodeEntry>(raw) {
                    out.push(PresenceEntry {
                        service_name: node.service_name,
                        instance_id: node.instance_id,
                        ip: node.ip,
                        port: node.port,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn get_nodes(&self) -> Result<Vec<NodeEntry>> {
        let mut conn = self.conn.clone();
        let nodes: HashMap<String, String> = conn.hgetall(Self::nodes_key()).await?;
        let mut out = Vec::new();
        for raw in nodes.values() {
            match serde_json::from_str::<NodeEntry>(raw) {
                Ok(node) => out.push(node),
                Err(e) => warn!("skipping unreadable node entry: {}", e),
            }
        }
        Ok(out)
    }

    async fn get_health(&self) -> Result<Vec<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{KEY_BASE}:*:health")).await?;
        let mut out = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                if let Ok(value) = serde_json::from_str(&raw) {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }

    async fn register_routes(&self, service: &str, routes: &[String]) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::routes_key(service);
        let mut pipe = redis::pipe();
        pipe.del(&key);
        for route in routes {
            pipe.sadd(&key, route);
        }
        let _: () = pipe.query_async(&mut conn).await?;
        info!("registered {} routes for {}", routes.len(), service);
        Ok(())
    }

    async fn update_presence(&self, node: &NodeEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let presence_key = format!(
            "{KEY_BASE}:{}:{}:presence",
            node.service_name, node.instance_id
        );
        let entry = serde_json::to_string(node)?;
        let mut pipe = redis::pipe();
        pipe.set_ex(&presence_key, &node.instance_id, PRESENCE_TTL_SECS);
        pipe.hset(Self::nodes_key(), &node.instance_id, entry);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_stale_nodes(&self, max_elapsed: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let nodes: HashMap<String, String> = conn.hgetall(Self::nodes_key()).await?;
        let mut removed = 0u64;
        for (instance_id, raw) in nodes {
            let stale = match serde_json::from_str::<NodeEntry>(&raw) {
                Ok(node) => node.elapsed() > max_elapsed.as_secs() as i64,
                Err(_) => true,
            };
            if stale {
                let _: () = conn.hdel(Self::nodes_key(), &instance_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn send_broadcast_message(&self, msg: &UmfMessage) -> Result<()> {
        let route = msg.route()?;
        self.publish(&Self::service_channel(&route.service), msg).await
    }

    async fn send_message(&self, msg: &UmfMessage) -> Result<()> {
        let route = msg.route()?;
        let channel = self.directed_channel(&route).await?;
        self.publish(&channel, msg).await
    }

    async fn make_api_request(&self, msg: &UmfMessage, timeout: Duration) -> Result<ApiResponse> {
        let route = msg.route()?;
        let channel = match self.directed_channel(&route).await {
            Ok(c) => c,
            Err(RegistryError::NoInstance(service)) => {
                return Ok(ApiResponse::failure(
                    503,
                    &format!("No {service} instances available"),
                ));
            }
            Err(e) => return Err(e),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg.mid.clone(), tx);
        if let Err(e) = self.publish(&channel, msg).await {
            self.pending.remove(&msg.mid);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(ApiResponse::from_body(&reply.body)),
            Ok(Err(_)) => {
                self.pending.remove(&msg.mid);
                Err(RegistryError::ChannelClosed)
            }
            Err(_) => {
                self.pending.remove(&msg.mid);
                Ok(ApiResponse::failure(503, "API request timed out"))
            }
        }
    }

    async fn queue_message(&self, msg: &UmfMessage) -> Result<()> {
        let route = msg.route()?;
        let mut conn = self.queue_conn.clone();
        let key = format!("{KEY_BASE}:{}:mqrecieved", route.service);
        let _: () = conn.lpush(&key, msg.to_json()?).await?;
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.queue_conn.clone();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn list_move_head(&self, src: &str, dst: &str) -> Result<Option<String>> {
        let mut conn = self.queue_conn.clone();
        let moved: Option<String> = redis::cmd("LMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.queue_conn.clone();
        let removed: u64 = conn.lrem(key, 1, value).await?;
        Ok(removed)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.queue_conn.clone();
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }
}

impl RedisRegistry {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
