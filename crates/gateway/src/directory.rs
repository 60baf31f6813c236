//! Connected-client directory.
//!
//! The local side maps client ids to live connections on this replica. The
//! global side mirrors, via gossip, which replica owns which client ids
//! across the cluster. Each replica is authoritative for its own set; this
//! replica's own entry is maintained directly so lookups cover the whole
//! cluster.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use common::UmfMessage;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// One live client connection.
pub struct ClientConnection {
    pub tx: mpsc::UnboundedSender<Message>,
    pub ip: String,
}

impl ClientConnection {
    pub fn new(tx: mpsc::UnboundedSender<Message>, ip: String) -> Self {
        Self { tx, ip }
    }

    /// Serialize to the short wire form and send.
    pub fn send_umf(&self, msg: &UmfMessage) -> Result<()> {
        let raw = msg.to_json()?;
        self.send_raw(raw)
    }

    /// Send an already-serialized frame verbatim.
    pub fn send_raw(&self, raw: String) -> Result<()> {
        self.tx
            .send(Message::Text(raw.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Local connections plus the replicated replica->clients map.
pub struct ClientDirectory {
    replica_id: String,
    local: DashMap<String, Arc<ClientConnection>>,
    global: DashMap<String, DashSet<String>>,
}

impl ClientDirectory {
    pub fn new(replica_id: impl Into<String>) -> Self {
        let replica_id = replica_id.into();
        let directory = Self {
            replica_id: replica_id.clone(),
            local: DashMap::new(),
            global: DashMap::new(),
        };
        directory.global.insert(replica_id, DashSet::new());
        directory
    }

    // Local side -----------------------------------------------------------

    pub fn register(&self, id: &str, conn: Arc<ClientConnection>) {
        self.local.insert(id.to_string(), conn);
        self.own_set().insert(id.to_string());
        debug!("client {} registered", id);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.own_set().remove(id);
        self.local.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.local.get(id).map(|r| r.clone())
    }

    /// Re-key a connection during the reconnect handshake.
    pub fn rebind(&self, old_id: &str, new_id: &str) -> Option<Arc<ClientConnection>> {
        let (_, conn) = self.local.remove(old_id)?;
        self.own_set().remove(old_id);
        self.local.insert(new_id.to_string(), conn.clone());
        self.own_set().insert(new_id.to_string());
        debug!("client {} rebound to {}", old_id, new_id);
        Some(conn)
    }

    pub fn client_count(&self) -> usize {
        self.local.len()
    }

    pub fn local_ids(&self) -> Vec<String> {
        self.local.iter().map(|e| e.key().clone()).collect()
    }

    fn own_set(&self) -> dashmap::mapref::one::RefMut<'_, String, DashSet<String>> {
        self.global.entry(self.replica_id.clone()).or_default()
    }

    // Global side (gossip application) --------------------------------------

    pub fn apply_add(&self, replica: &str, client: &str) {
        self.global
            .entry(replica.to_string())
            .or_default()
            .insert(client.to_string());
    }

    pub fn apply_del(&self, replica: &str, client: &str) {
        if let Some(set) = self.global.get(replica) {
            set.remove(client);
        }
    }

    pub fn apply_rem(&self, replica: &str) {
        self.global.remove(replica);
    }

    /// Adopt a full set as the sender's authoritative directory.
    pub fn apply_dir(&self, replica: &str, clients: Vec<String>) {
        let set = DashSet::new();
        for client in clients {
            set.insert(client);
        }
        self.global.insert(replica.to_string(), set);
    }

    /// Which replica currently owns a client id.
    pub fn find_replica(&self, client: &str) -> Option<String> {
        self.global
            .iter()
            .find(|entry| entry.value().contains(client))
            .map(|entry| entry.key().clone())
    }

    pub fn global_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.global
            .iter()
            .map(|entry| {
                let mut ids: Vec<String> =
                    entry.value().iter().map(|c| c.clone()).collect();
                ids.sort();
                (entry.key().clone(), ids)
            })
            .collect()
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn() -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(ClientConnection::new(tx, "10.0.0.9".into()))
    }

    #[test]
    fn register_get_unregister() {
        let dir = ClientDirectory::new("gw1");
        dir.register("abc", conn());
        assert!(dir.get("abc").is_some());
        assert_eq!(dir.client_count(), 1);
        assert_eq!(dir.find_replica("abc").as_deref(), Some("gw1"));

        dir.unregister("abc");
        assert!(dir.get("abc").is_none());
        assert_eq!(dir.find_replica("abc"), None);
    }

    #[test]
    fn rebind_moves_the_connection() {
        let dir = ClientDirectory::new("gw1");
        dir.register("tmp", conn());
        assert!(dir.rebind("tmp", "abc").is_some());
        assert!(dir.get("tmp").is_none());
        assert!(dir.get("abc").is_some());
        assert_eq!(dir.find_replica("abc").as_deref(), Some("gw1"));
        assert_eq!(dir.find_replica("tmp"), None);
    }

    #[test]
    fn gossip_add_del_rem() {
        let dir = ClientDirectory::new("gw1");
        dir.apply_add("gw2", "u1");
        dir.apply_add("gw2", "u2");
        assert_eq!(dir.find_replica("u1").as_deref(), Some("gw2"));

        dir.apply_del("gw2", "u1");
        assert_eq!(dir.find_replica("u1"), None);
        assert_eq!(dir.find_replica("u2").as_deref(), Some("gw2"));

        dir.apply_rem("gw2");
        assert_eq!(dir.find_replica("u2"), None);
    }

    #[test]
    fn dir_is_authoritative_over_prior_gossip() {
        let dir = ClientDirectory::new("gw1");
        dir.apply_add("gw2", "u1");
        dir.apply_add("gw2", "u2");
        dir.apply_del("gw2", "u2");
        dir.apply_dir("gw2", vec!["u3".into(), "u4".into()]);

        let snapshot = dir.global_snapshot();
        assert_eq!(snapshot["gw2"], vec!["u3".to_string(), "u4".to_string()]);

        // Any later add/del applies on top of the adopted set.
        dir.apply_add("gw2", "u5");
        assert_eq!(dir.find_replica("u5").as_deref(), Some("gw2"));
    }

    #[test]
    fn closed_connection_reports_not_open() {
        let (tx, rx) = mpsc::unbounded_channel();
        let c = ClientConnection::new(tx, "unknown".into());
        assert!(c.is_open());
        drop(rx);
        assert!(!c.is_open());
        assert!(c
            .send_umf(&UmfMessage::new("a:/", "b:/", json!({})))
            .is_err());
    }
}
