//! In-memory Registry fake shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::UmfMessage;
use registry_client::{ApiResponse, NodeEntry, PresenceEntry, Registry};
use serde_json::Value;

use crate::{Gateway, GatewayConfig};

type RegistryResult<T> = registry_client::Result<T>;

#[derive(Default)]
pub struct MockRegistry {
    routes: Mutex<HashMap<String, Vec<String>>>,
    presence: Mutex<HashMap<String, Vec<PresenceEntry>>>,
    nodes: Mutex<Vec<NodeEntry>>,
    health: Mutex<Vec<Value>>,
    sent: Mutex<Vec<UmfMessage>>,
    broadcasts: Mutex<Vec<UmfMessage>>,
    service_queue: Mutex<Vec<UmfMessage>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    ttls: Mutex<HashMap<String, Duration>>,
    api_requests: Mutex<Vec<UmfMessage>>,
    api_responses: Mutex<VecDeque<ApiResponse>>,
    registered: Mutex<HashMap<String, Vec<String>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_routes(&self, service: &str, patterns: &[&str]) {
        self.routes.lock().unwrap().insert(
            service.to_string(),
            patterns.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn set_presence(&self, service: &str, instances: &[&str]) {
        let entries = instances
            .iter()
            .map(|id| PresenceEntry {
                service_name: service.to_string(),
                instance_id: id.to_string(),
                ip: "10.0.0.1".to_string(),
                port: 4000,
            })
            .collect();
        self.presence
            .lock()
            .unwrap()
            .insert(service.to_string(), entries);
    }

    pub fn script_api_response(&self, response: ApiResponse) {
        self.api_responses.lock().unwrap().push_back(response);
    }

    pub fn api_requests(&self) -> Vec<UmfMessage> {
        self.api_requests.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<UmfMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<UmfMessage> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn service_queued(&self) -> Vec<UmfMessage> {
        self.service_queue.lock().unwrap().clone()
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.lists
            .lock()
            .unwrap()
            .get(key)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn list_contents(&self, key: &str) -> Vec<String> {
        self.lists
            .lock()
            .unwrap()
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.ttls.lock().unwrap().get(key).copied()
    }

    pub fn registered_routes(&self, service: &str) -> Option<Vec<String>> {
        self.registered.lock().unwrap().get(service).cloned()
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn get_all_routes(&self) -> RegistryResult<HashMap<String, Vec<String>>> {
        Ok(self.routes.lock().unwrap().clone())
    }

    async fn get_presence(&self, service: &str) -> RegistryResult<Vec<PresenceEntry>> {
        Ok(self
            .presence
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_nodes(&self) -> RegistryResult<Vec<NodeEntry>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn get_health(&self) -> RegistryResult<Vec<Value>> {
        Ok(self.health.lock().unwrap().clone())
    }

    async fn register_routes(&self, service: &str, routes: &[String]) -> RegistryResult<()> {
        self.registered
            .lock()
            .unwrap()
            .insert(service.to_string(), routes.to_vec());
        Ok(())
    }

    async fn update_presence(&self, node: &NodeEntry) -> RegistryResult<()> {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|n| n.instance_id != node.instance_id);
        nodes.push(node.clone());
        Ok(())
    }

    async fn remove_stale_nodes(&self, max_elapsed: Duration) -> RegistryResult<u64> {
        let mut nodes = self.nodes.lock().unwrap();
        let before = nodes.len();
        nodes.retain(|n| n.elapsed() <= max_elapsed.as_secs() as i64);
        Ok((before - nodes.len()) as u64)
    }

    async fn send_broadcast_message(&self, msg: &UmfMessage) -> RegistryResult<()> {
        self.broadcasts.lock().unwrap().push(msg.clone());
        Ok(())
    }

    async fn send_message(&self, msg: &UmfMessage) -> RegistryResult<()> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }

    async fn make_api_request(
        &self,
        msg: &UmfMessage,
        _timeout: Duration,
    ) -> RegistryResult<ApiResponse> {
        self.api_requests.lock().unwrap().push(msg.clone());
        Ok(self
            .api_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn queue_message(&self, msg: &UmfMessage) -> RegistryResult<()> {
        self.service_queue.lock().unwrap().push(msg.clone());
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> RegistryResult<()> {
        self.lists
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_move_head(&self, src: &str, dst: &str) -> RegistryResult<Option<String>> {
        let mut lists = self.lists.lock().unwrap();
        let moved = lists.get_mut(src).and_then(|l| l.pop_front());
        if let Some(value) = &moved {
            lists
                .entry(dst.to_string())
                .or_default()
                .push_back(value.clone());
        }
        Ok(moved)
    }

    async fn list_remove(&self, key: &str, value: &str) -> RegistryResult<u64> {
        let mut lists = self.lists.lock().unwrap();
        if let Some(list) = lists.get_mut(key) {
            if let Some(pos) = list.iter().position(|v| v == value) {
                list.remove(pos);
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> RegistryResult<()> {
        self.ttls.lock().unwrap().insert(key.to_string(), ttl);
        Ok(())
    }
}

/// A gateway wired to the given mock, with default config and a fixed
/// replica id.
pub fn gateway_with(registry: Arc<MockRegistry>) -> Arc<Gateway> {
    Gateway::new(GatewayConfig::default(), "gw1", registry)
}

/// Same, with a caller-tweaked config.
pub fn gateway_with_config(registry: Arc<MockRegistry>, config: GatewayConfig) -> Arc<Gateway> {
    Gateway::new(config, "gw1", registry)
}
