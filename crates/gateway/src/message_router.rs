//! Dispatch engine for framed messages.
//!
//! Source A: frames arriving over a persistent client connection.
//! Source B: frames arriving over the registry's broadcast channel, from
//! services or other gateway replicas.

use std::collections::HashMap;
use std::sync::Arc;

use common::{UmfMessage, UmfRoute};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::admin::AdminRequest;
use crate::directory::ClientConnection;
use crate::issue_log::Severity;
use crate::Gateway;

const ERR_MISSING_FIELDS: &str = r#"Message missing one of "to", "from" or "body" fields"#;
const ERR_UNSIGNED: &str = "Not a signed UMF message";
const ERR_BAD_SIGNATURE: &str = "Invalid UMF message signature";

/// What the connection loop must do after a frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsAction {
    None,
    /// Ill-formed or unauthenticated frame: the error frame has been sent,
    /// drop the connection.
    Close,
    /// Reconnect handshake succeeded: the connection now answers to this id.
    Rebind(String),
}

impl Gateway {
    fn error_frame(&self, original: Option<&UmfMessage>, error: &str) -> UmfMessage {
        let mut frame = UmfMessage::new(
            original
                .map(|m| m.from.clone())
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| "client:/".to_string()),
            self.self_from(),
            json!({ "error": error }),
        );
        frame.typ = Some("error".to_string());
        frame.rmid = original.map(|m| m.mid.clone()).filter(|m| !m.is_empty());
        frame
    }

    /// Handle one frame from a persistent client connection.
    pub async fn handle_client_frame(
        self: &Arc<Self>,
        client_id: &str,
        conn: &Arc<ClientConnection>,
        raw: &str,
    ) -> WsAction {
        counter!("gateway_ws_frames_total").increment(1);

        let msg = match UmfMessage::from_json(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("unparseable frame from {}: {}", client_id, e);
                let _ = conn.send_umf(&self.error_frame(None, ERR_MISSING_FIELDS));
                return WsAction::Close;
            }
        };
        if !msg.is_valid() {
            let _ = conn.send_umf(&self.error_frame(Some(&msg), ERR_MISSING_FIELDS));
            return WsAction::Close;
        }

        // Step 1: optional signature enforcement.
        if self.config.force_message_signature {
            if msg.signature.is_none() {
                let _ = conn.send_umf(&self.error_frame(Some(&msg), ERR_UNSIGNED));
                return WsAction::Close;
            }
            let secret = self
                .config
                .signature_shared_secret
                .clone()
                .unwrap_or_default();
            if !msg.verify_signature(&secret) {
                let _ = conn.send_umf(&self.error_frame(Some(&msg), ERR_BAD_SIGNATURE));
                return WsAction::Close;
            }
        }

        // Step 2: parse the target route.
        let route = match msg.route() {
            Ok(route) => route,
            Err(e) => {
                debug!("bad route in frame from {}: {}", client_id, e);
                let _ = conn.send_umf(&self.error_frame(Some(&msg), ERR_MISSING_FIELDS));
                return WsAction::Close;
            }
        };
        self.ws_stats.log(&route.service);

        // Step 3: bracketed method means an API-style call.
        if route.http_method.is_some() {
            if route.service == self.service_name() {
                let response = self.handle_admin(admin_request_from(self, &route, &msg)).await;
                let mut reply =
                    UmfMessage::new(msg.from.clone(), self.self_from(), response.to_body());
                reply.rmid = Some(msg.mid.clone());
                let _ = conn.send_umf(&reply);
            } else {
                match self.forward_ws_api(&msg).await {
                    Ok(reply) => {
                        let _ = conn.send_umf(&reply);
                    }
                    Err(e) => {
                        self.log_issue(
                            Severity::Fatal,
                            format!("API forward for {} failed: {e}", route.service),
                        );
                        let _ = conn.send_umf(&self.error_frame(Some(&msg), &e.to_string()));
                    }
                }
            }
            return WsAction::None;
        }

        // Step 4: messages addressed to the gateway itself.
        if route.service == self.service_name() {
            return self.handle_self_message(client_id, conn, &msg, &route).await;
        }

        // Step 5: forward to a connected client (possibly on another replica).
        if msg.forward.is_some() {
            self.dispatch_forward(&msg).await;
            return WsAction::None;
        }

        // Step 6: dispatch to a service instance.
        self.dispatch_to_service(client_id, conn, msg, route).await;
        WsAction::None
    }

    /// Reply-correlation tag: routes service replies back through this
    /// replica to the originating client.
    fn via_tag(&self, client_id: &str) -> String {
        format!(
            "{}-{}@{}:/",
            self.instance_id,
            client_id,
            self.service_name()
        )
    }

    async fn handle_self_message(
        self: &Arc<Self>,
        client_id: &str,
        conn: &Arc<ClientConnection>,
        msg: &UmfMessage,
        route: &UmfRoute,
    ) -> WsAction {
        match msg.typ.as_deref() {
            Some("log") => {
                self.issues.push(Severity::Info, msg.body.to_string());
                WsAction::None
            }
            Some("ping") => {
                let reply = UmfMessage::reply_to(msg, self.self_from(), "pong", json!({}));
                let _ = conn.send_umf(&reply);
                WsAction::None
            }
            Some("reconnect") => {
                let claimed = msg
                    .body
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if claimed.is_empty() {
                    let _ = conn.send_umf(&self.error_frame(
                        Some(msg),
                        "Reconnect message missing client id",
                    ));
                    return WsAction::None;
                }
                if self.directory.rebind(client_id, &claimed).is_none() {
                    // Connection already gone; nothing to re-key.
                    return WsAction::None;
                }
                self.gossip_wsdir("wsdir.del", json!({ "clientID": client_id })).await;
                self.gossip_wsdir("wsdir.add", json!({ "clientID": claimed })).await;
                self.drain_offline(&claimed, conn).await;
                WsAction::Rebind(claimed)
            }
            // The wsdir sub-path carries directory queries.
            Some("wsdir.loc") if route.api_route.contains("wsdir") => {
                let requested = msg
                    .body
                    .get("clientID")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let replica = self.directory.find_replica(requested).unwrap_or_default();
                let reply = UmfMessage::reply_to(
                    msg,
                    self.self_from(),
                    "wsdir.loc",
                    json!({ "routerID": replica, "clientID": requested }),
                );
                let _ = conn.send_umf(&reply);
                WsAction::None
            }
            other => {
                debug!("unhandled self-addressed message type {:?}", other);
                WsAction::None
            }
        }
    }

    async fn dispatch_to_service(
        self: &Arc<Self>,
        client_id: &str,
        conn: &Arc<ClientConnection>,
        mut msg: UmfMessage,
        route: UmfRoute,
    ) {
        if !route.instance.is_empty() {
            msg.via = Some(self.via_tag(client_id));
            if let Err(e) = self.registry.send_message(&msg).await {
                self.log_issue(
                    Severity::Fatal,
                    format!("directed send to {} failed: {e}", msg.to),
                );
            }
            return;
        }

        let presence = match self.registry.get_presence(&route.service).await {
            Ok(presence) => presence,
            Err(e) => {
                self.log_issue(
                    Severity::Fatal,
                    format!("presence lookup for {} failed: {e}", route.service),
                );
                Vec::new()
            }
        };
        let Some(first) = presence.first() else {
            self.error_stats.log(&route.service);
            let error = format!("No {} instances available", route.service);
            let _ = conn.send_umf(&self.error_frame(Some(&msg), &error));
            return;
        };

        // Registry order is the load-sharing policy; take the first.
        msg.to = if route.api_route.is_empty() {
            format!("{}@{}", first.instance_id, route.service)
        } else {
            format!("{}@{}:{}", first.instance_id, route.service, route.api_route)
        };
        msg.via = Some(self.via_tag(client_id));
        if let Err(e) = self.registry.send_message(&msg).await {
            self.log_issue(
                Severity::Fatal,
                format!("directed send to {} failed: {e}", msg.to),
            );
        }
    }

    /// Deliver a `forward`-tagged message: locally when the client is here,
    /// relayed to the owning replica when it is elsewhere, queued otherwise.
    async fn dispatch_forward(self: &Arc<Self>, msg: &UmfMessage) {
        let Some(forward) = msg.forward.as_deref() else {
            return;
        };
        let target = match UmfRoute::parse(forward) {
            Ok(route) if !route.instance.is_empty() => route.instance,
            _ => {
                warn!("forward route {} names no client instance", forward);
                return;
            }
        };

        if let Some(conn) = self.directory.get(&target) {
            if conn.send_umf(msg).is_ok() {
                counter!("gateway_forward_delivered_total").increment(1);
                return;
            }
            // Fall through to queueing if the connection just died.
        }

        match self.directory.find_replica(&target) {
            Some(replica) if replica != self.instance_id => {
                let mut relayed = msg.clone();
                relayed.to = format!("{}@{}:/", replica, self.service_name());
                if let Err(e) = self.registry.send_message(&relayed).await {
                    self.log_issue(
                        Severity::Fatal,
                        format!("relay to replica {replica} failed: {e}"),
                    );
                }
            }
            _ => {
                if let Err(e) = self.offline.enqueue(&target, msg).await {
                    self.log_issue(
                        Severity::Fatal,
                        format!("offline enqueue for {target} failed: {e}"),
                    );
                } else {
                    counter!("gateway_forward_queued_total").increment(1);
                }
            }
        }
    }

    /// Handle one message from the registry broadcast channel. Faults are
    /// logged and swallowed; gossip must never take the process down.
    pub async fn handle_bus_message(self: &Arc<Self>, msg: UmfMessage) {
        counter!("gateway_bus_messages_total").increment(1);

        // B1: route refresh announcements.
        if msg.body.get("action").and_then(|v| v.as_str()) == Some("refresh") {
            let service = msg
                .body
                .get("serviceName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if let Err(e) = self.refresh_routes(service.as_deref()).await {
                self.log_issue(Severity::Fatal, format!("broadcast refresh failed: {e}"));
            }
            return;
        }

        // B2: directory gossip.
        if let Some(typ) = msg.typ.as_deref() {
            if typ.starts_with("wsdir.") && typ != "wsdir.loc" {
                self.apply_wsdir_gossip(typ, &msg).await;
                return;
            }
        }

        // B3: replies carrying a via tag rejoin their originating client.
        if let Some(via) = msg.via.as_deref() {
            let sub_id = match UmfRoute::parse(via) {
                Ok(route) => route.sub_id.unwrap_or_default(),
                Err(_) => String::new(),
            };
            if sub_id.is_empty() {
                debug!("via tag {} carries no client id", via);
                return;
            }
            if let Some(conn) = self.directory.get(&sub_id) {
                let mut delivered = msg.clone();
                delivered.via = None;
                if conn.send_umf(&delivered).is_ok() {
                    return;
                }
            }
            if let Err(e) = self.offline.enqueue(&sub_id, &msg).await {
                self.log_issue(
                    Severity::Fatal,
                    format!("offline enqueue for {sub_id} failed: {e}"),
                );
            }
            return;
        }

        // B4: forwards from services or peer replicas.
        if msg.forward.is_some() {
            self.dispatch_forward(&msg).await;
            return;
        }

        debug!("unhandled bus message type {:?}", msg.typ);
    }

    async fn apply_wsdir_gossip(self: &Arc<Self>, typ: &str, msg: &UmfMessage) {
        let router_id = msg
            .body
            .get("routerID")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if router_id.is_empty() || router_id == self.instance_id {
            return;
        }
        let client_id = msg
            .body
            .get("clientID")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match typ {
            "wsdir.add" => self.directory.apply_add(&router_id, client_id),
            "wsdir.del" => self.directory.apply_del(&router_id, client_id),
            "wsdir.rem" => self.directory.apply_rem(&router_id),
            "wsdir.sha" => {
                // Peer asked for our directory: answer with a full dir frame.
                let mut reply = UmfMessage::new(
                    format!("{}@{}:/", router_id, self.service_name()),
                    self.self_from(),
                    json!({
                        "routerID": self.instance_id,
                        "clientIDs": self.directory.local_ids(),
                    }),
                );
                reply.typ = Some("wsdir.dir".to_string());
                if let Err(e) = self.registry.send_message(&reply).await {
                    warn!("directory share reply failed: {}", e);
                }
            }
            "wsdir.dir" => {
                let clients = msg
                    .body
                    .get("clientIDs")
                    .and_then(|v| v.as_array())
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                self.directory.apply_dir(&router_id, clients);
            }
            other => debug!("unknown wsdir gossip type {}", other),
        }
    }

    /// Broadcast a directory event to the other replicas.
    pub async fn gossip_wsdir(&self, typ: &str, mut body: Value) {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("routerID".to_string(), json!(self.instance_id));
        }
        let mut msg = UmfMessage::new(
            format!("{}:/", self.service_name()),
            self.self_from(),
            body,
        );
        msg.typ = Some(typ.to_string());
        if let Err(e) = self.registry.send_broadcast_message(&msg).await {
            warn!("wsdir gossip {} failed: {}", typ, e);
        }
    }

    /// Drain the offline queue to a just-reconnected client, FIFO. Stops
    /// without touching `processing` leftovers if the connection dies
    /// mid-drain.
    pub async fn drain_offline(&self, client_id: &str, conn: &Arc<ClientConnection>) {
        loop {
            if !conn.is_open() {
                return;
            }
            let raw = match self.offline.dequeue(client_id).await {
                Ok(Some(raw)) => raw,
                Ok(None) => return,
                Err(e) => {
                    self.log_issue(
                        Severity::Fatal,
                        format!("offline dequeue for {client_id} failed: {e}"),
                    );
                    return;
                }
            };
            if conn.send_raw(raw.clone()).is_err() {
                return;
            }
            if let Err(e) = self.offline.complete(client_id, &raw).await {
                self.log_issue(
                    Severity::Fatal,
                    format!("offline complete for {client_id} failed: {e}"),
                );
                return;
            }
        }
    }
}

fn admin_request_from(gateway: &Gateway, route: &UmfRoute, msg: &UmfMessage) -> AdminRequest {
    let (path, query_str) = match route.api_route.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (route.api_route.clone(), None),
    };
    let query: HashMap<String, String> = query_str
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    let (pattern, captures) = match gateway.route_table.lookup(&path) {
        Some(found) if found.service == gateway.service_name() => (
            found.pattern.unwrap_or_else(|| path.clone()),
            found.captures,
        ),
        _ => (path, HashMap::new()),
    };

    let frame = serde_json::from_value::<UmfMessage>(msg.body.clone()).ok();
    AdminRequest {
        method: route.http_method.clone().unwrap_or_else(|| "get".to_string()),
        pattern,
        captures,
        query,
        frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{gateway_with, gateway_with_config, MockRegistry};
    use crate::GatewayConfig;
    use axum::extract::ws::Message;
    use registry_client::ApiResponse;
    use tokio::sync::mpsc;

    fn client() -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ClientConnection::new(tx, "10.0.0.9".into())), rx)
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> UmfMessage {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => UmfMessage::from_json(&text).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_errors_and_closes() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let (conn, mut rx) = client();
        let action = gw.handle_client_frame("abc", &conn, "{not json").await;
        assert_eq!(action, WsAction::Close);
        let frame = recv_frame(&mut rx);
        assert_eq!(frame.body["error"], ERR_MISSING_FIELDS);
    }

    #[tokio::test]
    async fn missing_fields_error_and_close() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let (conn, mut rx) = client();
        let raw = serde_json::json!({"to": "red:/", "bdy": {}}).to_string();
        let action = gw.handle_client_frame("abc", &conn, &raw).await;
        assert_eq!(action, WsAction::Close);
        assert_eq!(recv_frame(&mut rx).body["error"], ERR_MISSING_FIELDS);
    }

    #[tokio::test]
    async fn unsigned_frame_rejected_when_signatures_forced() {
        let config = GatewayConfig {
            force_message_signature: true,
            signature_shared_secret: Some("s3cr3t".to_string()),
            ..GatewayConfig::default()
        };
        let gw = gateway_with_config(Arc::new(MockRegistry::new()), config);
        let (conn, mut rx) = client();

        let msg = UmfMessage::new("red:/", "abc@client:/", serde_json::json!({}));
        let action = gw
            .handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;
        assert_eq!(action, WsAction::Close);
        assert_eq!(recv_frame(&mut rx).body["error"], ERR_UNSIGNED);
    }

    #[tokio::test]
    async fn badly_signed_frame_rejected() {
        let config = GatewayConfig {
            force_message_signature: true,
            signature_shared_secret: Some("s3cr3t".to_string()),
            ..GatewayConfig::default()
        };
        let gw = gateway_with_config(Arc::new(MockRegistry::new()), config);
        let (conn, mut rx) = client();

        let mut msg = UmfMessage::new("red:/", "abc@client:/", serde_json::json!({}));
        msg.sign("wrong-secret").unwrap();
        let action = gw
            .handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;
        assert_eq!(action, WsAction::Close);
        assert_eq!(recv_frame(&mut rx).body["error"], ERR_BAD_SIGNATURE);
    }

    #[tokio::test]
    async fn properly_signed_frame_passes() {
        let registry = Arc::new(MockRegistry::new());
        registry.set_presence("red", &["i1"]);
        let config = GatewayConfig {
            force_message_signature: true,
            signature_shared_secret: Some("s3cr3t".to_string()),
            ..GatewayConfig::default()
        };
        let gw = gateway_with_config(registry.clone(), config);
        let (conn, _rx) = client();

        let mut msg = UmfMessage::new("red:/v1/red/job", "abc@client:/", serde_json::json!({}));
        msg.sign("s3cr3t").unwrap();
        let action = gw
            .handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;
        assert_eq!(action, WsAction::None);
        assert_eq!(registry.sent().len(), 1);
    }

    #[tokio::test]
    async fn ping_gets_pong_with_rmid() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let (conn, mut rx) = client();
        let msg = UmfMessage::new("hydra-router:/", "abc@client:/", serde_json::json!({}))
            .with_type("ping");
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;
        let pong = recv_frame(&mut rx);
        assert_eq!(pong.typ.as_deref(), Some("pong"));
        assert_eq!(pong.rmid.as_deref(), Some(msg.mid.as_str()));
    }

    #[tokio::test]
    async fn log_type_lands_in_issue_log() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let (conn, _rx) = client();
        let msg = UmfMessage::new(
            "hydra-router:/",
            "abc@client:/",
            serde_json::json!({"note": "hello"}),
        )
        .with_type("log");
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;
        assert!(gw.issues.entries()[0].message.contains("hello"));
    }

    #[tokio::test]
    async fn bracketed_method_to_service_replies_with_upstream_result() {
        let registry = Arc::new(MockRegistry::new());
        registry.script_api_response(ApiResponse {
            status_code: 200,
            result: Some(serde_json::json!({"hello": "world"})),
            ..ApiResponse::default()
        });
        let gw = gateway_with(registry.clone());
        let (conn, mut rx) = client();

        let msg = UmfMessage::new(
            "red:[get]/v1/red/hello",
            "abc@client:/",
            serde_json::json!({}),
        );
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        let reply = recv_frame(&mut rx);
        assert_eq!(reply.rmid.as_deref(), Some(msg.mid.as_str()));
        assert_eq!(reply.body["result"]["hello"], "world");

        let forwarded = registry.api_requests();
        assert_eq!(forwarded[0].to, "red:[get]/v1/red/hello");
    }

    #[tokio::test]
    async fn bracketed_method_to_self_dispatches_admin() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let (conn, mut rx) = client();
        let msg = UmfMessage::new(
            "hydra-router:[get]/v1/router/version",
            "abc@client:/",
            serde_json::json!({}),
        );
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;
        let reply = recv_frame(&mut rx);
        assert_eq!(reply.rmid.as_deref(), Some(msg.mid.as_str()));
        assert_eq!(reply.body["result"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn dispatch_picks_first_instance_and_tags_via() {
        let registry = Arc::new(MockRegistry::new());
        registry.set_presence("red", &["i1", "i2"]);
        let gw = gateway_with(registry.clone());
        let (conn, _rx) = client();

        let msg = UmfMessage::new("red:/v1/red/job", "abc@client:/", serde_json::json!({}));
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        let sent = registry.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "i1@red:/v1/red/job");
        assert_eq!(sent[0].via.as_deref(), Some("gw1-abc@hydra-router:/"));
    }

    #[tokio::test]
    async fn dispatch_no_instances_replies_error() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());
        let (conn, mut rx) = client();

        let msg = UmfMessage::new("red:/v1/red/job", "abc@client:/", serde_json::json!({}));
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        let reply = recv_frame(&mut rx);
        assert_eq!(reply.body["error"], "No red instances available");
        assert!(registry.sent().is_empty());
        assert!(gw.error_stats.aggregates("red").is_some());
    }

    #[tokio::test]
    async fn dispatch_explicit_instance_goes_direct() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());
        let (conn, _rx) = client();

        let msg = UmfMessage::new("i9@red:/v1/red/job", "abc@client:/", serde_json::json!({}));
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        let sent = registry.sent();
        assert_eq!(sent[0].to, "i9@red:/v1/red/job");
        assert!(sent[0].via.is_some());
    }

    #[tokio::test]
    async fn forward_to_local_client_delivers() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let (target, mut target_rx) = client();
        gw.directory.register("u", target);
        let (conn, _rx) = client();

        let msg = UmfMessage::new("x:/", "abc@client:/", serde_json::json!({"x": 1}))
            .with_forward("u@client:/");
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        let delivered = recv_frame(&mut target_rx);
        assert_eq!(delivered.body["x"], 1);
    }

    #[tokio::test]
    async fn forward_to_remote_replica_rewrites_to() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());
        gw.directory.apply_add("gw2", "u");
        let (conn, _rx) = client();

        let msg = UmfMessage::new("x:/", "abc@client:/", serde_json::json!({}))
            .with_forward("u@client:/");
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        let sent = registry.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "gw2@hydra-router:/");
        assert_eq!(sent[0].forward.as_deref(), Some("u@client:/"));
    }

    #[tokio::test]
    async fn forward_to_unknown_client_queues_offline() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());
        let (conn, _rx) = client();

        let msg = UmfMessage::new("x:/", "abc@client:/", serde_json::json!({}))
            .with_forward("u@client:/");
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        assert_eq!(
            registry.list_len("hydra-router:message:queue:u:queued"),
            1
        );
    }

    #[tokio::test]
    async fn reconnect_rebinds_and_drains_in_order() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());

        // Two messages queued while "abc" was away.
        let first = UmfMessage::new("x:/", "red:/", serde_json::json!({"n": 1}));
        let second = UmfMessage::new("x:/", "red:/", serde_json::json!({"n": 2}));
        gw.offline.enqueue("abc", &first).await.unwrap();
        gw.offline.enqueue("abc", &second).await.unwrap();

        let (conn, mut rx) = client();
        gw.directory.register("tmp", conn.clone());

        let msg = UmfMessage::new(
            "hydra-router:/",
            "tmp@client:/",
            serde_json::json!({"id": "abc"}),
        )
        .with_type("reconnect");
        let action = gw
            .handle_client_frame("tmp", &conn, &msg.to_json().unwrap())
            .await;
        assert_eq!(action, WsAction::Rebind("abc".to_string()));

        let got1 = recv_frame(&mut rx);
        let got2 = recv_frame(&mut rx);
        assert_eq!(got1.body["n"], 1);
        assert_eq!(got2.body["n"], 2);

        // Everything delivered and completed.
        assert_eq!(registry.list_len("hydra-router:message:queue:abc:queued"), 0);
        assert_eq!(
            registry.list_len("hydra-router:message:queue:abc:processing"),
            0
        );

        // The del/add gossip pair went out.
        let gossip: Vec<String> = registry
            .broadcasts()
            .iter()
            .filter_map(|m| m.typ.clone())
            .collect();
        assert_eq!(gossip, vec!["wsdir.del", "wsdir.add"]);
    }

    #[tokio::test]
    async fn wsdir_loc_reports_owning_replica() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        gw.directory.apply_add("gw2", "u");
        let (conn, mut rx) = client();

        let msg = UmfMessage::new(
            "hydra-router:/wsdir",
            "abc@client:/",
            serde_json::json!({"clientID": "u"}),
        )
        .with_type("wsdir.loc");
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;

        let reply = recv_frame(&mut rx);
        assert_eq!(reply.body["routerID"], "gw2");
        assert_eq!(reply.body["clientID"], "u");

        // Unknown client comes back with an empty routerID.
        let msg = UmfMessage::new(
            "hydra-router:/wsdir",
            "abc@client:/",
            serde_json::json!({"clientID": "ghost"}),
        )
        .with_type("wsdir.loc");
        gw.handle_client_frame("abc", &conn, &msg.to_json().unwrap())
            .await;
        assert_eq!(recv_frame(&mut rx).body["routerID"], "");
    }

    // Source B ---------------------------------------------------------------

    #[tokio::test]
    async fn bus_refresh_is_scoped() {
        let registry = Arc::new(MockRegistry::new());
        registry.set_routes("red", &["[get]/v1/red/hello"]);
        registry.set_routes("blue", &["[get]/v1/blue/hi"]);
        let gw = gateway_with(registry);

        let msg = UmfMessage::new(
            "hydra-router:/",
            "blue:/",
            serde_json::json!({"action": "refresh", "serviceName": "blue"}),
        );
        gw.handle_bus_message(msg).await;

        assert!(gw.route_table.lookup("/v1/blue/hi").is_some());
        assert!(gw.route_table.lookup("/v1/red/hello").is_none());
    }

    #[tokio::test]
    async fn bus_gossip_updates_global_directory() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));

        let add = UmfMessage::new(
            "hydra-router:/",
            "gw2@hydra-router:/",
            serde_json::json!({"routerID": "gw2", "clientID": "u1"}),
        )
        .with_type("wsdir.add");
        gw.handle_bus_message(add).await;
        assert_eq!(gw.directory.find_replica("u1").as_deref(), Some("gw2"));

        let del = UmfMessage::new(
            "hydra-router:/",
            "gw2@hydra-router:/",
            serde_json::json!({"routerID": "gw2", "clientID": "u1"}),
        )
        .with_type("wsdir.del");
        gw.handle_bus_message(del).await;
        assert_eq!(gw.directory.find_replica("u1"), None);
    }

    #[tokio::test]
    async fn bus_gossip_from_self_is_ignored() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let add = UmfMessage::new(
            "hydra-router:/",
            "gw1@hydra-router:/",
            serde_json::json!({"routerID": "gw1", "clientID": "phantom"}),
        )
        .with_type("wsdir.add");
        gw.handle_bus_message(add).await;
        // Our own set is maintained locally, not via gossip.
        assert_eq!(gw.directory.find_replica("phantom"), None);
    }

    #[tokio::test]
    async fn bus_sha_answers_with_directory() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());
        let (conn, _rx) = client();
        gw.directory.register("abc", conn);

        let sha = UmfMessage::new(
            "hydra-router:/",
            "gw2@hydra-router:/",
            serde_json::json!({"routerID": "gw2"}),
        )
        .with_type("wsdir.sha");
        gw.handle_bus_message(sha).await;

        let sent = registry.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "gw2@hydra-router:/");
        assert_eq!(sent[0].typ.as_deref(), Some("wsdir.dir"));
        assert_eq!(sent[0].body["routerID"], "gw1");
        assert_eq!(sent[0].body["clientIDs"][0], "abc");
    }

    #[tokio::test]
    async fn bus_dir_adopts_full_set() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        gw.directory.apply_add("gw2", "old");

        let dir = UmfMessage::new(
            "gw1@hydra-router:/",
            "gw2@hydra-router:/",
            serde_json::json!({"routerID": "gw2", "clientIDs": ["u1", "u2"]}),
        )
        .with_type("wsdir.dir");
        gw.handle_bus_message(dir).await;

        assert_eq!(gw.directory.find_replica("old"), None);
        assert_eq!(gw.directory.find_replica("u1").as_deref(), Some("gw2"));
        assert_eq!(gw.directory.find_replica("u2").as_deref(), Some("gw2"));
    }

    #[tokio::test]
    async fn bus_via_delivers_locally_and_strips_tag() {
        let gw = gateway_with(Arc::new(MockRegistry::new()));
        let (conn, mut rx) = client();
        gw.directory.register("abc", conn);

        let mut msg = UmfMessage::new(
            "gw1@hydra-router:/",
            "i1@red:/",
            serde_json::json!({"x": 1}),
        );
        msg.via = Some("gw1-abc@hydra-router:/".to_string());
        gw.handle_bus_message(msg).await;

        let delivered = recv_frame(&mut rx);
        assert_eq!(delivered.body["x"], 1);
        assert!(delivered.via.is_none());
    }

    #[tokio::test]
    async fn bus_via_for_absent_client_queues() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());

        let mut msg = UmfMessage::new(
            "gw1@hydra-router:/",
            "i1@red:/",
            serde_json::json!({"x": 1}),
        );
        msg.via = Some("gw1-abc@hydra-router:/".to_string());
        gw.handle_bus_message(msg).await;

        let queued = registry.list_contents("hydra-router:message:queue:abc:queued");
        assert_eq!(queued.len(), 1);
        // The queued copy keeps its via tag.
        let stored = UmfMessage::from_json(&queued[0]).unwrap();
        assert!(stored.via.is_some());
    }

    #[tokio::test]
    async fn bus_forward_relays_like_source_a() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());
        gw.directory.apply_add("gw2", "u");

        let msg = UmfMessage::new("gw1@hydra-router:/", "i1@red:/", serde_json::json!({}))
            .with_forward("u@client:/");
        gw.handle_bus_message(msg).await;

        assert_eq!(registry.sent()[0].to, "gw2@hydra-router:/");
    }

    #[tokio::test]
    async fn drain_stops_when_connection_dies_mid_flight() {
        let registry = Arc::new(MockRegistry::new());
        let gw = gateway_with(registry.clone());

        let first = UmfMessage::new("x:/", "red:/", serde_json::json!({"n": 1}));
        let second = UmfMessage::new("x:/", "red:/", serde_json::json!({"n": 2}));
        gw.offline.enqueue("abc", &first).await.unwrap();
        gw.offline.enqueue("abc", &second).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ClientConnection::new(tx, "unknown".into()));
        drop(rx); // connection is gone before the drain starts

        gw.drain_offline("abc", &conn).await;

        // Nothing was moved to processing and nothing was lost from queued.
        assert_eq!(registry.list_len("hydra-router:message:queue:abc:queued"), 2);
        assert_eq!(
            registry.list_len("hydra-router:message:queue:abc:processing"),
            0
        );
    }
}
