//! Handlers for the routes the gateway owns, shared by the HTTP surface and
//! the persistent-channel dispatch.

use std::collections::HashMap;
use std::time::Duration;

use common::UmfMessage;
use registry_client::ApiResponse;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::issue_log::Severity;
use crate::Gateway;

/// Presence entries older than this are dropped by the `clear` endpoint.
const STALE_NODE_CUTOFF: Duration = Duration::from_secs(5);

/// Suffixes exempt from the admin authorization gates.
const STATIC_SUFFIXES: &[&str] = &[".css", ".js", ".ttf", ".woff", ".woff2"];

/// One admin invocation, already matched against the gateway's own routes.
#[derive(Debug, Clone)]
pub struct AdminRequest {
    /// Lowercase HTTP verb.
    pub method: String,
    /// Literal pattern that matched.
    pub pattern: String,
    pub captures: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// POST endpoints receive a framed message as the body.
    pub frame: Option<UmfMessage>,
}

pub fn is_static_asset(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    STATIC_SUFFIXES.iter().any(|s| path.ends_with(s))
}

fn is_localhost(ip: &str) -> bool {
    matches!(ip, "127.0.0.1" | "::1" | "localhost" | "::ffff:127.0.0.1")
}

fn is_uuid_v4(token: &str) -> bool {
    Uuid::parse_str(token).is_ok_and(|u| u.get_version_num() == 4)
}

impl Gateway {
    /// Gate for admin routes reached over HTTP.
    ///
    /// Static asset paths always pass; otherwise `disableRouterEndpoint`
    /// blanket-denies, and a configured `routerToken` requires non-localhost
    /// callers to present the exact UUIDv4 as `?token=`.
    pub fn admin_authorized(
        &self,
        path: &str,
        query: &HashMap<String, String>,
        remote_ip: &str,
    ) -> bool {
        if is_static_asset(path) {
            return true;
        }
        if self.config.disable_router_endpoint {
            return false;
        }
        if let Some(expected) = &self.config.router_token {
            if is_localhost(remote_ip) {
                return true;
            }
            return query
                .get("token")
                .is_some_and(|t| is_uuid_v4(t) && t == expected);
        }
        true
    }

    pub async fn handle_admin(&self, req: AdminRequest) -> ApiResponse {
        match (req.method.as_str(), req.pattern.as_str()) {
            ("get", "/") => self.admin_dashboard().await,
            ("get", "/v1/router/health") => self.admin_health().await,
            ("get", "/v1/router/list/:thing") => {
                let thing = req.captures.get("thing").map(|s| s.as_str()).unwrap_or("");
                self.admin_list(thing).await
            }
            ("get", "/v1/router/version") => ApiResponse {
                result: Some(json!({ "version": env!("CARGO_PKG_VERSION") })),
                ..ApiResponse::default()
            },
            ("get", "/v1/router/clear") => self.admin_clear().await,
            ("get", "/v1/router/refresh") => self.admin_refresh(None).await,
            ("get", "/v1/router/refresh/:service") => {
                self.admin_refresh(req.captures.get("service").map(|s| s.as_str()))
                    .await
            }
            ("get", "/v1/router/log") => ApiResponse {
                result: serde_json::to_value(self.issues.entries()).ok(),
                ..ApiResponse::default()
            },
            ("get", "/v1/router/stats") => self.admin_stats(),
            ("post", "/v1/router/message") => self.admin_message(req.frame).await,
            ("post", "/v1/router/send") => self.admin_send(req.frame).await,
            ("post", "/v1/router/queue") => self.admin_queue(req.frame).await,
            _ => ApiResponse::failure(404, "Not found"),
        }
    }

    async fn admin_dashboard(&self) -> ApiResponse {
        match tokio::fs::read_to_string("public/index.html").await {
            Ok(html) => ApiResponse {
                status_code: 200,
                headers: Some(HashMap::from([(
                    "content-type".to_string(),
                    "text/html".to_string(),
                )])),
                payload: Some(html),
                result: None,
            },
            Err(_) => ApiResponse::failure(404, "Dashboard assets not installed"),
        }
    }

    async fn admin_health(&self) -> ApiResponse {
        match self.registry.get_health().await {
            Ok(health) => ApiResponse {
                result: Some(Value::Array(health)),
                ..ApiResponse::default()
            },
            Err(e) => {
                self.log_issue(Severity::Fatal, format!("health lookup failed: {e}"));
                ApiResponse::failure(500, &e.to_string())
            }
        }
    }

    async fn admin_list(&self, thing: &str) -> ApiResponse {
        let result = match thing {
            "routes" => {
                let mut map = Map::new();
                for (service, routes) in self.route_table.snapshot() {
                    map.insert(service, json!(routes));
                }
                Value::Object(map)
            }
            "services" => match self.registry.get_nodes().await {
                Ok(nodes) => {
                    let mut services: Map<String, Value> = Map::new();
                    for node in nodes {
                        let entry = services
                            .entry(node.service_name.clone())
                            .or_insert_with(|| json!({ "instances": [] }));
                        if let Some(list) =
                            entry.get_mut("instances").and_then(|v| v.as_array_mut())
                        {
                            list.push(json!({
                                "instanceID": node.instance_id,
                                "ip": node.ip,
                                "port": node.port,
                                "elapsed": node.elapsed(),
                            }));
                        }
                    }
                    Value::Object(services)
                }
                Err(e) => return ApiResponse::failure(500, &e.to_string()),
            },
            "nodes" => match self.registry.get_nodes().await {
                Ok(nodes) => {
                    let mut list = Vec::new();
                    for node in nodes {
                        let elapsed = node.elapsed();
                        let mut value = serde_json::to_value(node).unwrap_or(Value::Null);
                        if let Some(obj) = value.as_object_mut() {
                            obj.insert("elapsed".to_string(), json!(elapsed));
                        }
                        list.push(value);
                    }
                    Value::Array(list)
                }
                Err(e) => return ApiResponse::failure(500, &e.to_string()),
            },
            "wsdir" => serde_json::to_value(self.directory.global_snapshot())
                .unwrap_or(Value::Null),
            _ => return ApiResponse::failure(404, "Not found"),
        };
        ApiResponse {
            result: Some(result),
            ..ApiResponse::default()
        }
    }

    async fn admin_clear(&self) -> ApiResponse {
        match self.registry.remove_stale_nodes(STALE_NODE_CUTOFF).await {
            Ok(removed) => ApiResponse {
                result: Some(json!({ "cleared": removed })),
                ..ApiResponse::default()
            },
            Err(e) => ApiResponse::failure(500, &e.to_string()),
        }
    }

    async fn admin_refresh(&self, service: Option<&str>) -> ApiResponse {
        match self.refresh_routes(service).await {
            Ok(()) => {
                let mut map = Map::new();
                for (name, routes) in self.route_table.snapshot() {
                    map.insert(name, json!(routes));
                }
                ApiResponse {
                    result: Some(Value::Object(map)),
                    ..ApiResponse::default()
                }
            }
            Err(e) => {
                self.log_issue(Severity::Fatal, format!("route refresh failed: {e}"));
                ApiResponse::failure(500, &e.to_string())
            }
        }
    }

    fn admin_stats(&self) -> ApiResponse {
        let to_map = |ring: &crate::StatsRing| -> Value {
            let mut map = Map::new();
            for (target, aggregates) in ring.all_aggregates() {
                map.insert(
                    target,
                    serde_json::to_value(aggregates).unwrap_or(Value::Null),
                );
            }
            Value::Object(map)
        };
        ApiResponse {
            result: Some(json!({
                "http": to_map(&self.http_stats),
                "ws": to_map(&self.ws_stats),
                "error": to_map(&self.error_stats),
            })),
            ..ApiResponse::default()
        }
    }

    /// Forward a framed message to its `forward` target and wait for the
    /// upstream result.
    async fn admin_message(&self, frame: Option<UmfMessage>) -> ApiResponse {
        let Some(frame) = frame.filter(|f| f.is_valid()) else {
            return ApiResponse::failure(400, "Body is not a valid message envelope");
        };
        let Some(forward) = frame.forward.clone() else {
            return ApiResponse::failure(400, "Message has no forward route");
        };
        let mut out = frame;
        out.to = forward;
        out.forward = None;
        out.from = self.self_from();
        out.mid = Uuid::new_v4().to_string();
        match self
            .registry
            .make_api_request(&out, self.config.request_timeout())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.log_issue(Severity::Fatal, format!("synchronous forward failed: {e}"));
                ApiResponse::failure(500, &e.to_string())
            }
        }
    }

    /// Fire-and-forget directed send.
    async fn admin_send(&self, frame: Option<UmfMessage>) -> ApiResponse {
        let Some(frame) = frame.filter(|f| f.is_valid()) else {
            return ApiResponse::failure(400, "Body is not a valid message envelope");
        };
        match self.registry.send_message(&frame).await {
            Ok(()) => ApiResponse {
                result: Some(json!({ "mid": frame.mid })),
                ..ApiResponse::default()
            },
            Err(e) => ApiResponse::failure(500, &e.to_string()),
        }
    }

    /// Append to the target service's job queue.
    async fn admin_queue(&self, frame: Option<UmfMessage>) -> ApiResponse {
        let Some(frame) = frame.filter(|f| f.is_valid()) else {
            return ApiResponse::failure(400, "Body is not a valid message envelope");
        };
        match self.registry.queue_message(&frame).await {
            Ok(()) => ApiResponse {
                result: Some(json!({ "mid": frame.mid })),
                ..ApiResponse::default()
            },
            Err(e) => ApiResponse::failure(500, &e.to_string()),
        }
    }
}
