//! HTTP surface: CORS preflights, admin dispatch, and the catch-all
//! forwarding handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use common::UmfMessage;
use metrics::counter;
use registry_client::ApiResponse;
use serde_json::json;
use tower_http::services::{ServeDir, ServeFile};
use tracing::debug;

use crate::admin::AdminRequest;
use crate::forwarder::ForwardedResponse;
use crate::ws_server::{client_ip, ws_handler};
use crate::Gateway;

/// Build the axum router: the websocket endpoint, the static dashboard
/// assets, and the catch-all gateway handler.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route_service("/index.css", ServeFile::new("public/index.css"))
        .route_service("/index.js", ServeFile::new("public/index.js"))
        .nest_service("/fonts", ServeDir::new("public/fonts"))
        .fallback(gateway_handler)
        .with_state(gateway)
}

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn parse_query(url: &str) -> HashMap<String, String> {
    match url.split_once('?') {
        Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        None => HashMap::new(),
    }
}

fn response_with(status: u16, headers: &[(String, String)], body: Bytes) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap()
    })
}

fn uniform_json(status: u16, result: serde_json::Value, cors: &[(String, String)]) -> Response {
    let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
    headers.extend(cors.iter().cloned());
    let body = json!({ "statusCode": status, "result": result });
    response_with(
        status,
        &headers,
        Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
    )
}

fn api_response_to_http(response: ApiResponse, cors: &[(String, String)]) -> Response {
    match response.headers {
        Some(headers) => {
            let headers: Vec<(String, String)> = headers
                .into_iter()
                .map(|(name, value)| (name.to_lowercase(), value))
                .collect();
            response_with(
                response.status_code,
                &headers,
                Bytes::from(response.payload.unwrap_or_default().into_bytes()),
            )
        }
        None => uniform_json(
            response.status_code,
            response.result.unwrap_or(serde_json::Value::Null),
            cors,
        ),
    }
}

fn forwarded_to_http(forwarded: ForwardedResponse) -> Response {
    response_with(forwarded.status, &forwarded.headers, forwarded.body)
}

/// The catch-all request handler: preflights answer immediately, admin
/// routes dispatch locally, everything else goes through the forwarder.
pub async fn gateway_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    counter!("gateway_http_requests_total").increment(1);

    let method = req.method().clone();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = lowercase_headers(req.headers());
    let ip = client_ip(req.headers(), Some(remote));
    let cors = gateway.config.cors_headers();

    if method == Method::OPTIONS {
        return response_with(204, &cors, Bytes::new());
    }

    let matched = gateway
        .route_table
        .resolve(&url, headers.get("referer").map(|s| s.as_str()));
    let Some(matched) = matched else {
        debug!("no route for {} {}", method, url);
        counter!("gateway_http_unmatched_total").increment(1);
        return uniform_json(404, json!({ "reason": "Not found" }), &cors);
    };

    let body = to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    if !matched.external && matched.service == gateway.service_name() {
        let path = url.split('?').next().unwrap_or(&url);
        let query = parse_query(&url);
        if !gateway.admin_authorized(path, &query, &ip) {
            return uniform_json(404, json!({ "reason": "Not found" }), &cors);
        }

        let frame = if method == Method::POST {
            UmfMessage::from_json(&String::from_utf8_lossy(&body)).ok()
        } else {
            None
        };
        let request = AdminRequest {
            method: method.as_str().to_lowercase(),
            pattern: matched
                .pattern
                .clone()
                .unwrap_or_else(|| path.to_string()),
            captures: matched.captures.clone(),
            query,
            frame,
        };
        let response = gateway.handle_admin(request).await;
        return api_response_to_http(response, &cors);
    }

    let forwarded = gateway
        .forward_http(method.as_str(), &headers, body, &matched)
        .await;
    forwarded_to_http(forwarded)
}
