//! Persistent-channel lifecycle: accept, welcome, dispatch, cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use common::{short_id, UmfMessage};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::directory::ClientConnection;
use crate::message_router::WsAction;
use crate::Gateway;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// IP detection precedence: `x-forwarded-for`, socket address, `"unknown"`.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip = client_ip(&headers, Some(remote));
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, ip))
}

/// Run one client connection to completion.
async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, ip: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut client_id = short_id();
    let conn = Arc::new(ClientConnection::new(tx, ip.clone()));
    gateway.directory.register(&client_id, conn.clone());
    gateway
        .gossip_wsdir("wsdir.add", json!({ "clientID": client_id }))
        .await;

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(gateway.directory.client_count() as f64);
    info!("client {} connected from {}", client_id, ip);

    // Welcome frame carrying the assigned id.
    let mut welcome = UmfMessage::new(
        format!("{}@client:/", client_id),
        gateway.self_from(),
        json!({ "id": client_id, "ip": ip }),
    );
    welcome.typ = Some("connection".to_string());
    let _ = conn.send_umf(&welcome);

    // Forward outgoing messages from the channel to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                let raw = match msg {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(data))) => {
                        String::from_utf8_lossy(&data).into_owned()
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("socket error for {}: {:?}", client_id, e);
                        break;
                    }
                };
                match gateway.handle_client_frame(&client_id, &conn, &raw).await {
                    WsAction::None => {}
                    WsAction::Close => break,
                    WsAction::Rebind(new_id) => {
                        debug!("client {} now answers as {}", client_id, new_id);
                        client_id = new_id;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if conn.tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    gateway.directory.unregister(&client_id);
    gateway
        .gossip_wsdir("wsdir.del", json!({ "clientID": client_id }))
        .await;
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(gateway.directory.client_count() as f64);
    info!("client {} disconnected", client_id);
}
