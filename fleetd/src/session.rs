//! Server half of the agent session: one WebSocket per agent.
//!
//! A writer task drains the session's outbound channel so replies and
//! broadcast control frames never interleave on the socket. The read loop
//! handles the handshake, pings and task requests until the peer goes away.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use fleet_common::{decode_envelope, Envelope, ErrorReply, RequestKind, TokenGrant};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionId, SessionHandle};
use crate::server::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_session(socket, addr, state))
}

struct Connection {
    id: ConnectionId,
    identity: String,
    token: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Connection {
    fn reply<T: Serialize>(&self, body: &T) {
        match serde_json::to_string(body) {
            Ok(frame) => {
                if self.outbound.send(frame).is_err() {
                    debug!("Session {} writer already closed", self.id);
                }
            }
            Err(err) => error!("Failed to encode reply for {}: {}", self.identity, err),
        }
    }

    fn reject(&self, error: impl Into<String>) {
        let error = error.into();
        warn!(client = %self.identity, "Rejected request: {}", error);
        self.reply(&ErrorReply::new(error));
    }
}

pub async fn serve_session(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let (mut sink, stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(err) = sink.send(Message::Text(frame)).await {
                debug!("Socket write failed: {}", err);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let identity = addr.ip().to_string();
    let id = state.registry.register(SessionHandle::new(
        identity.clone(),
        addr.to_string(),
        outbound.clone(),
    ));
    info!(client = %identity, remote = %addr, "Agent connected");

    let mut connection = Connection {
        id,
        identity,
        token: None,
        outbound,
    };
    read_loop(stream, &mut connection, &state).await;

    state.registry.remove(&connection.id);
    if connection.token.is_some()
        && !state
            .registry
            .has_other_session(&connection.identity, &connection.id)
    {
        if let Err(err) = state.repo.delete_connection(&connection.identity).await {
            warn!(client = %connection.identity, "Failed to delete connection record: {}", err);
        }
    }
    info!(client = %connection.identity, "Agent disconnected");

    drop(connection);
    if let Err(err) = writer.await {
        debug!("Session writer ended abnormally: {}", err);
    }
}

async fn read_loop(mut stream: SplitStream<WebSocket>, connection: &mut Connection, state: &AppState) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    connection.reject("binary frame is not UTF-8");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(client = %connection.identity, "Socket read failed: {}", err);
                break;
            }
        };
        handle_frame(&text, connection, state).await;
    }
}

async fn handle_frame(text: &str, connection: &mut Connection, state: &AppState) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            connection.reject(format!("invalid JSON frame: {err}"));
            return;
        }
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

    match RequestKind::parse(kind) {
        Some(RequestKind::RequestToken) => {
            let declared = value
                .get("client_ip")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .unwrap_or(&connection.identity)
                .to_string();
            handshake(declared, connection, state).await;
        }
        Some(RequestKind::Ping) => connection.reply(&json!({ "response": "pong" })),
        Some(RequestKind::TaskRequest) => match decode_envelope(text) {
            Ok(envelope) => task_request(envelope, connection, state).await,
            Err(err) => connection.reject(err.to_string()),
        },
        None => connection.reject(format!("unknown request type '{kind}'")),
    }
}

async fn handshake(identity: String, connection: &mut Connection, state: &AppState) {
    let issued = match state.issuer.issue(&identity).await {
        Ok(issued) => issued,
        Err(err) => {
            connection.reject(format!("token issuance failed: {err}"));
            return;
        }
    };

    state
        .registry
        .bind(&connection.id, &identity, &issued.token, issued.expires_at);
    if let Err(err) = state
        .repo
        .upsert_connection(&identity, &issued.token, issued.expires_at)
        .await
    {
        warn!(client = %identity, "Failed to persist connection record: {}", err);
    }

    if identity != connection.identity {
        debug!("Session {} rebound from {} to {}", connection.id, connection.identity, identity);
    }
    connection.identity = identity;
    connection.token = Some(issued.token.clone());
    info!(client = %connection.identity, "Token issued, expires {}", issued.expires_at);

    connection.reply(&TokenGrant::new(
        issued.token,
        issued.expires_at,
        Some(fleet_build_info::formatted_banner("fleetd", env!("CARGO_PKG_VERSION"))),
    ));
}

async fn task_request(envelope: Envelope, connection: &Connection, state: &AppState) {
    match connection.token.as_deref() {
        Some(token) if token == envelope.token => {}
        Some(_) => return connection.reject("invalid token"),
        None => return connection.reject("no token issued for this session"),
    }

    match state.dispatcher.dispatch(&envelope.msg).await {
        Ok(response) => connection.reply(&response),
        Err(err) => connection.reject(err.to_string()),
    }
}
