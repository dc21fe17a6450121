//! Realtime relay: WebSocket connections, named rooms, and fan-out.
//!
//! Every frame in either direction is a JSON envelope `{"event": <name>, "data": {...}}`.
//! Each connection gets a UUID and a bounded outbound queue drained by its own writer
//! task, so broadcasting never awaits a slow socket while holding the table lock. A
//! connection whose queue is full is dropped rather than buffered without limit.
//!
//! The relay is unauthenticated; only the browser `Origin` is checked at upgrade time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, info, warn};

use super::AppState;

pub type ConnId = String;

/// Frames queued per connection before it counts as stalled.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected { id: ConnId },

    #[serde(rename = "room:joined")]
    Joined { room: String },

    #[serde(rename = "room:left")]
    Left { room: String },

    #[serde(rename = "room:message")]
    RoomMessage { room: String, message: Value, metadata: Value, sender: ConnId, timestamp: String },

    #[serde(rename = "file-upload")]
    FileUpload {
        #[serde(rename = "jobId")]
        job_id: String,
        user: String,
    },

    #[serde(rename = "provisioning-start")]
    ProvisioningStart {
        #[serde(rename = "jobId")]
        job_id: String,
        user: String,
    },

    #[serde(rename = "provisioning-complete")]
    ProvisioningComplete {
        #[serde(rename = "jobId")]
        job_id: String,
        total: u32,
        success: u32,
        failed: u32,
        user: String,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

/// Envelope for frames from clients; `data` is decoded per event.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RoomRef {
    room: String,
}

#[derive(Debug, Deserialize)]
struct RoomPost {
    room: String,
    #[serde(default)]
    message: Value,
    #[serde(default)]
    metadata: Value,
}

#[derive(Default)]
struct RelayTables {
    connections: HashMap<ConnId, Sender<ServerEvent>>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

/// Connection and room tables shared by every socket task.
#[derive(Clone, Default)]
pub struct RelayState {
    inner: Arc<RwLock<RelayTables>>,
}

impl RelayState {
    pub fn new() -> Self { Self::default() }

    /// Add a connection and queue its `connected` greeting.
    pub fn register(&self) -> (ConnId, Receiver<ServerEvent>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = channel(OUTBOUND_QUEUE_CAPACITY);
        let _ = tx.try_send(ServerEvent::Connected { id: id.clone() });
        self.inner.write().connections.insert(id.clone(), tx);
        (id, rx)
    }

    /// Remove a connection from the table and from every room; empty rooms are dropped.
    pub fn disconnect(&self, id: &str) {
        let mut g = self.inner.write();
        g.connections.remove(id);
        g.rooms.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
    }

    /// Unknown (or already dropped) connections are not added.
    pub fn join(&self, id: &str, room: &str) -> bool {
        let mut g = self.inner.write();
        if !g.connections.contains_key(id) { return false; }
        g.rooms.entry(room.to_string()).or_default().insert(id.to_string());
        true
    }

    pub fn leave(&self, id: &str, room: &str) {
        let mut g = self.inner.write();
        if let Some(members) = g.rooms.get_mut(room) {
            members.remove(id);
            if members.is_empty() {
                g.rooms.remove(room);
            }
        }
    }

    /// Queue `event` for each target without waiting. Targets whose queue is full are
    /// disconnected. Returns the number of frames queued.
    fn fan_out(&self, targets: Vec<ConnId>, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        {
            let g = self.inner.read();
            for id in targets {
                let Some(tx) = g.connections.get(&id) else { continue };
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => stalled.push(id),
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
        for id in stalled {
            warn!(conn = %id, capacity = OUTBOUND_QUEUE_CAPACITY, "outbound queue full, dropping connection");
            self.disconnect(&id);
        }
        delivered
    }

    /// Send to one connection; false when it is gone or was dropped as stalled.
    pub fn send_to(&self, id: &str, event: ServerEvent) -> bool {
        self.fan_out(vec![id.to_string()], &event) == 1
    }

    pub fn is_connected(&self, id: &str) -> bool { self.inner.read().connections.contains_key(id) }

    /// Relay a room post to every member except `sender`. Returns the number of deliveries.
    pub fn broadcast_room(&self, sender: &str, room: &str, message: Value, metadata: Value) -> usize {
        let event = ServerEvent::RoomMessage {
            room: room.to_string(),
            message,
            metadata,
            sender: sender.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let targets: Vec<ConnId> = match self.inner.read().rooms.get(room) {
            Some(members) => members.iter().filter(|m| m.as_str() != sender).cloned().collect(),
            None => return 0,
        };
        self.fan_out(targets, &event)
    }

    /// Push to every open connection.
    pub fn notify_all(&self, event: ServerEvent) -> usize {
        let targets: Vec<ConnId> = self.inner.read().connections.keys().cloned().collect();
        self.fan_out(targets, &event)
    }

    pub fn connection_count(&self) -> usize { self.inner.read().connections.len() }

    pub fn room_members(&self, room: &str) -> Vec<ConnId> {
        let mut v: Vec<ConnId> = self.inner.read().rooms.get(room).map(|m| m.iter().cloned().collect()).unwrap_or_default();
        v.sort();
        v
    }

    pub fn room_count(&self) -> usize { self.inner.read().rooms.len() }

    /// Decode and apply one inbound text frame from `id`.
    pub fn handle_frame(&self, id: &str, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                self.send_to(id, ServerEvent::Error { message: format!("invalid frame: {}", e) });
                return;
            }
        };
        match frame.event.as_str() {
            "client:ready" => info!(conn = %id, "Client ready"),
            "join:room" => match serde_json::from_value::<RoomRef>(frame.data) {
                Ok(RoomRef { room }) => {
                    if self.join(id, &room) {
                        info!(conn = %id, room = %room, "joined room");
                        self.send_to(id, ServerEvent::Joined { room });
                    }
                }
                Err(e) => { self.send_to(id, ServerEvent::Error { message: format!("invalid join:room: {}", e) }); }
            },
            "leave:room" => match serde_json::from_value::<RoomRef>(frame.data) {
                Ok(RoomRef { room }) => {
                    self.leave(id, &room);
                    info!(conn = %id, room = %room, "left room");
                    self.send_to(id, ServerEvent::Left { room });
                }
                Err(e) => { self.send_to(id, ServerEvent::Error { message: format!("invalid leave:room: {}", e) }); }
            },
            "room:message" => match serde_json::from_value::<RoomPost>(frame.data) {
                Ok(RoomPost { room, message, metadata }) => {
                    let n = self.broadcast_room(id, &room, message, metadata);
                    debug!(conn = %id, room = %room, delivered = n, "room message relayed");
                }
                Err(e) => { self.send_to(id, ServerEvent::Error { message: format!("invalid room:message: {}", e) }); }
            },
            other => {
                debug!(conn = %id, event = other, "ignoring unknown event");
                self.send_to(id, ServerEvent::Error { message: format!("unknown event '{}'", other) });
            }
        }
    }
}

/// `*` allows any origin; a request without `Origin` (non-browser client) is allowed.
pub fn origin_allowed(frontend_url: &str, headers: &HeaderMap) -> bool {
    let allowed = frontend_url.trim();
    if allowed == "*" { return true; }
    match headers.get(header::ORIGIN).map(|v| v.to_str()) {
        None => true,
        Some(Ok(origin)) => origin.trim_end_matches('/') == allowed.trim_end_matches('/'),
        Some(Err(_)) => false,
    }
}

pub async fn ws_handler(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    if !origin_allowed(&state.settings.frontend_url, &headers) {
        warn!("relay upgrade refused for origin {:?}", headers.get(header::ORIGIN));
        return (StatusCode::FORBIDDEN, "forbidden: origin").into_response();
    }
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| serve_connection(relay, socket))
}

async fn serve_connection(relay: RelayState, socket: WebSocket) {
    let (id, mut outbound) = relay.register();
    info!(conn = %id, "Client connected");
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => { warn!("failed to encode relay frame: {}", e); continue; }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let reader = async {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => relay.handle_frame(&id, text.as_str()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    // The writer ends once the socket refuses a frame or the relay dropped this connection
    tokio::select! {
        _ = reader => {}
        _ = &mut writer => debug!(conn = %id, "outbound side closed"),
    }

    relay.disconnect(&id);
    writer.abort();
    info!(conn = %id, "Client disconnected");
}
