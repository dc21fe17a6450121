//! Relay integration tests over a real loopback listener.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::*;
use provision_portal::server::{router, AppState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (SocketAddr, AppState) {
    let (state, _) = state_with(&test_config());
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

async fn next_frame(c: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), c.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(t) = msg {
            return serde_json::from_str(&t).unwrap();
        }
    }
}

async fn send_frame(c: &mut Client, v: Value) {
    c.send(Message::Text(v.to_string())).await.unwrap();
}

/// Connect and return the client with its server-assigned id.
async fn connect(addr: SocketAddr) -> (Client, String) {
    let (mut c, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let hello = next_frame(&mut c).await;
    assert_eq!(hello["event"], "connected");
    let id = hello["data"]["id"].as_str().unwrap().to_string();
    (c, id)
}

async fn join(c: &mut Client, room: &str) {
    send_frame(c, json!({"event": "join:room", "data": {"room": room}})).await;
    assert_eq!(next_frame(c).await, json!({"event": "room:joined", "data": {"room": room}}));
}

#[tokio::test]
async fn room_message_reaches_others_but_not_sender() {
    let (addr, _) = spawn_server().await;
    let (mut a, a_id) = connect(addr).await;
    let (mut b, b_id) = connect(addr).await;
    assert_ne!(a_id, b_id);
    join(&mut a, "ops").await;
    join(&mut b, "ops").await;

    send_frame(&mut a, json!({"event": "room:message", "data": {"room": "ops", "message": "hello", "metadata": {"k": 1}}})).await;
    let got = next_frame(&mut b).await;
    assert_eq!(got["event"], "room:message");
    assert_eq!(got["data"]["message"], "hello");
    assert_eq!(got["data"]["metadata"], json!({"k": 1}));
    assert_eq!(got["data"]["sender"], a_id);
    assert!(got["data"]["timestamp"].is_string());

    // The next thing A sees is its own ack, not an echo of the message
    join(&mut a, "other").await;
}

#[tokio::test]
async fn leave_and_disconnect_clean_up_rooms() {
    let (addr, state) = spawn_server().await;
    let (mut a, _) = connect(addr).await;
    let (mut b, b_id) = connect(addr).await;
    join(&mut a, "ops").await;
    join(&mut b, "ops").await;

    send_frame(&mut a, json!({"event": "leave:room", "data": {"room": "ops"}})).await;
    assert_eq!(next_frame(&mut a).await["event"], "room:left");
    assert_eq!(state.relay.room_members("ops"), vec![b_id]);

    b.close(None).await.unwrap();
    for _ in 0..50 {
        if state.relay.connection_count() == 1 { break; }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.relay.connection_count(), 1);
    assert_eq!(state.relay.room_count(), 0);
}

#[tokio::test]
async fn undecodable_frame_gets_error_event() {
    let (addr, _) = spawn_server().await;
    let (mut a, _) = connect(addr).await;
    a.send(Message::Text("{{{".to_string())).await.unwrap();
    let got = next_frame(&mut a).await;
    assert_eq!(got["event"], "error");
    assert!(got["data"]["message"].is_string());
}

#[tokio::test]
async fn foreign_origin_is_refused() {
    let (addr, _) = spawn_server().await;
    let mut req = format!("ws://{}/ws", addr).into_client_request().unwrap();
    req.headers_mut().insert("Origin", "http://evil.example".parse().unwrap());
    assert!(connect_async(req).await.is_err());

    let mut req = format!("ws://{}/ws", addr).into_client_request().unwrap();
    req.headers_mut().insert("Origin", "http://localhost:3001".parse().unwrap());
    assert!(connect_async(req).await.is_ok());
}
