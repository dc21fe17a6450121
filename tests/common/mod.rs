//! Shared helpers for the in-process router tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use provision_portal::config::PortalConfig;
use provision_portal::server::{router, seed_demo_user, AppState};
use provision_portal::storage::MemoryKv;

pub const TEST_SECRET: &str = "integration-test-secret";

pub fn test_config() -> PortalConfig {
    PortalConfig::for_tests(TEST_SECRET)
}

pub fn state_with(config: &PortalConfig) -> (AppState, MemoryKv) {
    let kv = MemoryKv::new();
    let state = AppState::new(config, Arc::new(kv.clone())).expect("state");
    (state, kv)
}

/// Router over a fresh memory store with the demo account seeded.
pub async fn demo_app() -> (Router, AppState) {
    let (state, _) = state_with(&test_config());
    seed_demo_user(&state.credentials).await;
    (router(state.clone()), state)
}

pub fn json_request(method: Method, uri: &str, body: &Value, token: Option<&str>) -> Request<Body> {
    let mut b = Request::builder().method(method).uri(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(t) = token {
        b = b.header(header::AUTHORIZATION, format!("Bearer {}", t));
    }
    b.body(Body::from(body.to_string())).expect("request")
}

pub fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut b = Request::builder().method(Method::GET).uri(uri);
    if let Some(t) = token {
        b = b.header(header::AUTHORIZATION, format!("Bearer {}", t));
    }
    b.body(Body::empty()).expect("request")
}

pub async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.expect("router is infallible");
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let v = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    (status, v)
}

pub async fn login(app: &Router, email: &str, password: &str) -> (StatusCode, Value) {
    send(app, json_request(Method::POST, "/api/auth/login", &serde_json::json!({"email": email, "password": password}), None)).await
}

pub async fn token_for(app: &Router, email: &str, password: &str) -> String {
    let (status, body) = login(app, email, password).await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["token"].as_str().expect("token").to_string()
}
