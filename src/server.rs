//!
//! portal HTTP/WS server
//! ---------------------
//! This module assembles the Axum router for the provisioning portal and owns process
//! startup.
//!
//! Responsibilities:
//! - Shared `AppState`: credential store, token service, relay state, server settings.
//! - Route table: public auth endpoints, bearer-protected job endpoints, the `/ws` relay.
//! - Cross-cutting layers: CORS for the configured client origin, request tracing, and
//!   conversion of handler panics into 500 responses.
//! - First-run demo account seeding and graceful shutdown on SIGINT/SIGTERM.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{PortalConfig, StoreKind};
use crate::error::{AppError, AppResult};
use crate::identity::{CredentialStore, NewUser, TokenService};
use crate::security::PasswordHasher;
use crate::storage::{MemoryKv, RedisKv, SharedKv};

pub mod auth;
pub mod jobs;
pub mod middleware;
pub mod relay;

use relay::RelayState;

pub const DEMO_EMAIL: &str = "demo@company.com";
pub const DEMO_PASSWORD: &str = "demo123";

/// Settings handlers read at request time.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub frontend_url: String,
    pub emit_job_events: bool,
}

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub credentials: CredentialStore,
    pub tokens: Arc<TokenService>,
    /// Room membership for the realtime relay. Process-local; not shared across instances.
    pub relay: RelayState,
    pub completed_jobs: jobs::CompletionLog,
    pub settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(config: &PortalConfig, kv: SharedKv) -> anyhow::Result<Self> {
        let hasher = PasswordHasher::new(config.work_factor)?;
        let tokens = TokenService::new(&config.jwt_secret, config.token_ttl).context("While creating token service")?;
        Ok(Self {
            credentials: CredentialStore::new(kv, hasher),
            tokens: Arc::new(tokens),
            relay: RelayState::new(),
            completed_jobs: jobs::CompletionLog::default(),
            settings: Arc::new(ServerSettings {
                frontend_url: config.frontend_url.clone(),
                emit_job_events: config.emit_job_events,
            }),
        })
    }
}

/// Unwrap a JSON body or turn the rejection into the standard 400 shape.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload.map(|Json(v)| v).map_err(|e| AppError::user("bad_request".to_string(), e.body_text()))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "OK", "timestamp": chrono::Utc::now().to_rfc3339()}))
}

async fn not_found() -> AppError {
    AppError::not_found("not_found", "Not found")
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let msg = if let Some(s) = err.downcast_ref::<&str>() { *s }
              else if let Some(s) = err.downcast_ref::<String>() { s.as_str() }
              else { "panic" };
    error!(target: "panic", "HTTP handler panic: {}", msg);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"success": false, "message": "Something went wrong!"}))).into_response()
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    if frontend_url.trim() == "*" {
        return base.allow_origin(AnyOrigin);
    }
    match frontend_url.trim_end_matches('/').parse::<HeaderValue>() {
        Ok(origin) => base.allow_origin(origin),
        Err(e) => {
            warn!("FRONTEND_URL '{}' is not a valid origin ({}); cross-origin requests will be refused", frontend_url, e);
            base
        }
    }
}

/// Build the full route table over `state`.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/upload", post(jobs::upload).layer(axum::extract::DefaultBodyLimit::max(jobs::MAX_UPLOAD_BYTES)))
        .route("/api/provision", post(jobs::provision))
        .route("/api/job/{job_id}", get(jobs::job_status))
        .route("/api/download-sample", get(jobs::download_sample))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_auth));

    let public = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/register", post(auth::register))
        .route("/ws", get(relay::ws_handler));

    let cors = cors_layer(&state.settings.frontend_url);
    Router::new()
        .merge(protected)
        .merge(public)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Store the demo account (overwriting any previous one) so a fresh install can log in.
pub async fn seed_demo_user(credentials: &CredentialStore) {
    let demo = NewUser { name: "Demo User".into(), role: "admin".into(), password: Some(DEMO_PASSWORD.into()) };
    match credentials.store_user(DEMO_EMAIL, demo).await {
        Ok(()) => info!(email = DEMO_EMAIL, "Demo user initialized"),
        Err(e) => warn!("Error initializing demo user: {}", e),
    }
}

async fn open_store(config: &PortalConfig) -> anyhow::Result<SharedKv> {
    match config.store {
        StoreKind::Memory => {
            let kv = MemoryKv::new();
            kv.spawn_sweeper(Duration::from_secs(5));
            info!("Using in-memory credential store; data is lost on restart");
            Ok(Arc::new(kv))
        }
        StoreKind::Redis => {
            let kv = RedisKv::connect(&config.redis)
                .await
                .with_context(|| format!("While connecting to Redis at {}:{}", config.redis.host, config.redis.port))?;
            Ok(Arc::new(kv))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await { error!("failed to listen for SIGINT: {}", e); }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => { s.recv().await; }
            Err(e) => { error!("failed to listen for SIGTERM: {}", e); std::future::pending::<()>().await; }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down gracefully"),
        _ = terminate => info!("SIGTERM received, shutting down gracefully"),
    }
}

/// Start the portal: open the store, seed, bind, and serve until a shutdown signal.
pub async fn run(config: PortalConfig) -> anyhow::Result<()> {
    info!(
        target: "startup",
        "portal starting: port={}, store={:?}, environment={}, frontend_url={}, token_ttl_secs={}, job_events={}",
        config.port,
        config.store,
        if config.production { "production" } else { "development" },
        config.frontend_url,
        config.token_ttl.as_secs(),
        config.emit_job_events
    );
    if config.production {
        info!(target: "startup", "Production mode: static client assets are expected to be served by the fronting web server");
    }

    let kv = open_store(&config).await?;
    let state = AppState::new(&config, kv)?;
    if config.seed_demo_user {
        seed_demo_user(&state.credentials).await;
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("While binding {}", addr))?;
    info!("Server running on {}", addr);
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal()).await?;
    info!("Server stopped");
    Ok(())
}
