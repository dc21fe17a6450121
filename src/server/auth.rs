//! Auth gateway handlers: login, logout, me, register.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Form, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{json_body, AppState};
use crate::error::{AppError, AppResult};
use crate::identity::{Claims, CredentialError, NewUser, DEFAULT_ROLE};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPayload {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub login_type: Option<String>,
}

/// Login credentials from a JSON or urlencoded form body. A missing body, or one of any
/// other content type, reads as empty credentials and so fails as a normal bad login.
#[derive(Debug, Default)]
pub struct LoginForm(pub LoginPayload);

fn is_json(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

impl<S> FromRequest<S> for LoginForm
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(payload) = Form::<LoginPayload>::from_request(req, state).await.map_err(|e| {
                debug!("unreadable login form: {}", e);
                AppError::user("bad_request", "Malformed form body")
            })?;
            return Ok(Self(payload));
        }
        if !is_json(&content_type) {
            return Ok(Self::default());
        }

        let body = Bytes::from_request(req, state).await.map_err(|e| {
            debug!("unreadable login body: {}", e);
            AppError::user("bad_request", "Malformed request body")
        })?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(&body).map(Self).map_err(|e| {
            debug!("malformed login JSON: {}", e);
            AppError::user("bad_request", "Malformed JSON body")
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterPayload {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

fn required(v: Option<String>, message: &str) -> AppResult<String> {
    match v {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(AppError::user("missing_field", message)),
    }
}

pub async fn login(State(state): State<AppState>, LoginForm(payload): LoginForm) -> AppResult<Json<Value>> {
    let LoginPayload { email, password, login_type } = payload;
    if let Some(kind @ ("directory" | "ad")) = login_type.as_deref() {
        // Directory logins are checked against the local store until a directory adapter exists
        debug!(email = %email, login_type = kind, "directory login requested");
    }

    let user = match state.credentials.validate_user(&email, &password).await {
        Ok(u) => u,
        Err(CredentialError::InvalidCredentials | CredentialError::NotFound) => {
            info!(email = %email, "login rejected");
            return Err(AppError::auth("invalid_credentials", "Invalid credentials"));
        }
        Err(e) => return Err(AppError::internal_logged("login_failed", e)),
    };

    let token = state.tokens.issue(&user).map_err(|e| AppError::internal_logged("token_issue", e))?;
    info!(email = %user.email, role = %user.role, "login ok");
    Ok(Json(json!({
        "success": true,
        "user": user,
        "token": token,
        "message": "Login successful",
    })))
}

/// Tokens are stateless, so there is nothing to revoke; clients drop theirs.
pub async fn logout() -> Json<Value> {
    Json(json!({"success": true, "message": "Logged out successfully"}))
}

pub async fn me(Extension(claims): Extension<Claims>) -> Json<Value> {
    Json(json!({"success": true, "user": claims}))
}

pub async fn register(State(state): State<AppState>, payload: Result<Json<RegisterPayload>, JsonRejection>) -> AppResult<impl IntoResponse> {
    let RegisterPayload { email, password, name, role } = json_body(payload)?;
    let email = required(email, "Email is required")?;
    let password = required(password, "Password is required")?;
    let name = required(name, "Name is required")?;
    let role = role.filter(|r| !r.is_empty()).unwrap_or_else(|| DEFAULT_ROLE.to_string());

    state
        .credentials
        .store_user(&email, NewUser { name, role: role.clone(), password: Some(password) })
        .await
        .map_err(|e| AppError::internal_logged("register_failed", e))?;
    info!(email = %email, role = %role, "user registered");
    Ok((StatusCode::CREATED, Json(json!({"success": true, "message": "User registered successfully"}))))
}
