//! Credential Store: user records and session blobs over a `KvBackend`.
//!
//! Key layout (shared with the Redis deployment):
//! - `users:<email>`   hash {email, name, role, password}
//! - `users`           set of every registered email
//! - `sessions:<id>`   JSON string, 24h expiry
//!
//! Emails are exact, case-sensitive keys.

use std::time::Duration;

use base64::Engine;
use tracing::{debug, warn};

use super::principal::{NewUser, PublicUser, StoredUser, UserUpdate};
use crate::security::PasswordHasher;
use crate::storage::{SharedKv, StorageError};

const USERS_KEY: &str = "users";
const SESSIONS_KEY: &str = "sessions";
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("not found")]
    NotFound,

    /// Deliberately says nothing about which half of the credentials was wrong.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

fn user_key(email: &str) -> String { format!("{}:{}", USERS_KEY, email) }
fn session_key(id: &str) -> String { format!("{}:{}", SESSIONS_KEY, id) }

#[derive(Clone)]
pub struct CredentialStore {
    kv: SharedKv,
    hasher: PasswordHasher,
}

impl CredentialStore {
    pub fn new(kv: SharedKv, hasher: PasswordHasher) -> Self { Self { kv, hasher } }

    async fn hash(&self, password: String) -> CredentialResult<String> {
        self.hasher.hash_password_async(password).await.map_err(|e| CredentialError::Hashing(e.to_string()))
    }

    pub async fn store_user(&self, email: &str, user: NewUser) -> CredentialResult<()> {
        let mut fields = vec![
            ("email".to_string(), email.to_string()),
            ("name".to_string(), user.name),
            ("role".to_string(), user.role),
        ];
        if let Some(pw) = user.password {
            fields.push(("password".to_string(), self.hash(pw).await?));
        }
        self.kv.hset_all(&user_key(email), &fields).await?;
        self.kv.sadd(USERS_KEY, email).await?;
        debug!(email = email, "user stored");
        Ok(())
    }

    pub async fn get_user(&self, email: &str) -> CredentialResult<StoredUser> {
        let fields = self.kv.hgetall(&user_key(email)).await?;
        StoredUser::from_fields(fields).ok_or(CredentialError::NotFound)
    }

    /// Check a login attempt. Unknown user, missing hash and wrong password are all the
    /// same `InvalidCredentials`, and all pay for one Argon2 verification.
    pub async fn validate_user(&self, email: &str, password: &str) -> CredentialResult<PublicUser> {
        let user = match self.get_user(email).await {
            Ok(u) => Some(u),
            Err(CredentialError::NotFound) => None,
            Err(e) => return Err(e),
        };
        let hash = user.as_ref().and_then(|u| u.password_hash.clone());
        let ok = self.hasher.verify_password_async(hash, password.to_string()).await;
        match user {
            Some(u) if ok => Ok(u.into()),
            _ => Err(CredentialError::InvalidCredentials),
        }
    }

    pub async fn update_user(&self, email: &str, update: UserUpdate) -> CredentialResult<()> {
        // Refuse to conjure a partial record for an unknown email
        self.get_user(email).await?;
        let mut fields = Vec::new();
        if let Some(name) = update.name { fields.push(("name".to_string(), name)); }
        if let Some(role) = update.role { fields.push(("role".to_string(), role)); }
        if let Some(pw) = update.password { fields.push(("password".to_string(), self.hash(pw).await?)); }
        self.kv.hset_all(&user_key(email), &fields).await?;
        Ok(())
    }

    /// Returns whether a record existed.
    pub async fn delete_user(&self, email: &str) -> CredentialResult<bool> {
        let existed = self.kv.del(&user_key(email)).await?;
        self.kv.srem(USERS_KEY, email).await?;
        Ok(existed)
    }

    /// All users, sorted by email, never with password hashes.
    pub async fn list_users(&self) -> CredentialResult<Vec<PublicUser>> {
        let mut emails = self.kv.smembers(USERS_KEY).await?;
        emails.sort();
        let mut out = Vec::with_capacity(emails.len());
        for email in emails {
            match self.get_user(&email).await {
                Ok(u) => out.push(u.into()),
                // set entry without a record: a delete raced us, skip it
                Err(CredentialError::NotFound) => warn!(email = %email, "user index entry without record"),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// 256 random bits, base64url without padding.
    pub fn new_session_id() -> CredentialResult<String> {
        let mut buf = [0u8; 32];
        getrandom::getrandom(&mut buf).map_err(|e| StorageError::Command(e.to_string()))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
    }

    pub async fn store_session(&self, session_id: &str, data: &serde_json::Value) -> CredentialResult<()> {
        let raw = serde_json::to_string(data).map_err(StorageError::from)?;
        self.kv.set_ex(&session_key(session_id), &raw, SESSION_TTL).await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> CredentialResult<serde_json::Value> {
        let raw = self.kv.get(&session_key(session_id)).await?.ok_or(CredentialError::NotFound)?;
        Ok(serde_json::from_str(&raw).map_err(StorageError::from)?)
    }

    pub async fn delete_session(&self, session_id: &str) -> CredentialResult<bool> {
        Ok(self.kv.del(&session_key(session_id)).await?)
    }
}
