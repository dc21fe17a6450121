//!
//! portal storage module
//! ---------------------
//! The credential store only needs a handful of key/value commands: whole-hash writes and
//! reads, a set of member strings, plain strings with an expiry, and deletes. `KvBackend`
//! names exactly those commands so the same credential logic runs against Redis in
//! production and against the in-process `MemoryKv` in tests and single-node setups.
//!
//! Every command is atomic on its own. Sequences of commands are not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod kv;
pub mod redis;

pub use kv::MemoryKv;
pub use redis::{RedisKv, RedisSettings};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("wrong value type at key '{0}'")]
    WrongType(String),

    #[error("failed to (de)serialize stored value: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Write (and merge) fields into the hash at `key`.
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> StorageResult<()>;
    /// All fields of the hash at `key`; empty when the key does not exist.
    async fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, String>>;
    async fn sadd(&self, key: &str, member: &str) -> StorageResult<()>;
    async fn srem(&self, key: &str, member: &str) -> StorageResult<()>;
    async fn smembers(&self, key: &str) -> StorageResult<Vec<String>>;
    /// Set a plain string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<()>;
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;
    /// Delete `key`; returns true if it existed.
    async fn del(&self, key: &str) -> StorageResult<bool>;
}

pub type SharedKv = Arc<dyn KvBackend>;
