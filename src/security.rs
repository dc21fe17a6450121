//! Argon2 password hashing.
//!
//! Hashes are PHC strings, so the parameters a hash was made with travel with it and a
//! change of work factor never invalidates existing passwords. Hashing and
//! verification are CPU-bound; the async entry points run them on tokio's blocking pool.

use anyhow::{anyhow, Result};
use argon2::{Algorithm, Argon2, Params, PasswordHasher as _, PasswordVerifier, Version};
use once_cell::sync::OnceCell;
use password_hash::{PasswordHash, SaltString};

/// Argon2id work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkFactor {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for WorkFactor {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl WorkFactor {
    /// Cheapest parameters argon2 accepts; only meant for tests.
    pub fn minimal() -> Self { Self { memory_kib: 8, iterations: 1, parallelism: 1 } }
}

#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    /// Hash verified against when there is no real one, so misses cost as much as hits.
    dummy: std::sync::Arc<OnceCell<String>>,
}

impl PasswordHasher {
    pub fn new(work: WorkFactor) -> Result<Self> {
        let params = Params::new(work.memory_kib, work.iterations, work.parallelism, None)
            .map_err(|e| anyhow!("invalid argon2 work factor {:?}: {}", work, e))?;
        Ok(Self { params, dummy: Default::default() })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash_password(&self, password: &str) -> Result<String> {
        let mut salt_bytes = [0u8; 16];
        getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
        let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
        let phc = self.argon2().hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
        Ok(phc)
    }

    pub fn verify_password(&self, hash: &str, password: &str) -> bool {
        if let Ok(parsed) = PasswordHash::new(hash) {
            self.argon2().verify_password(password.as_bytes(), &parsed).is_ok()
        } else { false }
    }

    /// Burn the same verification cost as a real check and always fail.
    pub fn verify_dummy(&self, password: &str) -> bool {
        let hash = self.dummy.get_or_try_init(|| self.hash_password("placeholder-credential"));
        if let Ok(h) = hash { let _ = self.verify_password(h, password); }
        false
    }

    pub async fn hash_password_async(&self, password: String) -> Result<String> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.hash_password(&password)).await?
    }

    /// Verify on the blocking pool; `None` for the hash runs the dummy check.
    pub async fn verify_password_async(&self, hash: Option<String>, password: String) -> bool {
        let this = self.clone();
        tokio::task::spawn_blocking(move || match hash {
            Some(h) => this.verify_password(&h, &password),
            None => this.verify_dummy(&password),
        })
        .await
        .unwrap_or(false)
    }
}
