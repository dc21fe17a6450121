//! Environment-driven configuration.
//!
//! Every option has an environment variable; the server binary lets a few of them be
//! overridden by CLI flags. The signing secret has no default: startup fails without it.

use std::time::Duration;

use crate::identity::DEFAULT_TOKEN_TTL;
use crate::security::WorkFactor;
use crate::storage::RedisSettings;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_FRONTEND_URL: &str = "http://localhost:3001";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("JWT_SECRET must be set to a non-empty value")]
    MissingSecret,

    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
    Memory,
}

impl std::str::FromStr for StoreKind {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreKind::Redis),
            "memory" | "mem" => Ok(StoreKind::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Clone)]
pub struct PortalConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub port: u16,
    /// Allowed browser origin for CORS and the relay; `*` allows any.
    pub frontend_url: String,
    pub store: StoreKind,
    pub redis: RedisSettings,
    pub seed_demo_user: bool,
    pub emit_job_events: bool,
    pub production: bool,
    pub work_factor: WorkFactor,
}

impl std::fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalConfig")
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("port", &self.port)
            .field("frontend_url", &self.frontend_url)
            .field("store", &self.store)
            .field("redis_host", &self.redis.host)
            .field("redis_port", &self.redis.port)
            .field("redis_db", &self.redis.db)
            .field("seed_demo_user", &self.seed_demo_user)
            .field("emit_job_events", &self.emit_job_events)
            .field("production", &self.production)
            .field("work_factor", &self.work_factor)
            .finish()
    }
}

pub fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Accepts humantime strings ("24h", "30m", "7days") and bare seconds ("3600").
pub fn parse_duration(v: &str) -> Option<Duration> {
    let v = v.trim();
    if let Ok(secs) = v.parse::<u64>() { return Some(Duration::from_secs(secs)); }
    humantime::parse_duration(v).ok()
}

impl PortalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        fn parsed<T>(name: &'static str, raw: Option<String>, f: impl Fn(&str) -> Option<T>) -> Result<Option<T>, ConfigError> {
            match raw {
                None => Ok(None),
                Some(v) => f(&v).map(Some).ok_or(ConfigError::Invalid { name, value: v }),
            }
        }

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::MissingSecret)?;
        let token_ttl = parsed("JWT_EXPIRES_IN", get("JWT_EXPIRES_IN"), parse_duration)?.unwrap_or(DEFAULT_TOKEN_TTL);
        let port = parsed("PORT", get("PORT"), |v| v.parse::<u16>().ok())?.unwrap_or(DEFAULT_PORT);
        let frontend_url = get("FRONTEND_URL").unwrap_or_else(|| DEFAULT_FRONTEND_URL.to_string());
        let store = parsed("PORTAL_STORE", get("PORTAL_STORE"), |v| v.parse::<StoreKind>().ok())?.unwrap_or(StoreKind::Redis);

        let defaults = RedisSettings::default();
        let redis = RedisSettings {
            host: get("REDIS_HOST").unwrap_or(defaults.host),
            port: parsed("REDIS_PORT", get("REDIS_PORT"), |v| v.parse::<u16>().ok())?.unwrap_or(defaults.port),
            password: get("REDIS_PASSWORD"),
            db: parsed("REDIS_DB", get("REDIS_DB"), |v| v.parse::<i64>().ok())?.unwrap_or(defaults.db),
            ..defaults
        };

        let seed_demo_user = parsed("PORTAL_SEED_DEMO", get("PORTAL_SEED_DEMO"), parse_bool)?.unwrap_or(true);
        let emit_job_events = parsed("PORTAL_EMIT_JOB_EVENTS", get("PORTAL_EMIT_JOB_EVENTS"), parse_bool)?.unwrap_or(false);
        let production = get("PORTAL_ENV").map(|v| v.eq_ignore_ascii_case("production")).unwrap_or(false);

        let wf = WorkFactor::default();
        let work_factor = WorkFactor {
            memory_kib: parsed("ARGON2_MEMORY_KIB", get("ARGON2_MEMORY_KIB"), |v| v.parse().ok())?.unwrap_or(wf.memory_kib),
            iterations: parsed("ARGON2_ITERATIONS", get("ARGON2_ITERATIONS"), |v| v.parse().ok())?.unwrap_or(wf.iterations),
            parallelism: parsed("ARGON2_PARALLELISM", get("ARGON2_PARALLELISM"), |v| v.parse().ok())?.unwrap_or(wf.parallelism),
        };

        Ok(Self {
            jwt_secret,
            token_ttl,
            port,
            frontend_url,
            store,
            redis,
            seed_demo_user,
            emit_job_events,
            production,
            work_factor,
        })
    }

    /// In-memory configuration with a cheap hash; what tests and local demos start from.
    pub fn for_tests(secret: &str) -> Self {
        Self {
            jwt_secret: secret.to_string(),
            token_ttl: DEFAULT_TOKEN_TTL,
            port: 0,
            frontend_url: DEFAULT_FRONTEND_URL.to_string(),
            store: StoreKind::Memory,
            redis: RedisSettings::default(),
            seed_demo_user: false,
            emit_job_events: false,
            production: false,
            work_factor: WorkFactor::minimal(),
        }
    }
}
