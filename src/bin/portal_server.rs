//!
//! provisioning portal server binary
//! ---------------------------------
//! Command-line entry point for the portal HTTP/WS server. Configuration comes from
//! environment variables; a few CLI flags override them.

use std::collections::HashMap;
use std::env;

use anyhow::Result;
use provision_portal::config::PortalConfig;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            return args.get(i + 1).filter(|v| !v.starts_with("--")).cloned();
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// CLI flags expressed as the environment variables they override.
fn overrides_from_args(args: &[String]) -> HashMap<&'static str, String> {
    let mut m = HashMap::new();
    if let Some(v) = arg_value(args, "--port") { m.insert("PORT", v); }
    if let Some(v) = arg_value(args, "--jwt-secret") { m.insert("JWT_SECRET", v); }
    if let Some(v) = arg_value(args, "--store") { m.insert("PORTAL_STORE", v); }
    if has_flag(args, "--no-seed") { m.insert("PORTAL_SEED_DEMO", "false".to_string()); }
    m
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("Provisioning Portal Server\n\nUSAGE:\n  portal_server [--port N] [--jwt-secret S] [--store redis|memory] [--no-seed]\n\nOPTIONS:\n  --port N            HTTP port (env: PORT, default 5000)\n  --jwt-secret S      Token signing secret (env: JWT_SECRET, required)\n  --store KIND        Credential store backend (env: PORTAL_STORE, default redis)\n  --no-seed           Do not create the demo account (env: PORTAL_SEED_DEMO)\n\nOther settings: JWT_EXPIRES_IN, FRONTEND_URL, REDIS_HOST, REDIS_PORT, REDIS_PASSWORD,\nREDIS_DB, PORTAL_EMIT_JOB_EVENTS, PORTAL_ENV, ARGON2_MEMORY_KIB, ARGON2_ITERATIONS,\nARGON2_PARALLELISM, RUST_LOG.\n");
        return Ok(());
    }

    let overrides = overrides_from_args(&args);
    let config = PortalConfig::from_lookup(|name| overrides.get(name).cloned().or_else(|| env::var(name).ok()))?;
    tracing::debug!("{:?}", config);
    provision_portal::server::run(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn flags_map_to_variables() {
        let m = overrides_from_args(&args(&["portal_server", "--port", "8080", "--store", "memory", "--no-seed"]));
        assert_eq!(m.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(m.get("PORTAL_STORE").map(String::as_str), Some("memory"));
        assert_eq!(m.get("PORTAL_SEED_DEMO").map(String::as_str), Some("false"));
        assert!(!m.contains_key("JWT_SECRET"));
    }

    #[test]
    fn flag_without_value_is_ignored() {
        let m = overrides_from_args(&args(&["portal_server", "--port", "--no-seed"]));
        assert!(!m.contains_key("PORT"));
    }
}
