// src/config.rs
//
// Environment-driven configuration for both daemons.
//
// All values come from environment variables; no hardcoded IPs, URLs, or
// credentials. Required variables must be set, optional ones have defaults.
// Validation happens once at startup and the structs are immutable after
// that. `from_vars` takes a plain map so validation is testable without
// mutating the process environment.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Edge daemon configuration
// ============================================================================

/// Edge daemon configuration for the Sungrow-to-VPS pipeline.
#[derive(Clone, Debug)]
pub struct EdgeConfig {
    /// WiNet-S dongle IP address / hostname on the local LAN.
    pub sungrow_host: String,
    /// Modbus TCP port (default 502).
    pub sungrow_port: u16,
    /// Modbus slave / unit ID (1-247, default 1).
    pub sungrow_slave_id: u8,
    /// Seconds between Modbus poll cycles (min 5, WiNet-S stability rule).
    pub poll_interval_s: u64,
    /// Milliseconds between register group reads within one poll cycle.
    pub inter_register_delay_ms: u64,
    /// VPS base URL for ingestion. Must be https.
    pub vps_base_url: String,
    /// Per-device bearer token for VPS auth.
    pub vps_device_token: String,
    /// Device identifier sent in samples. Defaults to sungrow_host.
    pub device_id: String,
    /// Max samples per upload batch (1..=1000).
    pub batch_size: usize,
    /// Seconds between upload attempts.
    pub upload_interval_s: u64,
    /// Maximum uploader backoff in seconds.
    pub max_backoff_s: f64,
    /// HTTPS request timeout in seconds.
    pub upload_timeout_s: u64,
    /// SQLite spool file path for local buffering.
    pub spool_path: String,
    /// Liveness JSON file path.
    pub health_path: String,
    /// Log a raw register snapshot every N polls when enabled.
    pub raw_debug_enabled: bool,
    pub raw_debug_every_n_polls: u64,
    /// Optional directory for file logging.
    pub log_dir: Option<String>,
}

impl EdgeConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, String> {
        let sungrow_host = required(vars, "SUNGROW_HOST")?;
        let sungrow_port: u16 = parsed(vars, "SUNGROW_PORT", 502)?;
        let sungrow_slave_id: u8 = parsed(vars, "SUNGROW_SLAVE_ID", 1)?;
        let poll_interval_s: u64 = parsed(vars, "POLL_INTERVAL_S", 5)?;
        let inter_register_delay_ms: u64 = parsed(vars, "INTER_REGISTER_DELAY_MS", 20)?;
        let vps_base_url = required(vars, "VPS_BASE_URL")?;
        let vps_device_token = required(vars, "VPS_DEVICE_TOKEN")?;
        let batch_size: usize = parsed(vars, "BATCH_SIZE", 30)?;
        let upload_interval_s: u64 = parsed(vars, "UPLOAD_INTERVAL_S", 10)?;
        let max_backoff_s: f64 = parsed(vars, "MAX_BACKOFF_S", 300.0)?;
        let upload_timeout_s: u64 = parsed(vars, "UPLOAD_TIMEOUT_S", 30)?;

        if sungrow_port < 1 {
            return Err("SUNGROW_PORT must be between 1 and 65535".to_string());
        }
        if sungrow_slave_id < 1 || sungrow_slave_id > 247 {
            return Err("SUNGROW_SLAVE_ID must be between 1 and 247".to_string());
        }
        // Minimum 5 s between polls to avoid overloading the WiNet-S dongle
        if poll_interval_s < 5 {
            return Err("POLL_INTERVAL_S must be >= 5 (WiNet-S stability)".to_string());
        }
        if batch_size < 1 || batch_size > 1000 {
            return Err("BATCH_SIZE must be >= 1 and <= 1000".to_string());
        }
        if !is_https(&vps_base_url) {
            return Err(format!(
                "VPS_BASE_URL must use HTTPS (got: '{}')",
                truncate(&vps_base_url, 20)
            ));
        }

        let device_id = match vars.get("DEVICE_ID") {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => sungrow_host.clone(),
        };

        Ok(EdgeConfig {
            sungrow_host,
            sungrow_port,
            sungrow_slave_id,
            poll_interval_s,
            inter_register_delay_ms,
            vps_base_url,
            vps_device_token,
            device_id,
            batch_size,
            upload_interval_s,
            max_backoff_s,
            upload_timeout_s,
            spool_path: defaulted(vars, "SPOOL_PATH", "/data/spool.db"),
            health_path: defaulted(vars, "HEALTH_PATH", "/data/health.json"),
            raw_debug_enabled: parsed(vars, "RAW_DEBUG_ENABLED", false)?,
            raw_debug_every_n_polls: parsed(vars, "RAW_DEBUG_EVERY_N_POLLS", 60)?,
            log_dir: vars.get("LOG_DIR").cloned(),
        })
    }
}

// ============================================================================
// Ingest service configuration
// ============================================================================

/// Ingest service configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// PostgreSQL / TimescaleDB connection URL.
    pub database_url: String,
    /// Redis connection URL for the realtime cache.
    pub cache_url: String,
    /// Raw "tok:dev,tok:dev" credential string.
    pub device_tokens: String,
    /// Maximum samples accepted per ingest request.
    pub max_samples_per_request: usize,
    /// Maximum request body size in bytes.
    pub max_request_bytes: usize,
    /// Realtime cache TTL in seconds.
    pub cache_ttl_s: u64,
    /// Listen address for the HTTP server.
    pub bind_addr: String,
    /// Dashboard origin allowed by CORS for GET queries, if any.
    pub dashboard_origin: Option<String>,
    /// Optional directory for file logging.
    pub log_dir: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, String> {
        let mut missing = Vec::new();
        for key in ["DATABASE_URL", "CACHE_URL", "DEVICE_TOKENS"] {
            if vars.get(key).map(|v| v.trim().is_empty()).unwrap_or(true) {
                missing.push(key);
            }
        }
        if !missing.is_empty() {
            return Err(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            ));
        }

        Ok(ServerConfig {
            database_url: required(vars, "DATABASE_URL")?,
            cache_url: required(vars, "CACHE_URL")?,
            device_tokens: required(vars, "DEVICE_TOKENS")?,
            max_samples_per_request: parsed(vars, "MAX_SAMPLES_PER_REQUEST", 1000)?,
            max_request_bytes: parsed(vars, "MAX_REQUEST_BYTES", 1_048_576)?,
            cache_ttl_s: parsed(vars, "CACHE_TTL_S", 5)?,
            bind_addr: defaulted(vars, "BIND_ADDR", "0.0.0.0:8080"),
            dashboard_origin: vars.get("DASHBOARD_ORIGIN").cloned(),
            log_dir: vars.get("LOG_DIR").cloned(),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn required(vars: &HashMap<String, String>, key: &str) -> Result<String, String> {
    match vars.get(key) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(format!("{} environment variable is required", key)),
    }
}

fn defaulted(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    match vars.get(key) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn parsed<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, String> {
    match vars.get(key) {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value: '{}'", key, v.trim())),
        _ => Ok(default),
    }
}

fn is_https(url: &str) -> bool {
    url.to_ascii_lowercase().starts_with("https://")
}

fn truncate(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Short non-reversible token fingerprint for diagnostics.
/// Never log the token itself.
pub fn masked_token(value: &str) -> String {
    if value.is_empty() {
        return "empty".to_string();
    }
    let digest = Sha256::digest(value.as_bytes());
    format!("len={} sha256={}", value.len(), &hex::encode(digest)[..10])
}
