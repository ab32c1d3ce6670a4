//! Configuration for the audit collector.
//!
//! Loaded once at process start, in order of precedence:
//! 1. Environment variables (`PROXY_AUDIT_*`, highest priority)
//! 2. An optional `.env`-style file (`PROXY_AUDIT_ENV_FILE`, default `.env`)
//! 3. Built-in defaults
//!
//! Fields split into two groups: a handful are startup-only (the log paths,
//! the node id, the DB/Redis connection strings) and can only be changed by
//! restarting the process; the rest double as the *default* values for
//! [`runtime::RuntimeConfigManager`], which can override them at runtime
//! without a restart.

pub mod runtime;

pub use runtime::{
    RuntimeConfigManager, RuntimeField, RuntimeSnapshot, RuntimeValue, ValueType, RUNTIME_SCHEMA,
};

use serde::Deserialize;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Immutable, process-lifetime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub node_id: String,
    pub log_path: PathBuf,
    pub error_log_path: PathBuf,
    pub error_log_enabled: bool,
    pub db_path: PathBuf,
    pub redis_url: String,
    pub redis_enabled: bool,
    pub runtime_config_refresh_seconds: f64,

    // Defaults for the RuntimeConfig-mutable fields.
    pub batch_size: u32,
    pub flush_interval_seconds: f64,
    pub poll_interval_seconds: f64,
    pub error_min_level: String,
    pub error_drop_noise: bool,
    pub drop_api_to_api: bool,
    pub drop_loopback_traffic: bool,
    pub drop_invalid_vless_probe: bool,
    pub exclude_detours: Vec<String>,
    pub retention_days: u32,
    pub retention_cleanup_interval_seconds: u64,
    pub retention_delete_batch_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            log_path: PathBuf::from("/var/log/xray/access.log"),
            error_log_path: PathBuf::from("/var/log/xray/error.log"),
            error_log_enabled: true,
            db_path: PathBuf::from("./data/proxy-audit.db"),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            redis_enabled: true,
            runtime_config_refresh_seconds: 3.0,

            batch_size: 300,
            flush_interval_seconds: 1.0,
            poll_interval_seconds: 0.2,
            error_min_level: "warning".to_string(),
            error_drop_noise: false,
            drop_api_to_api: true,
            drop_loopback_traffic: true,
            drop_invalid_vless_probe: false,
            exclude_detours: Vec::new(),
            retention_days: 30,
            retention_cleanup_interval_seconds: 3600,
            retention_delete_batch_size: 5000,
        }
    }
}

/// Mirrors [`Settings`] with every field optional, for deserializing the
/// on-disk TOML template (a value present there overrides the built-in
/// default but is still itself overridden by an environment variable).
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    node_id: Option<String>,
    log_path: Option<String>,
    error_log_path: Option<String>,
    error_log_enabled: Option<bool>,
    db_path: Option<String>,
    redis_url: Option<String>,
    redis_enabled: Option<bool>,
    runtime_config_refresh_seconds: Option<f64>,
    batch_size: Option<u32>,
    flush_interval_seconds: Option<f64>,
    poll_interval_seconds: Option<f64>,
    error_min_level: Option<String>,
    error_drop_noise: Option<bool>,
    drop_api_to_api: Option<bool>,
    drop_loopback_traffic: Option<bool>,
    drop_invalid_vless_probe: Option<bool>,
    exclude_detours: Option<String>,
    retention_days: Option<u32>,
    retention_cleanup_interval_seconds: Option<u64>,
    retention_delete_batch_size: Option<u32>,
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_csv(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Reads `PROXY_AUDIT_ENV_FILE` (default `.env`) if present and sets any
/// `KEY=VALUE` line into the process environment, skipping blank lines and
/// `#` comments. Never overrides a variable already set in the real
/// environment - the file is a convenience floor, not an override layer.
fn load_env_file_if_present() {
    let path = std::env::var("PROXY_AUDIT_ENV_FILE").unwrap_or_else(|_| ".env".to_string());
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = &value[1..value.len() - 1];
        }
        if std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("proxy-audit").join("config.toml"))
    }

    fn load_file_settings() -> FileSettings {
        let Some(path) = Self::config_path() else {
            return FileSettings::default();
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return FileSettings::default();
        };
        toml::from_str(&contents).unwrap_or_default()
    }

    /// Builds effective settings: env var > file > built-in default, field
    /// by field.
    pub fn from_env() -> Self {
        load_env_file_if_present();
        let file = Self::load_file_settings();
        let defaults = Self::default();

        Self {
            node_id: std::env::var("PROXY_AUDIT_NODE_ID")
                .ok()
                .or(file.node_id)
                .unwrap_or(defaults.node_id),
            log_path: std::env::var("PROXY_AUDIT_LOG_PATH")
                .ok()
                .or(file.log_path)
                .map(PathBuf::from)
                .unwrap_or(defaults.log_path),
            error_log_path: std::env::var("PROXY_AUDIT_ERROR_LOG_PATH")
                .ok()
                .or(file.error_log_path)
                .map(PathBuf::from)
                .unwrap_or(defaults.error_log_path),
            error_log_enabled: env_bool("PROXY_AUDIT_ERROR_LOG_ENABLED")
                .or(file.error_log_enabled)
                .unwrap_or(defaults.error_log_enabled),
            db_path: std::env::var("PROXY_AUDIT_DB_PATH")
                .ok()
                .or(file.db_path)
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            redis_url: std::env::var("PROXY_AUDIT_REDIS_URL")
                .ok()
                .or(file.redis_url)
                .unwrap_or(defaults.redis_url),
            redis_enabled: env_bool("PROXY_AUDIT_REDIS_ENABLED")
                .or(file.redis_enabled)
                .unwrap_or(defaults.redis_enabled),
            runtime_config_refresh_seconds: std::env::var("PROXY_AUDIT_RUNTIME_CONFIG_REFRESH_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.runtime_config_refresh_seconds)
                .unwrap_or(defaults.runtime_config_refresh_seconds),

            batch_size: std::env::var("PROXY_AUDIT_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.batch_size)
                .unwrap_or(defaults.batch_size),
            flush_interval_seconds: std::env::var("PROXY_AUDIT_FLUSH_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.flush_interval_seconds)
                .unwrap_or(defaults.flush_interval_seconds),
            poll_interval_seconds: std::env::var("PROXY_AUDIT_POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.poll_interval_seconds)
                .unwrap_or(defaults.poll_interval_seconds),
            error_min_level: std::env::var("PROXY_AUDIT_ERROR_MIN_LEVEL")
                .ok()
                .or(file.error_min_level)
                .unwrap_or(defaults.error_min_level),
            error_drop_noise: env_bool("PROXY_AUDIT_ERROR_DROP_NOISE")
                .or(file.error_drop_noise)
                .unwrap_or(defaults.error_drop_noise),
            drop_api_to_api: env_bool("PROXY_AUDIT_DROP_API_TO_API")
                .or(file.drop_api_to_api)
                .unwrap_or(defaults.drop_api_to_api),
            drop_loopback_traffic: env_bool("PROXY_AUDIT_DROP_LOOPBACK_TRAFFIC")
                .or(file.drop_loopback_traffic)
                .unwrap_or(defaults.drop_loopback_traffic),
            drop_invalid_vless_probe: env_bool("PROXY_AUDIT_DROP_INVALID_VLESS_PROBE")
                .or(file.drop_invalid_vless_probe)
                .unwrap_or(defaults.drop_invalid_vless_probe),
            exclude_detours: env_csv("PROXY_AUDIT_EXCLUDE_DETOURS")
                .or_else(|| file.exclude_detours.map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()))
                .unwrap_or(defaults.exclude_detours),
            retention_days: std::env::var("PROXY_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.retention_days)
                .unwrap_or(defaults.retention_days),
            retention_cleanup_interval_seconds: std::env::var(
                "PROXY_AUDIT_RETENTION_CLEANUP_INTERVAL_SECONDS",
            )
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.retention_cleanup_interval_seconds)
            .unwrap_or(defaults.retention_cleanup_interval_seconds),
            retention_delete_batch_size: std::env::var("PROXY_AUDIT_RETENTION_DELETE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.retention_delete_batch_size)
                .unwrap_or(defaults.retention_delete_batch_size),
        }
    }

    /// Renders the TOML template written by `config init` / `ensure_config_exists`.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# proxy-audit configuration
# Startup-only fields. Anything here is overridden by a PROXY_AUDIT_* env var.
# The batch/filter/retention fields below are only the *defaults*; once the
# collector is running they can be changed live through the runtime_config
# table (see `proxy-audit config show`).

node_id = {node_id:?}
log_path = {log_path:?}
error_log_path = {error_log_path:?}
error_log_enabled = {error_log_enabled}
db_path = {db_path:?}
redis_url = {redis_url:?}
redis_enabled = {redis_enabled}
runtime_config_refresh_seconds = {refresh}

batch_size = {batch_size}
flush_interval_seconds = {flush_interval_seconds}
poll_interval_seconds = {poll_interval_seconds}
error_min_level = {error_min_level:?}
error_drop_noise = {error_drop_noise}
drop_api_to_api = {drop_api_to_api}
drop_loopback_traffic = {drop_loopback_traffic}
drop_invalid_vless_probe = {drop_invalid_vless_probe}
exclude_detours = {exclude_detours:?}
retention_days = {retention_days}
retention_cleanup_interval_seconds = {retention_cleanup_interval_seconds}
retention_delete_batch_size = {retention_delete_batch_size}
"#,
            node_id = self.node_id,
            log_path = self.log_path.display().to_string(),
            error_log_path = self.error_log_path.display().to_string(),
            error_log_enabled = self.error_log_enabled,
            db_path = self.db_path.display().to_string(),
            redis_url = self.redis_url,
            redis_enabled = self.redis_enabled,
            refresh = self.runtime_config_refresh_seconds,
            batch_size = self.batch_size,
            flush_interval_seconds = self.flush_interval_seconds,
            poll_interval_seconds = self.poll_interval_seconds,
            error_min_level = self.error_min_level,
            error_drop_noise = self.error_drop_noise,
            drop_api_to_api = self.drop_api_to_api,
            drop_loopback_traffic = self.drop_loopback_traffic,
            drop_invalid_vless_probe = self.drop_invalid_vless_probe,
            exclude_detours = self.exclude_detours.join(","),
            retention_days = self.retention_days,
            retention_cleanup_interval_seconds = self.retention_cleanup_interval_seconds,
            retention_delete_batch_size = self.retention_delete_batch_size,
        )
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml())
    }

    /// Writes the default config template if no file exists yet - purely a
    /// discovery aid for operators, never required for the collector to run.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        let _ = Self::default().save();
    }
}
