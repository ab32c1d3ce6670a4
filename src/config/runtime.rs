//! RuntimeConfig: a TTL-cached overlay over [`super::Settings`] backed by
//! the `runtime_config` SQLite table, so an operator can tune batching,
//! filtering and retention knobs without restarting the collector (spec
//! §4.5). Every editable field is declared once in [`RUNTIME_SCHEMA`] with
//! its type and valid range, the same shape as the original's
//! `EDITABLE_FIELDS` table, trimmed to the groups this crate actually
//! reads: collector, filter, retention, and the `redis_enabled` toggle.

use super::Settings;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Float,
    Bool,
    Csv,
    Enum,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeField {
    pub key: &'static str,
    pub group: &'static str,
    pub value_type: ValueType,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub options: Option<&'static [&'static str]>,
}

pub const RUNTIME_SCHEMA: &[RuntimeField] = &[
    RuntimeField { key: "batch_size", group: "collector", value_type: ValueType::Int, min: Some(1.0), max: Some(20_000.0), options: None },
    RuntimeField { key: "flush_interval_seconds", group: "collector", value_type: ValueType::Float, min: Some(0.1), max: Some(30.0), options: None },
    RuntimeField { key: "poll_interval_seconds", group: "collector", value_type: ValueType::Float, min: Some(0.05), max: Some(10.0), options: None },
    RuntimeField { key: "error_min_level", group: "filter", value_type: ValueType::Enum, min: None, max: None, options: Some(&["debug", "info", "warning", "error"]) },
    RuntimeField { key: "error_drop_noise", group: "filter", value_type: ValueType::Bool, min: None, max: None, options: None },
    RuntimeField { key: "drop_api_to_api", group: "filter", value_type: ValueType::Bool, min: None, max: None, options: None },
    RuntimeField { key: "drop_loopback_traffic", group: "filter", value_type: ValueType::Bool, min: None, max: None, options: None },
    RuntimeField { key: "drop_invalid_vless_probe", group: "filter", value_type: ValueType::Bool, min: None, max: None, options: None },
    RuntimeField { key: "exclude_detours", group: "filter", value_type: ValueType::Csv, min: None, max: None, options: None },
    RuntimeField { key: "retention_days", group: "retention", value_type: ValueType::Int, min: Some(1.0), max: Some(3650.0), options: None },
    RuntimeField { key: "retention_cleanup_interval_seconds", group: "retention", value_type: ValueType::Int, min: Some(60.0), max: Some(86_400.0), options: None },
    RuntimeField { key: "retention_delete_batch_size", group: "retention", value_type: ValueType::Int, min: Some(100.0), max: Some(200_000.0), options: None },
    RuntimeField { key: "redis_enabled", group: "cache", value_type: ValueType::Bool, min: None, max: None, options: None },
];

pub fn field(key: &str) -> Option<&'static RuntimeField> {
    RUNTIME_SCHEMA.iter().find(|f| f.key == key)
}

/// The resolved set of mutable values the Collector and Filter read each
/// loop iteration - a plain struct, cheap to clone, so the mutex guarding
/// the manager's cache is never held while filtering or batching run.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSnapshot {
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
    pub redis_enabled: bool,
}

impl RuntimeSnapshot {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            batch_size: s.batch_size,
            flush_interval_seconds: s.flush_interval_seconds,
            poll_interval_seconds: s.poll_interval_seconds,
            error_min_level: s.error_min_level.clone(),
            error_drop_noise: s.error_drop_noise,
            drop_api_to_api: s.drop_api_to_api,
            drop_loopback_traffic: s.drop_loopback_traffic,
            drop_invalid_vless_probe: s.drop_invalid_vless_probe,
            exclude_detours: s.exclude_detours.clone(),
            retention_days: s.retention_days,
            retention_cleanup_interval_seconds: s.retention_cleanup_interval_seconds,
            retention_delete_batch_size: s.retention_delete_batch_size,
            redis_enabled: s.redis_enabled,
        }
    }

    /// Built-in defaults, independent of any `Settings` - used by tests and
    /// as the manager's baseline before the first DB load.
    pub fn defaults() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Csv(Vec<String>),
    Enum(String),
}

impl RuntimeValue {
    fn to_json(&self) -> String {
        match self {
            RuntimeValue::Int(v) => v.to_string(),
            RuntimeValue::Float(v) => v.to_string(),
            RuntimeValue::Bool(v) => v.to_string(),
            RuntimeValue::Csv(v) => serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string()),
            RuntimeValue::Enum(v) => serde_json::to_string(v).unwrap_or_else(|_| "\"\"".to_string()),
        }
    }
}

/// Normalizes a raw string into the field's declared type, recognizing the
/// same boolean spellings the schema's `_env_bool` helper does.
fn normalize_value(f: &RuntimeField, raw: &str) -> Result<RuntimeValue, String> {
    match f.value_type {
        ValueType::Bool => {
            let lower = raw.trim().to_ascii_lowercase();
            match lower.as_str() {
                "1" | "true" | "yes" | "on" => Ok(RuntimeValue::Bool(true)),
                "0" | "false" | "no" | "off" => Ok(RuntimeValue::Bool(false)),
                _ => Err(format!("{}: not a boolean: {raw:?}", f.key)),
            }
        }
        ValueType::Int => raw
            .trim()
            .parse::<i64>()
            .map(RuntimeValue::Int)
            .map_err(|_| format!("{}: not an integer: {raw:?}", f.key)),
        ValueType::Float => raw
            .trim()
            .parse::<f64>()
            .map(RuntimeValue::Float)
            .map_err(|_| format!("{}: not a number: {raw:?}", f.key)),
        ValueType::Csv => Ok(RuntimeValue::Csv(
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )),
        ValueType::Enum => {
            let options = f.options.unwrap_or(&[]);
            if options.contains(&raw.trim()) {
                Ok(RuntimeValue::Enum(raw.trim().to_string()))
            } else {
                Err(format!(
                    "{}: {raw:?} not one of {options:?}",
                    f.key
                ))
            }
        }
    }
}

fn check_range(f: &RuntimeField, value: &RuntimeValue) -> Result<(), String> {
    let numeric = match value {
        RuntimeValue::Int(v) => Some(*v as f64),
        RuntimeValue::Float(v) => Some(*v),
        _ => None,
    };
    if let Some(n) = numeric {
        if let Some(min) = f.min {
            if n < min {
                return Err(format!("{}: {n} below minimum {min}", f.key));
            }
        }
        if let Some(max) = f.max {
            if n > max {
                return Err(format!("{}: {n} above maximum {max}", f.key));
            }
        }
    }
    Ok(())
}

struct Cached {
    snapshot: RuntimeSnapshot,
    loaded_at: Instant,
}

/// The overlay itself: holds the `Settings`-derived defaults plus whatever
/// overrides the StateStore last reported, refreshing from the DB at most
/// once per `ttl`.
pub struct RuntimeConfigManager {
    defaults: RuntimeSnapshot,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl RuntimeConfigManager {
    pub fn new(settings: &Settings) -> Self {
        let ttl_seconds = settings.runtime_config_refresh_seconds.max(1.0);
        Self {
            defaults: RuntimeSnapshot::from_settings(settings),
            ttl: Duration::from_secs_f64(ttl_seconds),
            cache: Mutex::new(None),
        }
    }

    /// Returns the current snapshot, reusing the cached value when it's
    /// younger than `ttl` and `force` isn't set. `overrides` is whatever
    /// the StateStore's `runtime_config` table currently holds (already
    /// parsed); callers fetch that themselves and pass it in, keeping this
    /// module free of a direct DB dependency.
    pub fn refresh(&self, overrides: &HashMap<String, RuntimeValue>, force: bool) -> RuntimeSnapshot {
        let mut guard = self.cache.lock().unwrap();
        if !force {
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return cached.snapshot.clone();
                }
            }
        }

        let mut snapshot = self.defaults.clone();
        apply_overrides(&mut snapshot, overrides);

        *guard = Some(Cached {
            snapshot: snapshot.clone(),
            loaded_at: Instant::now(),
        });
        snapshot
    }

    pub fn current(&self) -> RuntimeSnapshot {
        self.cache
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.snapshot.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Validates every `(key, raw_value)` pair before persisting any of
    /// them - all or nothing, so a bad value in a multi-field update never
    /// leaves the config half-applied.
    pub fn validate_items(items: &[(String, String)]) -> Result<Vec<(String, RuntimeValue)>, String> {
        let mut normalized = Vec::with_capacity(items.len());
        for (key, raw) in items {
            let f = field(key).ok_or_else(|| format!("unknown runtime config key: {key}"))?;
            let value = normalize_value(f, raw)?;
            check_range(f, &value)?;
            normalized.push((key.clone(), value));
        }
        Ok(normalized)
    }
}

fn apply_overrides(snapshot: &mut RuntimeSnapshot, overrides: &HashMap<String, RuntimeValue>) {
    for (key, value) in overrides {
        match (key.as_str(), value) {
            ("batch_size", RuntimeValue::Int(v)) => snapshot.batch_size = *v as u32,
            ("flush_interval_seconds", RuntimeValue::Float(v)) => snapshot.flush_interval_seconds = *v,
            ("poll_interval_seconds", RuntimeValue::Float(v)) => snapshot.poll_interval_seconds = *v,
            ("error_min_level", RuntimeValue::Enum(v)) => snapshot.error_min_level = v.clone(),
            ("error_drop_noise", RuntimeValue::Bool(v)) => snapshot.error_drop_noise = *v,
            ("drop_api_to_api", RuntimeValue::Bool(v)) => snapshot.drop_api_to_api = *v,
            ("drop_loopback_traffic", RuntimeValue::Bool(v)) => snapshot.drop_loopback_traffic = *v,
            ("drop_invalid_vless_probe", RuntimeValue::Bool(v)) => snapshot.drop_invalid_vless_probe = *v,
            ("exclude_detours", RuntimeValue::Csv(v)) => snapshot.exclude_detours = v.clone(),
            ("retention_days", RuntimeValue::Int(v)) => snapshot.retention_days = *v as u32,
            ("retention_cleanup_interval_seconds", RuntimeValue::Int(v)) => {
                snapshot.retention_cleanup_interval_seconds = *v as u64
            }
            ("retention_delete_batch_size", RuntimeValue::Int(v)) => {
                snapshot.retention_delete_batch_size = *v as u32
            }
            ("redis_enabled", RuntimeValue::Bool(v)) => snapshot.redis_enabled = *v,
            _ => {}
        }
    }
}

/// Row shape for the `runtime_config_history` audit trail: the StateStore
/// appends one of these each time `update_items` succeeds.
#[derive(Debug, Clone)]
pub struct RuntimeConfigChange {
    pub key: String,
    pub old_value_json: Option<String>,
    pub new_value_json: String,
    pub changed_by: String,
    pub source_ip: Option<String>,
}

impl RuntimeConfigChange {
    pub fn new(key: &str, old: Option<&RuntimeValue>, new: &RuntimeValue, changed_by: &str, source_ip: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            old_value_json: old.map(|v| v.to_json()),
            new_value_json: new.to_json(),
            changed_by: changed_by.to_string(),
            source_ip: source_ip.map(|s| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_recognized_boolean_spellings() {
        let f = field("error_drop_noise").unwrap();
        assert_eq!(normalize_value(f, "yes").unwrap(), RuntimeValue::Bool(true));
        assert_eq!(normalize_value(f, "off").unwrap(), RuntimeValue::Bool(false));
        assert!(normalize_value(f, "maybe").is_err());
    }

    #[test]
    fn rejects_out_of_range_int() {
        let f = field("retention_days").unwrap();
        let v = normalize_value(f, "0").unwrap();
        assert!(check_range(f, &v).is_err());
        let v = normalize_value(f, "30").unwrap();
        assert!(check_range(f, &v).is_ok());
    }

    #[test]
    fn rejects_enum_value_outside_options() {
        let f = field("error_min_level").unwrap();
        assert!(normalize_value(f, "critical").is_err());
        assert!(normalize_value(f, "warning").is_ok());
    }

    #[test]
    fn validate_items_is_all_or_nothing() {
        let items = vec![
            ("retention_days".to_string(), "10".to_string()),
            ("batch_size".to_string(), "not-a-number".to_string()),
        ];
        assert!(RuntimeConfigManager::validate_items(&items).is_err());
    }

    #[test]
    fn refresh_applies_overrides_onto_defaults() {
        let settings = Settings::default();
        let manager = RuntimeConfigManager::new(&settings);
        let mut overrides = HashMap::new();
        overrides.insert("batch_size".to_string(), RuntimeValue::Int(777));
        let snapshot = manager.refresh(&overrides, true);
        assert_eq!(snapshot.batch_size, 777);
        assert_eq!(snapshot.poll_interval_seconds, settings.poll_interval_seconds);
    }

    #[test]
    fn refresh_reuses_cache_within_ttl() {
        let mut settings = Settings::default();
        settings.runtime_config_refresh_seconds = 60.0;
        let manager = RuntimeConfigManager::new(&settings);
        let mut overrides = HashMap::new();
        overrides.insert("batch_size".to_string(), RuntimeValue::Int(1));
        manager.refresh(&overrides, true);

        overrides.insert("batch_size".to_string(), RuntimeValue::Int(2));
        let cached = manager.refresh(&overrides, false);
        assert_eq!(cached.batch_size, 1, "should still read the cached value");
    }
}
