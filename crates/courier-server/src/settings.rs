//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `COURIER_*` environment variable overrides (highest priority)

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use courier_core::User;
use courier_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn, Level};

use crate::config::ServerConfig;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Connection-type settings of the served consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Broadcast group joined on connect. `None` disables publishing.
    pub group: Option<String>,
    /// Refuse anonymous connections.
    pub require_auth: bool,
    /// Lifetime of the session snapshot written on connect.
    pub session_ttl_secs: u64,
    /// Payload lookup fields (`to_<field>`) used to resolve recipients.
    pub lookup_fields: Vec<String>,
    /// Run `after_catch` at the end of each routing pass.
    pub run_after_catch: bool,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group: Some("chat".into()),
            require_auth: false,
            session_ttl_secs: 40 * 60,
            lookup_fields: vec!["user_id".into(), "username".into()],
            run_after_catch: false,
        }
    }
}

impl ConsumerSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub level: String,
    pub json: bool,
    pub metrics: bool,
    /// Per-module levels, e.g. `{"courier_routing": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            metrics: true,
            modules: BTreeMap::new(),
        }
    }
}

impl TelemetrySettings {
    pub fn to_config(&self) -> Result<TelemetryConfig> {
        let parse = |s: &str| {
            Level::from_str(s).map_err(|_| SettingsError::InvalidValue(format!("log level `{s}`")))
        };
        let module_levels = self
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse(level)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(TelemetryConfig {
            log_level: parse(&self.level)?,
            module_levels,
            json: self.json,
            metrics_enabled: self.metrics,
        })
    }
}

/// Top-level settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierSettings {
    pub server: ServerConfig,
    pub consumer: ConsumerSettings,
    pub telemetry: TelemetrySettings,
    /// Seed users for the in-memory directory.
    pub users: Vec<User>,
}

/// Load settings from `path` (if any) with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: CourierSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COURIER_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut CourierSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Invalid values are logged and
/// ignored; an empty `COURIER_GROUP` disables the group.
pub fn apply_overrides(settings: &mut CourierSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("COURIER_HOST").filter(|v| !v.is_empty()) {
        settings.server.host = v;
    }
    if let Some(v) = lookup("COURIER_PORT") {
        match v.parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(_) => warn!(key = "COURIER_PORT", value = %v, "invalid port, ignoring"),
        }
    }
    if let Some(v) = lookup("COURIER_GROUP") {
        settings.consumer.group = (!v.is_empty()).then_some(v);
    }
    if let Some(v) = lookup("COURIER_REQUIRE_AUTH") {
        match parse_bool(&v) {
            Some(b) => settings.consumer.require_auth = b,
            None => warn!(key = "COURIER_REQUIRE_AUTH", value = %v, "invalid boolean, ignoring"),
        }
    }
    if let Some(v) = lookup("COURIER_SESSION_TTL_SECS") {
        match parse_u64_range(&v, 1, 86_400) {
            Some(secs) => settings.consumer.session_ttl_secs = secs,
            None => warn!(key = "COURIER_SESSION_TTL_SECS", value = %v, "invalid ttl, ignoring"),
        }
    }
    if let Some(v) = lookup("COURIER_LOG_LEVEL").filter(|v| !v.is_empty()) {
        settings.telemetry.level = v;
    }
    if let Some(v) = lookup("COURIER_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.telemetry.json = b,
            None => warn!(key = "COURIER_LOG_JSON", value = %v, "invalid boolean, ignoring"),
        }
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
