//! Agent configuration: file (YAML or JSON), then `INVENTORY_AGENT_*` environment overrides.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const ENV_PREFIX: &str = "INVENTORY_AGENT_";

/// Frequency request meaning "never sample".
pub const FREQ_DISABLE_SAMPLING: i64 = -1;
/// Frequency request meaning "use the plugin default".
pub const FREQ_DEFAULT_SAMPLING: i64 = 0;
pub const FREQ_MINIMUM_INVENTORY_SAMPLE_RATE: i64 = 10;
pub const FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE: i64 = 5;

pub const FREQ_PLUGIN_SYSCTL_UPDATES: i64 = 60;
pub const FREQ_PLUGIN_KERNEL_MODULES_UPDATES: i64 = 10;
pub const FREQ_PLUGIN_USERS_UPDATES: i64 = 15;
pub const FREQ_PLUGIN_SSHD_CONFIG_UPDATES: i64 = 15;
pub const FREQ_PLUGIN_DAEMONTOOLS_UPDATES: i64 = 15;
pub const FREQ_PLUGIN_SYSTEMD_UPDATES: i64 = 30;
pub const FREQ_PLUGIN_SYSVINIT_UPDATES: i64 = 30;
pub const FREQ_PLUGIN_UPSTART_UPDATES: i64 = 30;
pub const FREQ_PLUGIN_FACTER_UPDATES: i64 = 30;
pub const FREQ_PLUGIN_PACKAGE_MGRS_UPDATES: i64 = 30;
pub const FREQ_PLUGIN_SELINUX_UPDATES: i64 = 30;

/// Size limit of a single plugin inventory and of a delta block (bytes).
pub const DEFAULT_MAX_INVENTORY_SIZE: usize = 1000 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Root,
    Privileged,
    Unprivileged,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Root => "root",
            RunMode::Privileged => "privileged",
            RunMode::Unprivileged => "unprivileged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Delta store and agent state live here
    pub data_dir: PathBuf,
    /// Overrides the hostname as the agent entity key
    pub entity_key: Option<String>,
    pub run_mode: RunMode,
    /// Inside a container only host identity is collected
    pub is_containerized: bool,
    /// Plugins left on their default frequency are turned off
    pub disable_all_plugins: bool,
    /// Prefix for /proc, /sys, /etc and /var when the host filesystem is mounted elsewhere
    pub host_root: Option<PathBuf>,
    pub inventory: InventoryConfig,
    pub plugins: PluginsConfig,
    pub uplink: UplinkConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub max_inventory_size: usize,
    /// Seconds between delta submissions
    pub send_interval_secs: u64,
    /// Upper bound on waiting for every plugin before the first submission
    pub first_reap_max_wait_secs: u64,
    /// Local inventory is dropped when nothing was submitted for this long
    pub reset_if_offline_secs: u64,
}

/// Per-plugin sampling intervals in seconds: `-1` disables, `0` uses the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub kernel_modules_refresh_sec: i64,
    pub rpm_refresh_sec: i64,
    pub dpkg_refresh_sec: i64,
    pub systemd_interval_sec: i64,
    pub sysvinit_interval_sec: i64,
    pub upstart_interval_sec: i64,
    pub daemontools_refresh_sec: i64,
    pub selinux_interval_sec: i64,
    pub selinux_enable_semodule: bool,
    pub sysctl_interval_sec: i64,
    pub users_refresh_sec: i64,
    pub sshd_config_refresh_sec: i64,
    pub facter_interval_sec: i64,
    pub facter_home_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// When disabled, deltas are logged and acknowledged locally
    pub enabled: bool,
    /// Collector base URL
    pub endpoint: Option<String>,
    pub license_key: Option<String>,
    pub timeout_secs: u64,
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/db/inventory-agent"),
            entity_key: None,
            run_mode: RunMode::Root,
            is_containerized: false,
            disable_all_plugins: false,
            host_root: None,
            inventory: InventoryConfig::default(),
            plugins: PluginsConfig::default(),
            uplink: UplinkConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            max_inventory_size: DEFAULT_MAX_INVENTORY_SIZE,
            send_interval_secs: 10,
            first_reap_max_wait_secs: 60,
            reset_if_offline_secs: 24 * 60 * 60,
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            license_key: None,
            timeout_secs: 30,
            max_backoff_secs: 300,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl AgentConfig {
    /// Load from file if present (defaults otherwise), apply environment overrides, normalize.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = if path.exists() {
            read_config_value(path)?
        } else {
            Value::Object(Map::new())
        };
        Self::from_value_with_env(raw, std::env::vars())
    }

    /// Builds a config from an already parsed document plus `(name, value)` environment pairs.
    pub fn from_value_with_env(
        mut raw: Value,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, AgentError> {
        if raw.is_null() {
            raw = Value::Object(Map::new());
        }
        let defaults = serde_json::to_value(AgentConfig::default())?;
        overlay_env(&mut raw, &defaults, vars, ENV_PREFIX);
        let mut config: AgentConfig = serde_json::from_value(raw)
            .map_err(|e| AgentError::Config(format!("invalid configuration: {e}")))?;
        config.normalize()?;
        Ok(config)
    }

    pub fn normalize(&mut self) -> Result<(), AgentError> {
        if self.inventory.max_inventory_size == 0
            || self.inventory.max_inventory_size > DEFAULT_MAX_INVENTORY_SIZE
        {
            self.inventory.max_inventory_size = DEFAULT_MAX_INVENTORY_SIZE;
        }
        if self.inventory.send_interval_secs == 0 {
            self.inventory.send_interval_secs = InventoryConfig::default().send_interval_secs;
        }
        if self.uplink.enabled && self.uplink.endpoint.as_deref().unwrap_or("").is_empty() {
            return Err(AgentError::Config(
                "uplink is enabled but no endpoint is configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves a plugin interval against its floor and default.
    pub fn frequency(&self, requested: i64, min: i64, default: i64) -> Frequency {
        validate_frequency(requested, min, default, self.disable_all_plugins)
    }
}

fn read_config_value(path: &Path) -> Result<Value, AgentError> {
    let data = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigFile {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str::<Value>(&data).map_err(|e| AgentError::ConfigFile {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?
    } else {
        serde_yaml::from_str::<Value>(&data).map_err(|e| AgentError::ConfigFile {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?
    };
    Ok(parsed)
}

/// Writes `PREFIX_A__B=value` into `raw["a"]["b"]`. Values are read as JSON scalars; a
/// value that does not fit the field's type is skipped with a warning. String and optional
/// fields take the text as is.
fn overlay_env(
    raw: &mut Value,
    defaults: &Value,
    vars: impl IntoIterator<Item = (String, String)>,
    prefix: &str,
) {
    for (name, value) in vars {
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        let path: Vec<String> = rest.split("__").map(|s| s.to_ascii_lowercase()).collect();
        let Some(default) = lookup(defaults, &path) else {
            continue;
        };
        let scalar = serde_json::from_str::<Value>(value.trim())
            .ok()
            .filter(|v| v.is_boolean() || v.is_number() || v.is_string());
        let typed = match (default, scalar) {
            (Value::Object(_) | Value::Array(_), _) => {
                warn!(variable = %name, "environment override names a section, ignoring");
                continue;
            }
            (Value::Bool(_), Some(Value::Bool(b))) => Value::Bool(b),
            (Value::Bool(_), _) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Value::Bool(true),
                "false" | "0" | "no" => Value::Bool(false),
                _ => {
                    warn!(variable = %name, value = %value, "expected a boolean, ignoring override");
                    continue;
                }
            },
            (Value::Number(_), Some(n @ Value::Number(_))) => n,
            (Value::Number(_), _) => {
                warn!(variable = %name, value = %value, "expected a number, ignoring override");
                continue;
            }
            (_, Some(Value::String(text))) => Value::String(text),
            _ => Value::String(value),
        };
        insert_path(raw, &path, typed);
    }
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.as_object()?.get(key))
}

fn insert_path(root: &mut Value, path: &[String], leaf: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = root;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else { return };
        cursor = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.clone(), leaf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Disabled,
    Every(Duration),
}

/// Returns the effective sampling frequency:
///
/// - `req <= FREQ_DISABLE_SAMPLING`, or `disable` with `req == FREQ_DEFAULT_SAMPLING`: disabled
/// - `FREQ_DEFAULT_SAMPLING <= req < min`: `def`
/// - otherwise `req`
pub fn validate_frequency(req: i64, min: i64, def: i64, disable: bool) -> Frequency {
    if req <= FREQ_DISABLE_SAMPLING || (disable && req == FREQ_DEFAULT_SAMPLING) {
        return Frequency::Disabled;
    }
    let secs = if req < min { def } else { req };
    if secs <= 0 {
        return Frequency::Disabled;
    }
    Frequency::Every(Duration::from_secs(secs as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every(secs: u64) -> Frequency {
        Frequency::Every(Duration::from_secs(secs))
    }

    #[test]
    fn frequency_rules() {
        assert_eq!(validate_frequency(10, 5, 13, false), every(10));
        assert_eq!(validate_frequency(10, 10, 13, false), every(10));
        assert_eq!(validate_frequency(5, 10, 13, false), every(13));
        assert_eq!(validate_frequency(FREQ_DEFAULT_SAMPLING, 10, 13, false), every(13));
        assert_eq!(
            validate_frequency(FREQ_DISABLE_SAMPLING - 1, 10, 13, false),
            Frequency::Disabled
        );
        assert_eq!(
            validate_frequency(FREQ_DEFAULT_SAMPLING, 10, 13, true),
            Frequency::Disabled
        );
        assert_eq!(validate_frequency(10, 5, 13, true), every(10));
    }

    #[test]
    fn env_overrides_nested_and_typed() {
        let vars = vec![
            ("INVENTORY_AGENT_PLUGINS__SYSTEMD_INTERVAL_SEC".to_string(), "45".to_string()),
            ("INVENTORY_AGENT_RUN_MODE".to_string(), "privileged".to_string()),
            ("INVENTORY_AGENT_UPLINK__LICENSE_KEY".to_string(), "12345".to_string()),
            ("INVENTORY_AGENT_LOG__JSON".to_string(), "false".to_string()),
            ("INVENTORY_AGENT_NOT_A_FIELD".to_string(), "x".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
        ];
        let c = AgentConfig::from_value_with_env(Value::Null, vars).unwrap();
        assert_eq!(c.plugins.systemd_interval_sec, 45);
        assert_eq!(c.run_mode, RunMode::Privileged);
        assert_eq!(c.uplink.license_key.as_deref(), Some("12345"));
        assert!(!c.log.json);
    }

    #[test]
    fn mistyped_env_values_keep_the_file_value() {
        let file = serde_json::json!({ "plugins": { "users_refresh_sec": 20 }, "log": { "json": true } });
        let vars = vec![
            ("INVENTORY_AGENT_PLUGINS__USERS_REFRESH_SEC".to_string(), "soon".to_string()),
            ("INVENTORY_AGENT_LOG__JSON".to_string(), "maybe".to_string()),
            ("INVENTORY_AGENT_IS_CONTAINERIZED".to_string(), "1".to_string()),
            ("INVENTORY_AGENT_LOG__LEVEL".to_string(), "\"debug\"".to_string()),
            ("INVENTORY_AGENT_PLUGINS".to_string(), "{}".to_string()),
        ];
        let c = AgentConfig::from_value_with_env(file, vars).unwrap();
        assert_eq!(c.plugins.users_refresh_sec, 20);
        assert!(c.log.json);
        assert!(c.is_containerized);
        assert_eq!(c.log.level, "debug");
    }

    #[test]
    fn env_wins_over_file() {
        let file = serde_json::json!({ "inventory": { "send_interval_secs": 20 } });
        let vars = vec![(
            "INVENTORY_AGENT_INVENTORY__SEND_INTERVAL_SECS".to_string(),
            "30".to_string(),
        )];
        let c = AgentConfig::from_value_with_env(file, vars).unwrap();
        assert_eq!(c.inventory.send_interval_secs, 30);
        assert_eq!(c.inventory.first_reap_max_wait_secs, 60);
    }

    #[test]
    fn max_inventory_size_is_capped() {
        let file = serde_json::json!({ "inventory": { "max_inventory_size": 5_000_000 } });
        let c = AgentConfig::from_value_with_env(file, Vec::new()).unwrap();
        assert_eq!(c.inventory.max_inventory_size, DEFAULT_MAX_INVENTORY_SIZE);
    }

    #[test]
    fn uplink_without_endpoint_is_rejected() {
        let file = serde_json::json!({ "uplink": { "enabled": true } });
        assert!(AgentConfig::from_value_with_env(file, Vec::new()).is_err());
    }
}
