//! Puppet facter facts, flattened to `a/b/c` keys.

use crate::config::{Frequency, FREQ_MINIMUM_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_FACTER_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::run_command_with_env;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

const FACTER_PATH_ENV: &str = "/bin:/sbin:/usr/bin:/usr/sbin:/usr/local/bin";
const TIMESTAMP_SUPPRESSED: &str = "(timestamp suppressed)";

/// Facts whose key contains one of these change constantly.
const IGNORED_FACTS: &[&str] = &[
    "used_bytes",
    "available_bytes",
    "load_averages",
    "used",
    "capacity",
    "available",
    "system_uptime",
    "uptime_seconds",
    "uptime",
    "uptime_days",
    "uptime_hours",
    "memoryfree",
    "memoryfree_mb",
    "swapfree",
    "swapfree_mb",
    "last_run",
    "puppet_agent_pid",
];

const SENSITIVE_KEYS: &[&str] = &["key", "secret", "password", "token", "passphrase", "credential"];

static ISO8601: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})-(\d{2})-(\d{2})T(\d{2}):(\d{2}):(\d{2})([zZ]|[+|-]\d{2}:\d{2})")
        .expect("Invalid ISO8601 regex")
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacterItem {
    #[serde(rename = "id")]
    pub name: String,
    pub value: String,
}

impl Sortable for FacterItem {
    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

/// Where facts come from; the real one shells out to `facter`.
pub trait FactSource: Send {
    fn initialize(&mut self) -> Result<(), AgentError>;
    fn facts(&mut self) -> Result<BTreeMap<String, FacterItem>, AgentError>;
}

pub struct FacterClient {
    home_dir: Option<PathBuf>,
}

impl FactSource for FacterClient {
    fn initialize(&mut self) -> Result<(), AgentError> {
        which::which("facter")
            .map(|_| ())
            .map_err(|e| AgentError::NotApplicable(format!("facter not found: {e}")))
    }

    fn facts(&mut self) -> Result<BTreeMap<String, FacterItem>, AgentError> {
        let facter = which::which("facter")
            .map_err(|e| AgentError::NotApplicable(format!("facter not found: {e}")))?;
        let home = self
            .home_dir
            .as_ref()
            .map(|h| h.to_string_lossy().into_owned());
        let mut env = vec![("PATH", FACTER_PATH_ENV)];
        if let Some(home) = home.as_deref() {
            env.push(("HOME", home));
        }
        let output = run_command_with_env(&facter.to_string_lossy(), &["-p", "-j"], &env)?;
        parse_facts(&output, IGNORED_FACTS)
    }
}

/// `facter -j` output to filtered, flattened, sanitized facts.
pub fn parse_facts(output: &str, ignored: &[&str]) -> Result<BTreeMap<String, FacterItem>, AgentError> {
    let output = ISO8601.replace_all(output, TIMESTAMP_SUPPRESSED);
    let parsed: Map<String, Value> = serde_json::from_str(&output)?;
    let mut flat = BTreeMap::new();
    flatten_json("", &parsed, &mut flat);
    sanitize(&mut flat);
    Ok(build_filtered_map(flat, ignored))
}

/// Nested objects become `parent/child` keys; scalars and arrays become strings.
pub fn flatten_json(parent: &str, data: &Map<String, Value>, out: &mut BTreeMap<String, String>) {
    for (k, v) in data {
        let key = if parent.is_empty() {
            k.clone()
        } else {
            format!("{parent}/{k}")
        };
        match v {
            Value::Object(inner) => flatten_json(&key, inner, out),
            Value::String(s) => {
                out.insert(key, s.clone());
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}

/// Values under sensitive-looking keys are replaced with a digest.
fn sanitize(facts: &mut BTreeMap<String, String>) {
    for (k, v) in facts.iter_mut() {
        let lower = k.to_lowercase();
        if SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
            let digest = Sha256::digest(v.as_bytes());
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            *v = format!("Secret obfuscated - sha256 hash: {hex}");
        }
    }
}

pub fn build_filtered_map(
    facts: BTreeMap<String, String>,
    ignored: &[&str],
) -> BTreeMap<String, FacterItem> {
    facts
        .into_iter()
        .filter(|(k, _)| !ignored.iter().any(|i| k.contains(i)))
        .map(|(name, value)| (name.clone(), FacterItem { name, value }))
        .collect()
}

pub struct FacterPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    source: Box<dyn FactSource>,
}

impl FacterPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let home_dir = ctx.config.plugins.facter_home_dir.clone();
        Self::with_source(ctx, Box::new(FacterClient { home_dir }))
    }

    pub fn with_source(ctx: PluginContext, source: Box<dyn FactSource>) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.facter_interval_sec,
            FREQ_MINIMUM_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_FACTER_UPDATES,
        );
        Self {
            ctx,
            frequency,
            source,
        }
    }
}

impl Plugin for FacterPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("metadata", "facter_facts")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn can_run(&mut self) -> bool {
        let ready = self.source.initialize().and_then(|_| self.source.facts());
        if let Err(e) = &ready {
            debug!(plugin = %self.id(), error = %e, "facter unavailable");
        }
        ready.is_ok()
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let facts = self.source.facts()?;
        let data = InventoryDataset::from_items(facts.into_values())?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}
