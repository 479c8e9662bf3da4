//! Inventory plugins: each wraps one OS facility and produces keyed inventory datasets.
//! Plugins only sample; scheduling, file-watch triggers and delivery live in the scheduler.

pub mod host;
pub mod linux;
mod registry;
mod scheduler;
mod watch;

use crate::config::{AgentConfig, Frequency};
use crate::error::AgentError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch as tokio_watch;

pub use host::HostPaths;
pub use registry::{deprecated_plugins, linux_plugins};
pub use scheduler::{run_plugin, PluginExit};
pub use watch::FileTrigger;

const PLUGIN_ID_SEPARATOR: char = '/';

/// Identifies a plugin as `category/term`, e.g. `kernel/sysctl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId {
    pub category: String,
    pub term: String,
}

impl PluginId {
    pub fn new(category: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            term: term.into(),
        }
    }

    /// Sibling id in the same category, e.g. `config/selinux` -> `config/selinux-policies`.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(self.category.clone(), format!("{}-{}", self.term, suffix))
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.category, PLUGIN_ID_SEPARATOR, self.term)
    }
}

impl FromStr for PluginId {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(PLUGIN_ID_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(category), Some(term), None) if !category.is_empty() && !term.is_empty() => {
                Ok(PluginId::new(category, term))
            }
            _ => Err(AgentError::parse(
                "plugin id",
                format!("{s:?} is not in the form 'category/term'"),
            )),
        }
    }
}

impl Serialize for PluginId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Inventory items are keyed by their sort key.
pub trait Sortable {
    fn sort_key(&self) -> String;
}

/// One plugin's inventory: sort key -> item object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InventoryDataset(BTreeMap<String, Value>);

impl InventoryDataset {
    pub fn from_items<T, I>(items: I) -> Result<Self, AgentError>
    where
        T: Sortable + Serialize,
        I: IntoIterator<Item = T>,
    {
        let mut map = BTreeMap::new();
        for item in items {
            map.insert(item.sort_key(), serde_json::to_value(&item)?);
        }
        Ok(Self(map))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn into_json(self) -> Map<String, Value> {
        self.0.into_iter().collect()
    }
}

/// What a plugin hands to the inventory handler.
#[derive(Debug, Clone)]
pub struct PluginOutput {
    pub id: PluginId,
    pub entity_key: String,
    pub data: InventoryDataset,
    /// The plugin does not apply to this host; its stored inventory is dropped
    pub not_applicable: bool,
}

impl PluginOutput {
    pub fn new(id: PluginId, entity_key: impl Into<String>, data: InventoryDataset) -> Self {
        Self {
            id,
            entity_key: entity_key.into(),
            data,
            not_applicable: false,
        }
    }

    pub fn not_applicable(id: PluginId, entity_key: impl Into<String>) -> Self {
        Self {
            id,
            entity_key: entity_key.into(),
            data: InventoryDataset::default(),
            not_applicable: true,
        }
    }
}

/// When a plugin samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Disabled,
    /// At start and again whenever the agent reconnects
    Once,
    Every(Duration),
    /// At start, then on each tick only if one of the files changed since the last sample.
    /// The first path that can be watched is used.
    Watch { paths: Vec<PathBuf>, every: Duration },
}

impl Schedule {
    pub fn every(frequency: Frequency) -> Self {
        match frequency {
            Frequency::Disabled => Schedule::Disabled,
            Frequency::Every(d) => Schedule::Every(d),
        }
    }

    pub fn watch(frequency: Frequency, paths: Vec<PathBuf>) -> Self {
        match frequency {
            Frequency::Disabled => Schedule::Disabled,
            Frequency::Every(every) => Schedule::Watch { paths, every },
        }
    }
}

pub trait Plugin: Send + 'static {
    fn id(&self) -> PluginId;

    fn schedule(&self) -> Schedule;

    /// Presence check; a plugin returning false is unregistered.
    fn can_run(&mut self) -> bool {
        true
    }

    /// Blocking; runs on the blocking pool.
    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError>;
}

/// Reconnect requests make one-shot plugins sample again.
#[derive(Debug, Clone)]
pub struct Reconnect {
    tx: Arc<tokio_watch::Sender<u64>>,
}

impl Default for Reconnect {
    fn default() -> Self {
        let (tx, _rx) = tokio_watch::channel(0);
        Self { tx: Arc::new(tx) }
    }
}

impl Reconnect {
    pub fn request(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    pub fn subscribe(&self) -> tokio_watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

/// Shared, read-mostly state handed to plugin constructors.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub entity_key: String,
    pub config: Arc<AgentConfig>,
    pub host: HostPaths,
    pub reconnect: Reconnect,
    pub agent_version: &'static str,
}

impl PluginContext {
    pub fn new(entity_key: impl Into<String>, config: Arc<AgentConfig>) -> Self {
        let host = HostPaths::new(config.host_root.as_deref());
        Self {
            entity_key: entity_key.into(),
            config,
            host,
            reconnect: Reconnect::default(),
            agent_version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn output(&self, id: PluginId, data: InventoryDataset) -> PluginOutput {
        PluginOutput::new(id, self.entity_key.clone(), data)
    }
}
