//! Security-relevant settings from `sshd_config`.

use crate::config::{Frequency, FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_SSHD_CONFIG_UPDATES};
use crate::error::AgentError;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, warn};

const PROPERTIES: &[&str] = &[
    "PermitRootLogin",
    "PermitEmptyPasswords",
    "PasswordAuthentication",
    "ChallengeResponseAuthentication",
];

/// Optional leading space, the key, some space, a word value.
static SETTING_LINE: Lazy<Regex> = Lazy::new(|| {
    let alternatives: Vec<String> = PROPERTIES
        .iter()
        .map(|key| format!(r"(\s*){key}\s+([\w-]+)\b"))
        .collect();
    Regex::new(&format!("(?m)^({})", alternatives.join("|"))).expect("Invalid sshd_config regex")
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SshdConfigValue {
    #[serde(rename = "id")]
    pub key: String,
    pub value: String,
}

impl Sortable for SshdConfigValue {
    fn sort_key(&self) -> String {
        self.key.clone()
    }
}

/// Tracked keys to their last configured value.
pub fn parse_sshd_config(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for found in SETTING_LINE.find_iter(text) {
        let fields: Vec<&str> = found.as_str().split_whitespace().collect();
        let [key, value] = fields.as_slice() else {
            warn!(line = %found.as_str(), "invalid line in sshd config");
            continue;
        };
        if PROPERTIES.contains(key) {
            values.insert(key.to_string(), value.to_string());
        }
    }
    values
}

pub struct SshdConfigPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    path: PathBuf,
}

impl SshdConfigPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.sshd_config_refresh_sec,
            FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_SSHD_CONFIG_UPDATES,
        );
        let path = ctx.host.etc("ssh/sshd_config");
        Self {
            ctx,
            frequency,
            path,
        }
    }
}

impl Plugin for SshdConfigPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("config", "sshd")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn can_run(&mut self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(_) => true,
            Err(e) => {
                error!(plugin = %self.id(), path = %self.path.display(), error = %e, "cannot read sshd config");
                false
            }
        }
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let text = std::fs::read_to_string(&self.path)?;
        let values = parse_sshd_config(&text)
            .into_iter()
            .map(|(key, value)| SshdConfigValue { key, value });
        let data = InventoryDataset::from_items(values)?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_keys_only_last_wins() {
        let config = "# Authentication:\n\
PermitRootLogin yes\n\
#PermitEmptyPasswords yes\n\
  PasswordAuthentication no\n\
ChallengeResponseAuthentication no\n\
UsePAM yes\n\
PermitRootLogin without-password\n\
X11Forwarding yes\n";
        let values = parse_sshd_config(config);
        assert_eq!(values.len(), 3);
        assert_eq!(values["PermitRootLogin"], "without-password");
        assert_eq!(values["PasswordAuthentication"], "no");
        assert_eq!(values["ChallengeResponseAuthentication"], "no");
        assert!(!values.contains_key("PermitEmptyPasswords"));
    }
}
