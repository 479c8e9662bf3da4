//! Logged-in users from `who`, resampled when utmp changes.

use crate::config::{Frequency, FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_USERS_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::run_command;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    #[serde(rename = "id")]
    pub name: String,
}

impl Sortable for User {
    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

/// Distinct user names, the first field of each `who` line.
pub fn parse_who(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub struct UsersPlugin {
    ctx: PluginContext,
    frequency: Frequency,
}

impl UsersPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.users_refresh_sec,
            FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_USERS_UPDATES,
        );
        Self { ctx, frequency }
    }
}

impl Plugin for UsersPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("sessions", "users")
    }

    fn schedule(&self) -> Schedule {
        Schedule::watch(self.frequency, vec![self.ctx.host.var("run/utmp")])
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let output = run_command("/usr/bin/env", &["who"])?;
        let users = parse_who(&output).into_iter().map(|name| User { name });
        let data = InventoryDataset::from_items(users)?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn who_output_formats() {
        let outputs = [
            "vagrant  pts/0        Oct 24 14:26 (10.0.2.2)\n\
vagrant  pts/1        Oct 24 14:26 (10.0.2.2)\n\
newrelic  pts/1        Oct 24 14:26 (10.0.2.2)",
            "vagrant  pts/0        2018-10-24 15:55 (10.0.2.2)\n\
\n\
vagrant  pts/1        2018-10-24 15:55 (10.0.2.2)\n\
newrelic  pts/1        2018-10-24 15:55 (10.0.2.2)",
        ];
        for output in outputs {
            let users = parse_who(output);
            assert_eq!(users.into_iter().collect::<Vec<_>>(), vec!["newrelic", "vagrant"]);
        }
    }
}
