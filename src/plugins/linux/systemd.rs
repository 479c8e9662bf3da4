//! Running systemd services and their main pids.

use super::ServiceItem;
use crate::config::{Frequency, FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_SYSTEMD_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::{command_exists, run_command};
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::warn;

const SYSTEMCTL: &str = "/bin/systemctl";
const UNKNOWN_PID: &str = "unknown";

static SERVICE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\S+)\.service.*loaded.*?(active|inactive).*?(running|failed|dead)(.*)")
        .expect("Invalid systemctl unit regex")
});

/// One `list-units` line: unit name, active state, sub state.
#[derive(Debug, PartialEq, Eq)]
pub struct UnitStatus<'a> {
    pub name: &'a str,
    pub active: &'a str,
    pub sub: &'a str,
}

pub fn parse_unit_line(line: &str) -> Option<UnitStatus<'_>> {
    let caps = SERVICE_LINE.captures(line)?;
    Some(UnitStatus {
        name: caps.get(1)?.as_str(),
        active: caps.get(2)?.as_str(),
        sub: caps.get(3)?.as_str(),
    })
}

/// `MainPID=N` -> `N`; zero, empty or malformed output is `unknown`.
pub fn pid_from_show(output: &str) -> String {
    match output.trim().split_once('=') {
        Some((_, pid)) if !pid.is_empty() && pid != "0" && !pid.contains('=') => pid.to_string(),
        _ => UNKNOWN_PID.to_string(),
    }
}

pub struct SystemdPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    running: BTreeMap<String, ServiceItem>,
}

impl SystemdPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.systemd_interval_sec,
            FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_SYSTEMD_UPDATES,
        );
        Self {
            ctx,
            frequency,
            running: BTreeMap::new(),
        }
    }

    /// Updates the running set from `list-units` output. `main_pid` resolves a running unit.
    fn apply_units<F>(&mut self, output: &str, mut main_pid: F)
    where
        F: FnMut(&str) -> String,
    {
        for unit in output.lines().filter_map(parse_unit_line) {
            match (unit.active, unit.sub) {
                ("inactive", _) | ("active", "dead") => {
                    self.running.remove(unit.name);
                }
                ("active", "running") => {
                    let pid = main_pid(unit.name);
                    self.running.insert(
                        unit.name.to_string(),
                        ServiceItem {
                            name: unit.name.to_string(),
                            pid,
                        },
                    );
                }
                _ => {}
            }
        }
    }
}

impl Plugin for SystemdPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("services", "systemd")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn can_run(&mut self) -> bool {
        command_exists("systemctl")
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let output = run_command(
            SYSTEMCTL,
            &["--plain", "-l", "--no-pager", "--no-legend", "--all", "--type=service", "list-units"],
        )?;
        let id = self.id();
        self.apply_units(&output, |name| {
            match run_command(SYSTEMCTL, &["--property=MainPID", "show", name]) {
                Ok(out) => pid_from_show(&out),
                Err(e) => {
                    warn!(plugin = %id, service = %name, error = %e, "cannot get service pid");
                    UNKNOWN_PID.to_string()
                }
            }
        });
        let data = InventoryDataset::from_items(self.running.values().cloned())?;
        Ok(vec![self.ctx.output(id, data)])
    }
}
