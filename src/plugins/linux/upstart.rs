//! Upstart jobs from `initctl list`.

use super::ServiceItem;
use crate::config::{Frequency, FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_UPSTART_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::run_command;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const INITCTL: &str = "/sbin/initctl";

static JOB_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\S+).*?(start|stop)/(.*)").expect("Invalid initctl job regex"));
static JOB_PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"process\s+(\d+)").expect("Invalid initctl pid regex"));

pub struct UpstartPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    running: BTreeMap<String, ServiceItem>,
}

impl UpstartPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.upstart_interval_sec,
            FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_UPSTART_UPDATES,
        );
        Self {
            ctx,
            frequency,
            running: BTreeMap::new(),
        }
    }

    /// `start/...` lines add or refresh a job, `stop/...` lines drop it.
    fn apply_list(&mut self, output: &str) {
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let Some(caps) = JOB_LINE.captures(line) else {
                warn!(plugin = %self.id(), %line, "unexpected line from initctl");
                continue;
            };
            let name = caps[1].to_string();
            let pid = JOB_PID
                .captures(&caps[3])
                .map(|p| p[1].to_string())
                .unwrap_or_else(|| "unknown".to_string());
            match &caps[2] {
                "start" => {
                    self.running.insert(name.clone(), ServiceItem { name, pid });
                }
                _ => {
                    self.running.remove(&name);
                }
            }
        }
    }
}

impl Plugin for UpstartPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("services", "upstart")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn can_run(&mut self) -> bool {
        match run_command(INITCTL, &["list"]) {
            Ok(_) => true,
            Err(e) => {
                debug!(plugin = %self.id(), error = %e, "upstart not found");
                false
            }
        }
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let output = run_command(INITCTL, &["list"])?;
        self.apply_list(&output);
        let data = InventoryDataset::from_items(self.running.values().cloned())?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}
