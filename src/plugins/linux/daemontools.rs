//! daemontools services: `supervise` processes, checked with `svstat`.

use super::ServiceItem;
use crate::config::{Frequency, FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_DAEMONTOOLS_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::{command_exists, run_command};
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::error;

static SUPERVISE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) supervise (.+)$").expect("Invalid supervise line regex"));
static SVSTAT_UP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"up \(pid (\d+)\)").expect("Invalid svstat regex"));

/// `(supervise pid, service name)` from one `ps -e -o pid,args` line.
pub fn parse_supervise_line(line: &str) -> Option<(u32, String)> {
    let caps = SUPERVISE_LINE.captures(line.trim())?;
    Some((caps[1].parse().ok()?, caps[2].to_string()))
}

/// Pid of the supervised process when `svstat` reports it up.
pub fn parse_svstat(output: &str) -> Option<u32> {
    SVSTAT_UP.captures(output)?[1].parse().ok()
}

pub struct DaemontoolsPlugin {
    ctx: PluginContext,
    frequency: Frequency,
}

impl DaemontoolsPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.daemontools_refresh_sec,
            FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_DAEMONTOOLS_UPDATES,
        );
        Self { ctx, frequency }
    }

    fn service_status(&self, supervise_pid: u32, name: &str) -> Option<ServiceItem> {
        let cwd_link = self.ctx.host.proc(&format!("{supervise_pid}/cwd"));
        let dir = match std::fs::read_link(&cwd_link) {
            Ok(d) => d,
            Err(e) => {
                error!(plugin = %self.id(), service = %name, pid = supervise_pid, error = %e, "cannot resolve service directory");
                return None;
            }
        };
        let dir = dir.to_string_lossy();
        let output = match run_command("svstat", &[dir.as_ref()]) {
            Ok(o) => o,
            Err(e) => {
                error!(plugin = %self.id(), service = %name, error = %e, "svstat failed");
                return None;
            }
        };
        parse_svstat(&output).map(|pid| ServiceItem {
            name: name.to_string(),
            pid: pid.to_string(),
        })
    }
}

impl Plugin for DaemontoolsPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("services", "daemontools")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn can_run(&mut self) -> bool {
        command_exists("svscan")
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let ps = run_command("ps", &["-e", "-o", "pid,args"])?;
        let services: Vec<ServiceItem> = ps
            .lines()
            .filter_map(parse_supervise_line)
            .filter_map(|(pid, name)| self.service_status(pid, &name))
            .collect();
        let data = InventoryDataset::from_items(services)?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}
