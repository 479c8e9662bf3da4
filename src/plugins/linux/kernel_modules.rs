//! Loaded kernel modules from `lsmod`, enriched once per module with `modinfo`.

use crate::config::{Frequency, FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_KERNEL_MODULES_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::run_command;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, warn};

const LSMOD: &str = "/sbin/lsmod";
const MODINFO: &str = "/sbin/modinfo";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KernelModule {
    #[serde(rename = "id")]
    pub name: String,
    pub version: String,
    pub description: String,
}

impl Sortable for KernelModule {
    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

pub struct KernelModulesPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    loaded: BTreeMap<String, KernelModule>,
    needs_flush: bool,
}

impl KernelModulesPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.kernel_modules_refresh_sec,
            FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_KERNEL_MODULES_UPDATES,
        );
        Self {
            ctx,
            frequency,
            loaded: BTreeMap::new(),
            needs_flush: true,
        }
    }

    /// Drops modules no longer listed and describes new ones through `describe`.
    /// A module whose description fails is still tracked.
    fn process_updates<F>(&mut self, seen: &BTreeSet<String>, mut describe: F)
    where
        F: FnMut(&mut KernelModule) -> Result<(), AgentError>,
    {
        let before = self.loaded.len();
        self.loaded.retain(|name, _| seen.contains(name));
        if self.loaded.len() != before {
            self.needs_flush = true;
        }

        for name in seen {
            if self.loaded.contains_key(name) {
                continue;
            }
            let mut module = KernelModule {
                name: name.clone(),
                ..Default::default()
            };
            let described = describe(&mut module);
            self.loaded.insert(name.clone(), module);
            match described {
                Ok(()) => self.needs_flush = true,
                Err(e) => error!(plugin = %self.id(), module = %name, error = %e, "cannot get module info"),
            }
        }
    }

    fn dataset(&self) -> Result<InventoryDataset, AgentError> {
        InventoryDataset::from_items(self.loaded.values().cloned())
    }
}

static MODULE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+\d+").expect("Invalid lsmod line regex"));

static MODINFO_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(filename|version|description):\s+(.*)").expect("Invalid modinfo line regex")
});

/// Module names from `lsmod` output; the header line does not match.
pub fn parse_lsmod(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| MODULE_LINE.captures(line))
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn apply_modinfo(output: &str, module: &mut KernelModule) {
    for caps in output.lines().filter_map(|l| MODINFO_LINE.captures(l)) {
        match &caps[1] {
            "version" => module.version = caps[2].to_string(),
            "description" => module.description = caps[2].to_string(),
            _ => {}
        }
    }
}

impl Plugin for KernelModulesPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("kernel", "modules")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn can_run(&mut self) -> bool {
        let present = self.ctx.host.proc("modules").exists();
        if !present {
            warn!(plugin = %self.id(), "kernel does not allow module loading, modules will not be monitored");
        }
        present
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let output = run_command(LSMOD, &[])?;
        let seen = parse_lsmod(&output);
        self.process_updates(&seen, |module| {
            let info = run_command(MODINFO, &[module.name.as_str()])?;
            apply_modinfo(&info, module);
            Ok(())
        });
        if !self.needs_flush {
            return Ok(Vec::new());
        }
        self.needs_flush = false;
        Ok(vec![self.ctx.output(self.id(), self.dataset()?)])
    }
}
