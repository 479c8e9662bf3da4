//! Installed packages from `dpkg-query`.

use crate::config::{Frequency, FREQ_MINIMUM_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_PACKAGE_MGRS_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::run_command;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

const DPKG_QUERY: &str = "/usr/bin/dpkg-query";
const QUERY_FORMAT: &str =
    "-f=${Package} ${Status} ${Architecture} ${Version} ${Essential} ${Priority}\\n";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DpkgItem {
    #[serde(rename = "id")]
    pub name: String,
    pub architecture: String,
    pub essential: String,
    pub priority: String,
    pub status: String,
    pub version: String,
    #[serde(rename = "installed_epoch")]
    pub install_time: String,
}

impl Sortable for DpkgItem {
    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

pub struct DpkgPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    info_dir: PathBuf,
}

impl DpkgPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.dpkg_refresh_sec,
            FREQ_MINIMUM_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_PACKAGE_MGRS_UPDATES,
        );
        let info_dir = ctx.host.var("lib/dpkg/info");
        Self {
            ctx,
            frequency,
            info_dir,
        }
    }
}

/// Best guess at install time: ctime of the package's file list, named either
/// `<pkg>.list` or `<pkg>:<arch>.list`. Empty when neither exists.
pub fn guess_install_time(info_dir: &Path, package: &str, arch: &str) -> String {
    [format!("{package}.list"), format!("{package}:{arch}.list")]
        .iter()
        .find_map(|name| std::fs::metadata(info_dir.join(name)).ok())
        .map(|meta| meta.ctime().to_string())
        .unwrap_or_default()
}

/// `${Status}` expands to three words, so a complete line has at least eight fields.
pub fn parse_dpkg_query(output: &str, info_dir: &Path) -> Vec<DpkgItem> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 8 {
                return None;
            }
            Some(DpkgItem {
                name: parts[0].to_string(),
                status: parts[3].to_string(),
                architecture: parts[4].to_string(),
                version: parts[5].to_string(),
                essential: parts[6].to_string(),
                priority: parts[7].to_string(),
                install_time: guess_install_time(info_dir, parts[0], parts[4]),
            })
        })
        .collect()
}

impl Plugin for DpkgPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("packages", "dpkg")
    }

    fn schedule(&self) -> Schedule {
        Schedule::watch(self.frequency, vec![self.ctx.host.var("lib/dpkg/lock")])
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let output = run_command(DPKG_QUERY, &["-W", QUERY_FORMAT])?;
        let data = InventoryDataset::from_items(parse_dpkg_query(&output, &self.info_dir))?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}
