//! Installed packages from the rpm database.

use crate::config::{Frequency, FREQ_MINIMUM_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_PACKAGE_MGRS_UPDATES};
use crate::error::AgentError;
use crate::logging::LogOnce;
use crate::plugins::host::run_command;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

const RPM: &str = "/bin/rpm";
const QUERY_FORMAT: &str =
    "--queryformat=%{NAME} %{VERSION} %{RELEASE} %{ARCH} %{INSTALLTIME} %{EPOCH}\\n";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpmItem {
    #[serde(rename = "id")]
    pub name: String,
    pub version: String,
    pub release: String,
    pub architecture: String,
    #[serde(rename = "installed_epoch")]
    pub install_time: String,
    pub epoch_tag: String,
}

impl Sortable for RpmItem {
    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

pub struct RpmPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    errored_lines: LogOnce,
}

impl RpmPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.rpm_refresh_sec,
            FREQ_MINIMUM_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_PACKAGE_MGRS_UPDATES,
        );
        Self {
            ctx,
            frequency,
            errored_lines: LogOnce::new(),
        }
    }

    /// Lines are sorted first so duplicate suffixes are stable between runs.
    pub fn parse_package_info(&self, output: &str) -> Vec<RpmItem> {
        let mut lines: Vec<&str> = output.lines().collect();
        lines.sort_unstable();

        let mut seen_names: HashMap<&str, usize> = HashMap::new();
        let mut packages = Vec::with_capacity(lines.len());
        for line in lines {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                if self.errored_lines.first(line) {
                    warn!(plugin = %self.id(), output_line = %line, "cannot parse rpm query line");
                }
                continue;
            }

            let count = seen_names.entry(parts[0]).or_insert(0);
            let name = if *count > 0 {
                format!("{}-{}", parts[0], count)
            } else {
                parts[0].to_string()
            };
            *count += 1;

            let epoch = if parts[5].contains("none") { "none" } else { parts[5] };

            packages.push(RpmItem {
                name,
                version: parts[1].to_string(),
                release: parts[2].to_string(),
                architecture: parts[3].to_string(),
                install_time: parts[4].to_string(),
                epoch_tag: epoch.to_string(),
            });
        }
        packages
    }
}

impl Plugin for RpmPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("packages", "rpm")
    }

    fn schedule(&self) -> Schedule {
        Schedule::watch(
            self.frequency,
            vec![
                self.ctx.host.var("lib/rpm/.rpm.lock"),
                self.ctx.host.var("lib/rpm/Installtid"),
            ],
        )
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let output = run_command(RPM, &["-qa", QUERY_FORMAT])?;
        let data = InventoryDataset::from_items(self.parse_package_info(&output))?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, version: &str, release: &str, install: &str, epoch: &str) -> RpmItem {
        RpmItem {
            name: name.into(),
            version: version.into(),
            release: release.into(),
            architecture: "x386".into(),
            install_time: install.into(),
            epoch_tag: epoch.into(),
        }
    }

    fn plugin() -> RpmPlugin {
        RpmPlugin::new(PluginContext::new("host", Default::default()))
    }

    #[test]
    fn parse_package_info() {
        let p = plugin();
        assert!(p.parse_package_info("test\ntwo").is_empty());
        assert_eq!(
            p.parse_package_info("test 1.0 r2 x386 12345 (none)\ntwo"),
            vec![item("test", "1.0", "r2", "12345", "none")]
        );
        assert_eq!(
            p.parse_package_info("test 1.0 r2 x386 12345 9\nchuck 1.9 r3 x386 92345 myepo"),
            vec![
                item("chuck", "1.9", "r3", "92345", "myepo"),
                item("test", "1.0", "r2", "12345", "9"),
            ]
        );
    }

    #[test]
    fn duplicate_names_get_suffixes() {
        let packages = plugin().parse_package_info(
            "test 1.0 r2 x386 12345 9\ntest 1.9 r3 x386 92345 myepo\ntest 2.0 r1 x386 1 9",
        );
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["test", "test-1", "test-2"]);
        assert_eq!(packages[1].version, "1.9");
    }

    #[test]
    fn bad_lines_are_remembered_once() {
        let p = plugin();
        let packages = p.parse_package_info("foo\ntest 1.0 r2 x386 12345 (none)\nbar\nfoo");
        assert_eq!(packages.len(), 1);
        assert!(!p.errored_lines.first("foo"));
        assert!(!p.errored_lines.first("bar"));
    }
}
