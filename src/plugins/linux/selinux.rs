//! SELinux status, policy booleans and, optionally, installed policy modules.

use crate::config::{Frequency, FREQ_MINIMUM_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_SELINUX_UPDATES};
use crate::error::AgentError;
use crate::plugins::host::{run_command, Distro};
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

static LABEL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^:]*):\s+(.*)").expect("Invalid sestatus label regex"));
static BOOLEAN_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\S+)\s+(\S+)").expect("Invalid sestatus boolean regex"));
static MODULE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\S+)\s*(\S*)").expect("Invalid semodule regex"));

const POLICY_BOOLEANS_HEADER: &str = "Policy booleans:";

/// sestatus label -> reported id.
const STATUS_PROPERTIES: &[(&str, &str)] = &[
    ("SELinux status", "Status"),
    ("SELinuxfs mount", "FSMount"),
    ("Current mode", "CurrentMode"),
    ("Policy version", "PolicyVersion"),
    ("Policy from config file", "PolicyLevel"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigValue {
    #[serde(rename = "id")]
    pub key: String,
    pub value: String,
}

impl Sortable for ConfigValue {
    fn sort_key(&self) -> String {
        self.key.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyModule {
    #[serde(rename = "id")]
    pub key: String,
    pub version: String,
}

impl Sortable for PolicyModule {
    fn sort_key(&self) -> String {
        self.key.clone()
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SestatusReport {
    pub status: Vec<ConfigValue>,
    pub policies: Vec<ConfigValue>,
}

/// Splits `sestatus -b` into status properties and policy booleans.
/// A disabled SELinux is reported as not applicable.
pub fn parse_sestatus(output: &str) -> Result<SestatusReport, AgentError> {
    let mut report = SestatusReport::default();
    let mut in_booleans = false;
    for line in output.lines() {
        if line == POLICY_BOOLEANS_HEADER {
            in_booleans = true;
        } else if in_booleans {
            if let Some(caps) = BOOLEAN_LINE.captures(line) {
                report.policies.push(ConfigValue {
                    key: caps[1].to_string(),
                    value: caps[2].to_string(),
                });
            }
        } else if let Some(caps) = LABEL_LINE.captures(line) {
            let (label, value) = (&caps[1], &caps[2]);
            if label == "SELinux status" && value == "disabled" {
                return Err(AgentError::NotApplicable("SELinux status: disabled".to_string()));
            }
            if let Some((_, id)) = STATUS_PROPERTIES.iter().find(|(l, _)| *l == label) {
                report.status.push(ConfigValue {
                    key: id.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// `semodule -l` lines: name and optional version.
pub fn parse_semodule(output: &str) -> Vec<PolicyModule> {
    output
        .lines()
        .filter_map(|line| MODULE_LINE.captures(line))
        .map(|caps| PolicyModule {
            key: caps[1].to_string(),
            version: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
        .collect()
}

pub struct SelinuxPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    enable_semodule: bool,
}

impl SelinuxPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.selinux_interval_sec,
            FREQ_MINIMUM_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_SELINUX_UPDATES,
        );
        let enable_semodule = ctx.config.plugins.selinux_enable_semodule;
        Self {
            ctx,
            frequency,
            enable_semodule,
        }
    }
}

impl Plugin for SelinuxPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("config", "selinux")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn can_run(&mut self) -> bool {
        let active = run_command("sestatus", &["-b"]).and_then(|out| parse_sestatus(&out));
        if let Err(e) = active {
            debug!(plugin = %self.id(), error = %e, "unable to use SELinux");
            return false;
        }
        if self.enable_semodule && Distro::detect(&self.ctx.host).is_redhat_family() {
            warn!(plugin = %self.id(), "enabling semodule may cause performance issues on RedHat-based distributions");
        }
        true
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let id = self.id();
        let report = parse_sestatus(&run_command("sestatus", &["-b"])?)?;
        let mut outputs = vec![
            self.ctx.output(id.clone(), InventoryDataset::from_items(report.status)?),
            self.ctx.output(
                id.with_suffix("policies"),
                InventoryDataset::from_items(report.policies)?,
            ),
        ];
        if self.enable_semodule {
            let modules = parse_semodule(&run_command("semodule", &["-l"])?);
            outputs.push(
                self.ctx
                    .output(id.with_suffix("modules"), InventoryDataset::from_items(modules)?),
            );
        }
        Ok(outputs)
    }
}
