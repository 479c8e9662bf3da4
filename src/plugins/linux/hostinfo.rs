//! Host identity: distro, kernel, hardware and agent details as a single `system` item.

use crate::config::RunMode;
use crate::error::AgentError;
use crate::plugins::host::os_release_field;
use crate::plugins::{HostPaths, InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error};

const UNKNOWN: &str = "unknown";
pub const AGENT_NAME: &str = "inventory-agent";

static PROCESSOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"processor\s*:\s*([0-9]+)").expect("Invalid processor regex"));
static CPU_CORES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"cpu\scores\s*:\s").expect("Invalid cpu cores regex"));
static MODEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"model\sname\s*:\s").expect("Invalid model name regex"));
static MEM_TOTAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"MemTotal:\s*").expect("Invalid meminfo regex"));
static PRODUCT_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-F]{8}(-[0-9A-F]{4}){3}-[0-9A-F]{12}$").expect("Invalid product uuid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostinfoData {
    #[serde(rename = "id")]
    pub system: String,
    pub distro: String,
    pub kernel_version: String,
    pub host_type: String,
    pub cpu_name: String,
    /// `cpu cores` of one CPU
    pub cpu_num: String,
    /// `processor` entries across all CPUs
    pub total_cpu: String,
    pub ram: String,
    #[serde(rename = "boot_timestamp")]
    pub up_since: String,
    pub agent_version: String,
    pub agent_name: String,
    pub agent_mode: String,
    pub operating_system: String,
    pub product_uuid: String,
    pub boot_id: String,
}

impl Sortable for HostinfoData {
    fn sort_key(&self) -> String {
        self.system.clone()
    }
}

/// Value after the first line split by `separator` into exactly two parts.
pub fn proc_field(content: &str, separator: &Regex) -> Option<String> {
    content.lines().find_map(|line| {
        let parts: Vec<&str> = separator.splitn(line, 3).collect();
        (parts.len() == 2).then(|| parts[1].to_string())
    })
}

pub fn total_cpu(cpuinfo: &str) -> usize {
    PROCESSOR.find_iter(cpuinfo).count()
}

/// Upper-case DMI uuid, `unknown` when unprivileged or malformed.
pub fn product_uuid(raw: Option<&str>, mode: RunMode) -> String {
    if mode == RunMode::Unprivileged {
        return UNKNOWN.to_string();
    }
    match raw.map(str::trim) {
        Some(uuid) if PRODUCT_UUID.is_match(uuid) => uuid.to_string(),
        other => {
            debug!(uuid = ?other, "unexpected format for product uuid");
            UNKNOWN.to_string()
        }
    }
}

fn first_line(host_path: std::path::PathBuf) -> Option<String> {
    match std::fs::read_to_string(&host_path) {
        Ok(s) => Some(s.lines().next().unwrap_or_default().trim().to_string()),
        Err(e) => {
            error!(path = %host_path.display(), error = %e, "cannot read host file");
            None
        }
    }
}

fn boot_timestamp() -> String {
    let boot = sysinfo::System::boot_time();
    chrono::DateTime::from_timestamp(boot as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Gathers the `system` item. Unreadable values are reported as `unknown`.
pub fn gather(host: &HostPaths, mode: RunMode, agent_version: &str) -> HostinfoData {
    let cpuinfo = std::fs::read_to_string(host.proc("cpuinfo")).ok();
    let meminfo = std::fs::read_to_string(host.proc("meminfo")).ok();
    let total = cpuinfo
        .as_deref()
        .map(|c| total_cpu(c).to_string())
        .unwrap_or_else(|| UNKNOWN.to_string());
    let field = |content: &Option<String>, re: &Regex| {
        content
            .as_deref()
            .and_then(|c| proc_field(c, re))
            .unwrap_or_else(|| UNKNOWN.to_string())
    };
    let cpu_num = cpuinfo
        .as_deref()
        .and_then(|c| proc_field(c, &CPU_CORES))
        .unwrap_or_else(|| total.clone());

    let distro = std::fs::read_to_string(host.etc("os-release"))
        .ok()
        .and_then(|c| os_release_field(&c, "PRETTY_NAME"))
        .unwrap_or_else(|| UNKNOWN.to_string());
    let vendor = first_line(host.sys("devices/virtual/dmi/id/sys_vendor")).unwrap_or_default();
    let product = first_line(host.sys("devices/virtual/dmi/id/product_name")).unwrap_or_default();
    let uuid = if mode == RunMode::Unprivileged {
        None
    } else {
        first_line(host.sys("class/dmi/id/product_uuid"))
    };

    HostinfoData {
        system: "system".to_string(),
        distro,
        kernel_version: first_line(host.proc("sys/kernel/osrelease"))
            .unwrap_or_else(|| UNKNOWN.to_string()),
        host_type: format!("{vendor} {product}"),
        cpu_name: field(&cpuinfo, &MODEL_NAME),
        cpu_num,
        total_cpu: total,
        ram: field(&meminfo, &MEM_TOTAL),
        up_since: boot_timestamp(),
        agent_version: agent_version.to_string(),
        agent_name: AGENT_NAME.to_string(),
        agent_mode: mode.as_str().to_string(),
        operating_system: std::env::consts::OS.to_string(),
        product_uuid: product_uuid(uuid.as_deref(), mode),
        boot_id: first_line(host.proc("sys/kernel/random/boot_id"))
            .unwrap_or_else(|| UNKNOWN.to_string()),
    }
}

/// Sampled once, and again whenever the agent reconnects.
pub struct HostinfoPlugin {
    ctx: PluginContext,
}

impl HostinfoPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        Self { ctx }
    }
}

impl Plugin for HostinfoPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("metadata", "system")
    }

    fn schedule(&self) -> Schedule {
        Schedule::Once
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let data = gather(&self.ctx.host, self.ctx.config.run_mode, self.ctx.agent_version);
        debug!(plugin = %self.id(), host = ?data, "gathered host info");
        Ok(vec![self.ctx.output(self.id(), InventoryDataset::from_items([data])?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    const CPUINFO: &str = "processor\t: 0
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) CPU E5-2676 v3 @ 2.40GHz
cpu cores\t: 2

processor\t: 1
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) CPU E5-2676 v3 @ 2.40GHz
cpu cores\t: 2
";

    fn put(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    #[test]
    fn cpu_fields() {
        assert_eq!(total_cpu(CPUINFO), 2);
        assert_eq!(proc_field(CPUINFO, &CPU_CORES).as_deref(), Some("2"));
        assert_eq!(
            proc_field(CPUINFO, &MODEL_NAME).as_deref(),
            Some("Intel(R) Xeon(R) CPU E5-2676 v3 @ 2.40GHz")
        );
        assert_eq!(proc_field("MemTotal:        8167848 kB\n", &MEM_TOTAL).as_deref(), Some("8167848 kB"));
    }

    #[test]
    fn product_uuid_format() {
        let good = "EC2E1916-9099-7CAF-FD21-012345ABCDEF";
        assert_eq!(product_uuid(Some(good), RunMode::Root), good);
        assert_eq!(product_uuid(Some("ec2e1916-9099-7caf-fd21-012345abcdef"), RunMode::Root), "unknown");
        assert_eq!(product_uuid(Some(good), RunMode::Unprivileged), "unknown");
        assert_eq!(product_uuid(None, RunMode::Privileged), "unknown");
    }

    #[test]
    fn gather_from_host_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        put(root, "proc/cpuinfo", &CPUINFO.replace("cpu cores\t: 2\n", ""));
        put(root, "proc/meminfo", "MemTotal:        8167848 kB\nMemFree: 1 kB\n");
        put(root, "proc/sys/kernel/osrelease", "5.15.0-91-generic\n");
        put(root, "proc/sys/kernel/random/boot_id", "0f1e2d3c-aaaa-bbbb-cccc-000000000000\n");
        put(root, "etc/os-release", "ID=ubuntu\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\n");
        put(root, "sys/devices/virtual/dmi/id/sys_vendor", "QEMU\n");
        put(root, "sys/devices/virtual/dmi/id/product_name", "Standard PC\n");
        put(root, "sys/class/dmi/id/product_uuid", "EC2E1916-9099-7CAF-FD21-012345ABCDEF\n");

        let data = gather(&HostPaths::new(Some(root)), RunMode::Root, "1.2.3");
        assert_eq!(data.system, "system");
        assert_eq!(data.distro, "Ubuntu 22.04.3 LTS");
        assert_eq!(data.kernel_version, "5.15.0-91-generic");
        assert_eq!(data.host_type, "QEMU Standard PC");
        assert_eq!(data.total_cpu, "2");
        assert_eq!(data.cpu_num, "2");
        assert_eq!(data.ram, "8167848 kB");
        assert_eq!(data.product_uuid, "EC2E1916-9099-7CAF-FD21-012345ABCDEF");
        assert_eq!(data.agent_mode, "root");
        assert_eq!(data.agent_version, "1.2.3");
        assert_eq!(data.boot_id, "0f1e2d3c-aaaa-bbbb-cccc-000000000000");
    }

    #[test]
    fn missing_files_are_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let data = gather(&HostPaths::new(Some(dir.path())), RunMode::Unprivileged, "1.0.0");
        assert_eq!(data.cpu_name, "unknown");
        assert_eq!(data.total_cpu, "unknown");
        assert_eq!(data.ram, "unknown");
        assert_eq!(data.kernel_version, "unknown");
        assert_eq!(data.product_uuid, "unknown");
    }
}
