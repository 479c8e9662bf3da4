//! Tunable kernel parameters under `/proc/sys`.

use crate::config::{Frequency, FREQ_MINIMUM_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_SYSCTL_UPDATES};
use crate::error::AgentError;
use crate::logging::LogOnce;
use crate::plugins::{InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::error;
use walkdir::WalkDir;

const WRITABLE_MASK: u32 = 0o200;
const READABLE_MASK: u32 = 0o400;

/// Values that change on every read and would flood the deltas.
const IGNORED_PATTERNS: &[&str] = &[
    r"^kernel/random/uuid$",
    r"^kernel/random/entropy_avail$",
    r"^kernel/random/boot_id$",
    r"^kernel/ns_last_pid$",
    r"^kernel/pty/nr$",
    r"^fs/dentry-state$",
    r"^fs/inode-nr$",
    r"^fs/inode-state$",
    r"^fs/file-nr$",
    r"^fs/binfmt_misc/",
    r"^net/netfilter/nf_conntrack_count$",
];

static IGNORED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!("({})", IGNORED_PATTERNS.join(")|(")))
        .expect("Invalid sysctl ignore list")
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SysctlItem {
    #[serde(rename = "id")]
    pub key: String,
    #[serde(rename = "sysctl_value")]
    pub value: String,
}

impl Sortable for SysctlItem {
    fn sort_key(&self) -> String {
        self.key.clone()
    }
}

pub struct SysctlPlugin {
    ctx: PluginContext,
    frequency: Frequency,
    proc_sys: PathBuf,
    /// Per-path ignore decision, pruned to the paths seen in the latest walk
    ignore_memo: HashMap<PathBuf, bool>,
    errors_logged: LogOnce,
}

impl SysctlPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.sysctl_interval_sec,
            FREQ_MINIMUM_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_SYSCTL_UPDATES,
        );
        let proc_sys = ctx.host.proc("sys");
        Self::with_root(ctx, frequency, proc_sys)
    }

    fn with_root(ctx: PluginContext, frequency: Frequency, proc_sys: PathBuf) -> Self {
        Self {
            ctx,
            frequency,
            proc_sys,
            ignore_memo: HashMap::new(),
            errors_logged: LogOnce::new(),
        }
    }

    fn is_ignored(&mut self, rel: &Path) -> bool {
        *self
            .ignore_memo
            .entry(rel.to_path_buf())
            .or_insert_with(|| IGNORED.is_match(&rel.to_string_lossy()))
    }

    /// Reads every owner read+write regular file. Unreadable entries are skipped.
    pub fn sysctls(&mut self) -> Vec<SysctlItem> {
        let id = self.id();
        let root = self.proc_sys.clone();
        let mut items = Vec::new();
        let mut seen = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let mode = meta.permissions().mode();
            if mode & WRITABLE_MASK == 0 || mode & READABLE_MASK == 0 || !meta.is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };
            seen.push(rel.to_path_buf());
            if self.is_ignored(rel) {
                continue;
            }
            match std::fs::read(entry.path()) {
                Ok(content) => items.push(SysctlItem {
                    key: rel.to_string_lossy().replace('/', "."),
                    value: String::from_utf8_lossy(&content).trim().to_string(),
                }),
                Err(e) => {
                    let message = format!("unable to read sysctl from {}: {e}", entry.path().display());
                    if self.errors_logged.first(&message) {
                        error!(plugin = %id, "{message}, skipping");
                    }
                }
            }
        }
        let seen: std::collections::HashSet<_> = seen.into_iter().collect();
        self.ignore_memo.retain(|path, _| seen.contains(path));
        items
    }
}

impl Plugin for SysctlPlugin {
    fn id(&self) -> PluginId {
        PluginId::new("kernel", "sysctl")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let items = self.sysctls();
        let data = InventoryDataset::from_items(items)?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn write(root: &Path, rel: &str, content: impl AsRef<[u8]>, mode: u32) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn plugin(root: &Path) -> SysctlPlugin {
        let freq = Frequency::Every(Duration::from_secs(FREQ_PLUGIN_SYSCTL_UPDATES as u64));
        SysctlPlugin::with_root(PluginContext::new("host", Default::default()), freq, root.to_path_buf())
    }

    #[test]
    fn reads_tunables_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "kernel/hostname", "web-01\n", 0o644);
        write(root, "net/ipv4/ip_forward", "1\n", 0o644);
        write(root, "kernel/random/uuid", "5f0c...\n", 0o644);
        write(root, "fs/file-nr", "1 2 3\n", 0o644);
        write(root, "kernel/osrelease", "6.1.0\n", 0o444);
        write(root, "vm/drop_caches", "", 0o200);

        let mut p = plugin(root);
        let mut items = p.sysctls();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            items,
            vec![
                SysctlItem { key: "kernel.hostname".into(), value: "web-01".into() },
                SysctlItem { key: "net.ipv4.ip_forward".into(), value: "1".into() },
            ]
        );
    }

    #[test]
    fn non_utf8_values_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "dev/tty/ldisc", b"n_tty\xff\n", 0o644);

        let mut p = plugin(root);
        let items = p.sysctls();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "dev.tty.ldisc");
        assert_eq!(items[0].value, "n_tty\u{fffd}");
    }

    #[test]
    fn memo_is_pruned_to_latest_walk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "kernel/hostname", "a", 0o644);
        write(root, "kernel/random/uuid", "b", 0o644);

        let mut p = plugin(root);
        p.sysctls();
        assert_eq!(p.ignore_memo.len(), 2);
        assert_eq!(p.ignore_memo.get(Path::new("kernel/random/uuid")), Some(&true));

        fs::remove_file(root.join("kernel/random/uuid")).unwrap();
        p.sysctls();
        assert_eq!(p.ignore_memo.len(), 1);
    }

    #[test]
    fn ignore_list_anchors() {
        assert!(IGNORED.is_match("fs/binfmt_misc/status"));
        assert!(IGNORED.is_match("fs/inode-nr"));
        assert!(!IGNORED.is_match("fs/inode-nr-max"));
        assert!(!IGNORED.is_match("net/ipv4/ip_forward"));
    }
}
