//! Services discovered through `*.pid` files under `/var/run`.

use crate::config::{Frequency, FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE, FREQ_PLUGIN_SYSVINIT_UPDATES};
use crate::error::AgentError;
use crate::plugins::{
    HostPaths, InventoryDataset, Plugin, PluginContext, PluginId, PluginOutput, Schedule, Sortable,
};
use procfs::process::Process;
use procfs::{FromReadSI, KernelStats, ProcError, ProcResult};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};
use walkdir::WalkDir;

/// Deep enough for pidfiles in a subdirectory, shallow enough not to wander into other
/// filesystems linked from `/var/run`.
const MAX_DEPTH: usize = 3;
const STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PidfileService {
    #[serde(rename = "id")]
    pub name: String,
    pub pid: String,
    pub ppid: String,
    /// Process start, seconds since the epoch
    pub started: String,
}

impl Sortable for PidfileService {
    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDetails {
    pub ppid: u32,
    pub started: SystemTime,
}

/// Parent pid and start time of `pid`, read from the host's procfs.
fn process_details(host: &HostPaths, pid: u32) -> ProcResult<ProcessDetails> {
    let stat = Process::new_with_root(host.proc(&pid.to_string()))?.stat()?;
    let boot = KernelStats::from_file(host.proc("stat"), procfs::current_system_info())?.btime;
    let ticks = procfs::ticks_per_second().max(1);
    let started = UNIX_EPOCH
        + Duration::from_secs(boot)
        + Duration::from_millis(stat.starttime * 1000 / ticks);
    Ok(ProcessDetails {
        ppid: u32::try_from(stat.ppid).unwrap_or(0),
        started,
    })
}

/// A pidfile is stale when its process started well after the file was last written.
pub fn pidfile_is_stale(pidfile_mtime: SystemTime, process_started: SystemTime) -> bool {
    process_started
        .duration_since(pidfile_mtime)
        .map(|d| d > STALE_AFTER)
        .unwrap_or(false)
}

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Walks `dir` for pidfiles whose process is alive, a child of init and not stale.
pub fn find_services<F>(id: &PluginId, dir: &Path, mut details: F) -> Vec<PidfileService>
where
    F: FnMut(u32) -> ProcResult<ProcessDetails>,
{
    let mut services = Vec::new();
    // Entries find refuses to enter are skipped; whatever was listed is still used.
    for entry in WalkDir::new(dir)
        .max_depth(MAX_DEPTH)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pid") {
            continue;
        }
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                error!(plugin = %id, pidfile = %path.display(), error = %e, "cannot stat pidfile");
                continue;
            }
        };
        if meta.is_dir() {
            continue;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!(plugin = %id, pidfile = %path.display(), error = %e, "cannot read pidfile");
                continue;
            }
        };
        let Ok(pid) = content.trim().parse::<u32>() else {
            continue;
        };
        let process = match details(pid) {
            Ok(d) => d,
            Err(ProcError::NotFound(_)) => continue,
            Err(e) => {
                debug!(plugin = %id, pidfile = %path.display(), error = %e, "cannot fetch process details");
                continue;
            }
        };
        if process.ppid != 1 {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if pidfile_is_stale(modified, process.started) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        services.push(PidfileService {
            name: name.to_string(),
            pid: pid.to_string(),
            ppid: process.ppid.to_string(),
            started: epoch_secs(process.started).to_string(),
        });
    }
    services
}

pub struct PidfilePlugin {
    ctx: PluginContext,
    frequency: Frequency,
}

impl PidfilePlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let frequency = ctx.config.frequency(
            ctx.config.plugins.sysvinit_interval_sec,
            FREQ_MINIMUM_FAST_INVENTORY_SAMPLE_RATE,
            FREQ_PLUGIN_SYSVINIT_UPDATES,
        );
        Self { ctx, frequency }
    }
}

impl Plugin for PidfilePlugin {
    fn id(&self) -> PluginId {
        PluginId::new("services", "pidfile")
    }

    fn schedule(&self) -> Schedule {
        Schedule::every(self.frequency)
    }

    fn sample(&mut self) -> Result<Vec<PluginOutput>, AgentError> {
        let host = self.ctx.host.clone();
        let dir = host.var("run");
        let services = find_services(&self.id(), &dir, |pid| process_details(&host, pid));
        let data = InventoryDataset::from_items(services)?;
        Ok(vec![self.ctx.output(self.id(), data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_come_from_the_host_procfs() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::new(Some(dir.path()));
        let proc_dir = host.proc("");
        std::fs::create_dir_all(proc_dir.join("1234")).unwrap();
        let ticks = procfs::ticks_per_second();
        std::fs::write(
            proc_dir.join("1234/stat"),
            format!("1234 (my (odd) daemon) S 1 1234 1234 0 -1 4194560 100 0 0 0 5 3 0 0 20 0 1 0 {} 1000 10 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0\n", 42 * ticks),
        )
        .unwrap();
        std::fs::write(
            proc_dir.join("stat"),
            "cpu  1 2 3 4 5 6 7 0 0 0\ncpu0 1 2 3 4 5 6 7 0 0 0\nintr 0\nctxt 10\nbtime 1700000000\nprocesses 5\nprocs_running 1\nprocs_blocked 0\n",
        )
        .unwrap();

        let details = process_details(&host, 1234).unwrap();
        assert_eq!(details.ppid, 1);
        assert_eq!(epoch_secs(details.started), 1_700_000_042);
        assert!(process_details(&host, 999).is_err());
    }

    #[test]
    fn staleness() {
        let written = UNIX_EPOCH + Duration::from_secs(1000);
        assert!(!pidfile_is_stale(written, written + Duration::from_secs(5)));
        assert!(pidfile_is_stale(written, written + Duration::from_secs(6)));
        assert!(!pidfile_is_stale(written, written - Duration::from_secs(60)));
    }

    #[test]
    fn finds_live_children_of_init() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("sshd.pid"), "100\n").unwrap();
        std::fs::write(root.join("orphan.pid"), "200\n").unwrap();
        std::fs::write(root.join("gone.pid"), "300\n").unwrap();
        std::fs::write(root.join("junk.pid"), "not a pid\n").unwrap();
        std::fs::write(root.join("notes.txt"), "100\n").unwrap();
        std::fs::create_dir(root.join("dir.pid")).unwrap();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/crond.pid"), "400").unwrap();
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/b/c/deep.pid"), "100").unwrap();

        let long_ago = UNIX_EPOCH + Duration::from_secs(10);
        let id = PluginId::new("services", "pidfile");
        let mut services = find_services(&id, root, |pid| match pid {
            100 | 400 => Ok(ProcessDetails { ppid: 1, started: long_ago }),
            200 => Ok(ProcessDetails { ppid: 55, started: long_ago }),
            _ => Err(ProcError::NotFound(None)),
        });
        services.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["crond", "sshd"]);
        assert_eq!(services[1].pid, "100");
        assert_eq!(services[1].ppid, "1");
        assert_eq!(services[1].started, "10");
    }

    #[test]
    fn restarted_process_makes_pidfile_stale() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nginx.pid"), "100").unwrap();
        let later = SystemTime::now() + Duration::from_secs(3600);
        let id = PluginId::new("services", "pidfile");
        let services = find_services(&id, dir.path(), |_| Ok(ProcessDetails { ppid: 1, started: later }));
        assert!(services.is_empty());
    }
}
