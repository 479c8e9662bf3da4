//! Host filesystem roots and external command execution.

use crate::error::AgentError;
use std::path::{Path, PathBuf};
use std::process::Command;

/// `/proc`, `/sys`, `/etc` and `/var`, optionally under a mounted host root.
#[derive(Debug, Clone)]
pub struct HostPaths {
    root: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HostPaths {
    pub fn new(host_root: Option<&Path>) -> Self {
        Self {
            root: host_root
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/")),
        }
    }

    pub fn proc(&self, rel: &str) -> PathBuf {
        self.under("proc", rel)
    }

    pub fn sys(&self, rel: &str) -> PathBuf {
        self.under("sys", rel)
    }

    pub fn etc(&self, rel: &str) -> PathBuf {
        self.under("etc", rel)
    }

    pub fn var(&self, rel: &str) -> PathBuf {
        self.under("var", rel)
    }

    fn under(&self, base: &str, rel: &str) -> PathBuf {
        let rel = rel.trim_start_matches('/');
        let dir = self.root.join(base);
        if rel.is_empty() {
            dir
        } else {
            dir.join(rel)
        }
    }
}

/// Runs `program args...` and returns stdout. A non-zero exit is an error carrying stderr.
pub fn run_command(program: &str, args: &[&str]) -> Result<String, AgentError> {
    run_command_with_env(program, args, &[])
}

pub fn run_command_with_env(
    program: &str,
    args: &[&str],
    env: &[(&str, &str)],
) -> Result<String, AgentError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(AgentError::Command {
            command: format!("{} {}", program, args.join(" ")).trim_end().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// True when `name` resolves on `PATH`.
pub fn command_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Debian,
    RedHat,
    Suse,
    Other,
}

impl Distro {
    pub fn detect(host: &HostPaths) -> Distro {
        match std::fs::read_to_string(host.etc("os-release")) {
            Ok(content) => Distro::from_os_release(&content),
            Err(_) => Distro::Other,
        }
    }

    /// Classifies by `ID`, then by the families listed in `ID_LIKE`.
    pub fn from_os_release(content: &str) -> Distro {
        let id = os_release_field(content, "ID").unwrap_or_default();
        let like = os_release_field(content, "ID_LIKE").unwrap_or_default();
        std::iter::once(id.as_str())
            .chain(like.split_whitespace())
            .find_map(|name| match name {
                "debian" | "ubuntu" => Some(Distro::Debian),
                "rhel" | "centos" | "fedora" | "amzn" | "ol" | "rocky" | "almalinux" => {
                    Some(Distro::RedHat)
                }
                "suse" | "sles" | "opensuse" | "opensuse-leap" => Some(Distro::Suse),
                _ => None,
            })
            .unwrap_or(Distro::Other)
    }

    pub fn is_redhat_family(self) -> bool {
        matches!(self, Distro::RedHat)
    }
}

/// Value of `KEY=value` in an os-release document, unquoted.
pub fn os_release_field(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        (k == key).then(|| v.trim().trim_matches('"').trim_matches('\'').to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_host_root() {
        let host = HostPaths::new(Some(Path::new("/host")));
        assert_eq!(host.proc("sys/kernel/osrelease"), PathBuf::from("/host/proc/sys/kernel/osrelease"));
        assert_eq!(host.etc("/ssh/sshd_config"), PathBuf::from("/host/etc/ssh/sshd_config"));
        assert_eq!(HostPaths::default().var("run"), PathBuf::from("/var/run"));
        assert_eq!(HostPaths::default().sys(""), PathBuf::from("/sys"));
    }

    #[test]
    fn distro_from_os_release() {
        let ubuntu = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\n";
        assert_eq!(Distro::from_os_release(ubuntu), Distro::Debian);
        assert_eq!(os_release_field(ubuntu, "PRETTY_NAME").as_deref(), Some("Ubuntu 22.04.3 LTS"));

        let centos = "ID=\"centos\"\nID_LIKE=\"rhel fedora\"\n";
        assert_eq!(Distro::from_os_release(centos), Distro::RedHat);

        let leap = "ID=\"opensuse-leap\"\nID_LIKE=\"suse opensuse\"\n";
        assert_eq!(Distro::from_os_release(leap), Distro::Suse);

        assert_eq!(Distro::from_os_release("ID=arch\n"), Distro::Other);
    }

    #[test]
    fn failing_command_is_an_error() {
        assert!(run_command("false", &[]).is_err());
        assert_eq!(run_command("echo", &["hi"]).unwrap().trim(), "hi");
    }
}
