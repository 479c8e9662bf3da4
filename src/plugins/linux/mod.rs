//! Linux inventory plugins.

pub mod daemontools;
pub mod dpkg;
pub mod facter;
pub mod hostinfo;
pub mod kernel_modules;
pub mod pidfile;
pub mod rpm;
pub mod selinux;
pub mod sshd;
pub mod sysctl;
pub mod systemd;
pub mod upstart;
pub mod users;

pub use daemontools::DaemontoolsPlugin;
pub use dpkg::DpkgPlugin;
pub use facter::FacterPlugin;
pub use hostinfo::HostinfoPlugin;
pub use kernel_modules::KernelModulesPlugin;
pub use pidfile::PidfilePlugin;
pub use rpm::RpmPlugin;
pub use selinux::SelinuxPlugin;
pub use sshd::SshdConfigPlugin;
pub use sysctl::SysctlPlugin;
pub use systemd::SystemdPlugin;
pub use upstart::UpstartPlugin;
pub use users::UsersPlugin;

use super::Sortable;
use serde::Serialize;

/// A running service as reported by the service managers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceItem {
    #[serde(rename = "id")]
    pub name: String,
    /// Numeric pid, or `unknown`
    pub pid: String,
}

impl Sortable for ServiceItem {
    fn sort_key(&self) -> String {
        self.name.clone()
    }
}
