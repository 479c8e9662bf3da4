//! Which plugins run on this host.

use super::host::Distro;
use super::linux::{
    DaemontoolsPlugin, DpkgPlugin, FacterPlugin, HostinfoPlugin, KernelModulesPlugin,
    PidfilePlugin, RpmPlugin, SelinuxPlugin, SshdConfigPlugin, SysctlPlugin, SystemdPlugin,
    UpstartPlugin, UsersPlugin,
};
use super::{Plugin, PluginContext, PluginId};
use crate::config::RunMode;
use tracing::debug;

/// Plugins for this host, chosen by run mode, containerization and distribution.
pub fn linux_plugins(ctx: &PluginContext) -> Vec<Box<dyn Plugin>> {
    let distro = Distro::detect(&ctx.host);
    debug!(?distro, mode = ctx.config.run_mode.as_str(), "registering plugins");
    plugins_for(ctx, distro)
}

fn plugins_for(ctx: &PluginContext, distro: Distro) -> Vec<Box<dyn Plugin>> {
    let mut plugins: Vec<Box<dyn Plugin>> = vec![Box::new(HostinfoPlugin::new(ctx.clone()))];

    if !ctx.config.is_containerized {
        plugins.push(Box::new(UpstartPlugin::new(ctx.clone())));
        plugins.push(Box::new(SystemdPlugin::new(ctx.clone())));
        plugins.push(Box::new(FacterPlugin::new(ctx.clone())));
        plugins.push(Box::new(UsersPlugin::new(ctx.clone())));
        plugins.push(Box::new(DaemontoolsPlugin::new(ctx.clone())));
    }

    let mode = ctx.config.run_mode;
    if matches!(mode, RunMode::Root | RunMode::Privileged) {
        plugins.push(Box::new(SysctlPlugin::new(ctx.clone())));
        plugins.push(Box::new(KernelModulesPlugin::new(ctx.clone())));
        plugins.push(Box::new(PidfilePlugin::new(ctx.clone())));
        plugins.push(Box::new(SshdConfigPlugin::new(ctx.clone())));
        match distro {
            Distro::Debian => plugins.push(Box::new(DpkgPlugin::new(ctx.clone()))),
            Distro::RedHat | Distro::Suse => plugins.push(Box::new(RpmPlugin::new(ctx.clone()))),
            Distro::Other => {}
        }
    }

    if mode == RunMode::Root {
        plugins.push(Box::new(SelinuxPlugin::new(ctx.clone())));
    }

    plugins
}

/// Ids older agents stored inventory under; it is removed at startup.
pub fn deprecated_plugins() -> Vec<PluginId> {
    vec![
        PluginId::new("metadata", "cloud_instance"),
        PluginId::new("metadata", "cloud_ami"),
        PluginId::new("hostinfo", "host_info"),
        PluginId::new("hostinfo", "hostinfo"),
        PluginId::new("services", "sysv_init"),
        PluginId::new("services", "docker"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::sync::Arc;

    fn ids(mode: RunMode, containerized: bool, distro: Distro) -> Vec<String> {
        let config = AgentConfig {
            run_mode: mode,
            is_containerized: containerized,
            ..Default::default()
        };
        let ctx = PluginContext::new("host", Arc::new(config));
        plugins_for(&ctx, distro)
            .iter()
            .map(|p| p.id().to_string())
            .collect()
    }

    #[test]
    fn root_on_debian() {
        let ids = ids(RunMode::Root, false, Distro::Debian);
        assert_eq!(ids[0], "metadata/system");
        for id in [
            "services/upstart",
            "services/systemd",
            "metadata/facter_facts",
            "sessions/users",
            "services/daemontools",
            "kernel/sysctl",
            "kernel/modules",
            "services/pidfile",
            "config/sshd",
            "packages/dpkg",
            "config/selinux",
        ] {
            assert!(ids.contains(&id.to_string()), "{id} missing");
        }
        assert!(!ids.contains(&"packages/rpm".to_string()));
    }

    #[test]
    fn privileged_on_suse_has_rpm_without_selinux() {
        let ids = ids(RunMode::Privileged, false, Distro::Suse);
        assert!(ids.contains(&"packages/rpm".to_string()));
        assert!(!ids.contains(&"config/selinux".to_string()));
    }

    #[test]
    fn unprivileged_container_only_has_host_info() {
        assert_eq!(ids(RunMode::Unprivileged, true, Distro::RedHat), vec!["metadata/system"]);
        let ids = ids(RunMode::Unprivileged, false, Distro::Other);
        assert_eq!(ids.len(), 6);
        assert!(!ids.contains(&"kernel/sysctl".to_string()));
    }

    #[test]
    fn deprecated_ids_include_old_host_info() {
        let old = deprecated_plugins();
        assert!(old.contains(&PluginId::new("hostinfo", "hostinfo")));
        assert!(old.contains(&PluginId::new("services", "sysv_init")));
    }
}
