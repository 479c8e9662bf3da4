//! Wires the delta store, the plugins and the inventory handler together.

use crate::config::AgentConfig;
use crate::delta::DeltaStore;
use crate::error::AgentError;
use crate::inventory::{InventoryHandler, PatchSender};
use crate::plugins::{deprecated_plugins, linux_plugins, run_plugin, PluginContext};
use crate::uplink::{DeltaPoster, IngestClient, OfflineLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const STORE_FILE: &str = "inventory.db";
const OUTPUT_QUEUE_LEN: usize = 256;

pub struct Agent {
    config: Arc<AgentConfig>,
    store: Arc<DeltaStore>,
    entity_key: String,
}

impl Agent {
    /// Opens the delta store under `data_dir` and resolves the entity key.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = DeltaStore::open(
            &config.data_dir.join(STORE_FILE),
            config.inventory.max_inventory_size,
        )?;
        let entity_key = resolve_entity_key(&config, &store)?;
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            entity_key,
        })
    }

    pub fn entity_key(&self) -> &str {
        &self.entity_key
    }

    pub fn store(&self) -> &Arc<DeltaStore> {
        &self.store
    }

    /// Runs plugins and the inventory handler until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        for id in deprecated_plugins() {
            if self.store.remove_source(&id.to_string())? {
                info!(plugin = %id, "removed inventory of deprecated plugin");
            }
        }

        let ctx = PluginContext::new(self.entity_key.clone(), self.config.clone());
        let plugins = linux_plugins(&ctx);
        let ids: Vec<_> = plugins.iter().map(|p| p.id()).collect();
        info!(entity = %self.entity_key, plugins = ids.len(), "starting plugins");

        let poster: Arc<dyn DeltaPoster> = if self.config.uplink.enabled {
            let agent_id = self.store.agent_id()?;
            let client = IngestClient::new(&self.config.uplink, &self.entity_key, &agent_id)?;
            info!(url = client.url(), "posting deltas to ingest service");
            Arc::new(client)
        } else {
            info!("uplink disabled, deltas are logged and acknowledged locally");
            Arc::new(OfflineLogger)
        };
        let sender = PatchSender::new(
            self.store.clone(),
            poster,
            self.entity_key.clone(),
            ctx.reconnect.clone(),
            Duration::from_secs(self.config.inventory.reset_if_offline_secs),
        );
        let handler = InventoryHandler::new(
            &self.config,
            self.store.clone(),
            sender,
            self.entity_key.clone(),
            ids,
        );

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_LEN);
        let mut tasks = JoinSet::new();
        for plugin in plugins {
            tasks.spawn(run_plugin(
                plugin,
                self.entity_key.clone(),
                tx.clone(),
                ctx.reconnect.subscribe(),
                shutdown.clone(),
            ));
        }
        drop(tx);
        let handler_task = tokio::spawn(handler.run(rx, shutdown));

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(exit) => debug!(?exit, "plugin task ended"),
                Err(e) => warn!(error = %e, "plugin task failed"),
            }
        }
        if let Err(e) = handler_task.await {
            warn!(error = %e, "inventory handler failed");
        }
        info!("agent stopped");
        Ok(())
    }
}

/// Configured key, else the hostname, else the persistent agent id.
fn resolve_entity_key(config: &AgentConfig, store: &DeltaStore) -> Result<String, AgentError> {
    if let Some(key) = config.entity_key.as_deref().filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    match sysinfo::System::host_name().filter(|h| !h.is_empty()) {
        Some(host) => Ok(host),
        None => {
            warn!("no hostname available, using the agent id as entity key");
            store.agent_id()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_entity_key_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: dir.path().join("data"),
            entity_key: Some("web-01".to_string()),
            ..Default::default()
        };
        let agent = Agent::new(config).unwrap();
        assert_eq!(agent.entity_key(), "web-01");
        assert!(dir.path().join("data").join(STORE_FILE).exists());
    }

    #[test]
    fn agent_id_is_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let first = Agent::new(config.clone()).unwrap().store().agent_id().unwrap();
        let second = Agent::new(config).unwrap().store().agent_id().unwrap();
        assert_eq!(first, second);
        assert!(!Agent::new(AgentConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
        .entity_key()
        .is_empty());
    }

    #[tokio::test]
    async fn startup_drops_deprecated_plugin_inventory() {
        let data = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: data.path().to_path_buf(),
            entity_key: Some("web-01".to_string()),
            run_mode: crate::config::RunMode::Unprivileged,
            is_containerized: true,
            host_root: Some(host.path().to_path_buf()),
            ..Default::default()
        };
        let agent = Agent::new(config).unwrap();
        let store = agent.store().clone();
        let item = serde_json::json!({ "cron": { "id": "cron" } });
        let item = item.as_object().cloned().unwrap();
        store.save_plugin_source("web-01", "services/sysv_init", item.clone()).unwrap();
        store.save_plugin_source("web-01", "hostinfo/hostinfo", item.clone()).unwrap();
        store.save_plugin_source("web-01", "kernel/modules", item).unwrap();

        let (stop_tx, stop) = watch::channel(false);
        let running = tokio::spawn(agent.run(stop));
        // Host info is the only plugin in an unprivileged container.
        for _ in 0..500 {
            if store.snapshot("web-01", "metadata/system").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.snapshot("web-01", "metadata/system").unwrap().is_some());
        assert!(store.snapshot("web-01", "services/sysv_init").unwrap().is_none());
        assert!(store.snapshot("web-01", "hostinfo/hostinfo").unwrap().is_none());
        assert!(store.snapshot("web-01", "kernel/modules").unwrap().is_some());

        stop_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
