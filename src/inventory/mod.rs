//! Inventory handler: stores plugin outputs as deltas and ships them on a timer.

mod sender;

pub use sender::{jitter, send_delay, PatchSender};

use crate::config::AgentConfig;
use crate::delta::DeltaStore;
use crate::error::AgentError;
use crate::plugins::{PluginId, PluginOutput};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

pub struct InventoryHandler {
    store: Arc<DeltaStore>,
    sender: PatchSender,
    agent_entity: String,
    entities: BTreeSet<String>,
    expected: HashSet<PluginId>,
    reported: HashSet<PluginId>,
    ready: bool,
    send_interval: Duration,
    first_reap_max_wait: Duration,
    max_backoff: Duration,
    send_errors: u32,
}

impl InventoryHandler {
    /// `expected` are the registered plugins; the first send waits for all of them.
    pub fn new(
        config: &AgentConfig,
        store: Arc<DeltaStore>,
        sender: PatchSender,
        agent_entity: impl Into<String>,
        expected: impl IntoIterator<Item = PluginId>,
    ) -> Self {
        let agent_entity = agent_entity.into();
        Self {
            store,
            sender,
            entities: BTreeSet::from([agent_entity.clone()]),
            agent_entity,
            expected: expected.into_iter().collect(),
            reported: HashSet::new(),
            ready: false,
            send_interval: Duration::from_secs(config.inventory.send_interval_secs),
            first_reap_max_wait: Duration::from_secs(config.inventory.first_reap_max_wait_secs),
            max_backoff: Duration::from_secs(config.uplink.max_backoff_secs),
            send_errors: 0,
        }
    }

    /// Stores one plugin output. Not-applicable outputs drop whatever the source had stored.
    pub fn handle(&mut self, output: PluginOutput) -> Result<bool, AgentError> {
        let source = output.id.to_string();
        self.reported.insert(output.id.clone());
        if output.not_applicable {
            let removed = self.store.remove_source(&source)?;
            if removed {
                debug!(plugin = %source, "removed inventory of a plugin that does not apply");
            }
            return Ok(removed);
        }
        let entity = if output.entity_key.is_empty() {
            self.agent_entity.clone()
        } else {
            output.entity_key
        };
        self.entities.insert(entity.clone());
        self.store.save_plugin_source(&entity, &source, output.data.into_json())
    }

    /// True once every expected plugin reported or the first-send wait ran out.
    pub fn ready_to_send(&mut self, waited: Duration) -> bool {
        if !self.ready {
            let missing: Vec<String> = self
                .expected
                .iter()
                .filter(|id| !self.reported.contains(id))
                .map(ToString::to_string)
                .collect();
            if missing.is_empty() || waited >= self.first_reap_max_wait {
                info!(missing = ?missing, "starting inventory submission");
                self.ready = true;
            } else {
                debug!(missing = ?missing, "still waiting on plugins");
            }
        }
        self.ready
    }

    /// Runs one send round over every known entity and returns the delay until the next one.
    pub async fn send(&mut self) -> Duration {
        let mut rate_limited = false;
        let mut failed = false;
        for entity in self.entities.clone() {
            if let Err(e) = self.sender.process(&entity).await {
                if matches!(e, AgentError::Uplink { status: 429, .. }) {
                    rate_limited = true;
                }
                debug!(entity = %entity, error = %e, "inventory send failed");
                failed = true;
            }
        }
        if rate_limited {
            info!("inventory submission is rate limited");
            self.send_errors = u32::MAX;
        } else if failed {
            self.send_errors = self.send_errors.saturating_add(1);
        } else {
            self.send_errors = 0;
        }
        send_delay(self.send_interval, self.max_backoff, self.send_errors, jitter())
    }

    /// Consumes plugin outputs and sends deltas until shutdown. Pending deltas keep being
    /// sent after every plugin has stopped.
    pub async fn run(
        mut self,
        mut outputs: mpsc::Receiver<PluginOutput>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let started = Instant::now();
        let mut next_send = started + self.send_interval;
        let mut receiving = true;
        loop {
            tokio::select! {
                output = outputs.recv(), if receiving => match output {
                    Some(output) => {
                        let id = output.id.clone();
                        if let Err(e) = self.handle(output) {
                            error!(plugin = %id, error = %e, "problem storing plugin output");
                        }
                    }
                    None => {
                        debug!("all plugins stopped");
                        receiving = false;
                    }
                },
                _ = sleep_until(next_send) => {
                    let delay = if self.ready_to_send(started.elapsed()) {
                        self.send().await
                    } else {
                        self.send_interval
                    };
                    next_send = Instant::now() + delay;
                }
                _ = shutdown.changed() => {
                    info!("inventory handler stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{InventoryDataset, Reconnect};
    use crate::uplink::OfflineLogger;
    use serde_json::json;

    fn handler(expected: Vec<PluginId>) -> (InventoryHandler, Arc<DeltaStore>) {
        let store = Arc::new(DeltaStore::open_in_memory(10_000).unwrap());
        store.set_last_submission(chrono::Utc::now()).unwrap();
        let sender = PatchSender::new(
            store.clone(),
            Arc::new(OfflineLogger),
            "host",
            Reconnect::default(),
            Duration::from_secs(3600),
        );
        let h = InventoryHandler::new(&AgentConfig::default(), store.clone(), sender, "host", expected);
        (h, store)
    }

    #[derive(serde::Serialize)]
    struct User {
        id: String,
    }

    impl crate::plugins::Sortable for User {
        fn sort_key(&self) -> String {
            self.id.clone()
        }
    }

    fn users(names: &[&str]) -> InventoryDataset {
        InventoryDataset::from_items(names.iter().map(|n| User { id: n.to_string() })).unwrap()
    }

    #[test]
    fn waits_for_every_plugin_or_the_deadline() {
        let users_id = PluginId::new("sessions", "users");
        let sshd_id = PluginId::new("config", "sshd");
        let (mut h, _) = handler(vec![users_id.clone(), sshd_id.clone()]);

        h.handle(PluginOutput::new(users_id, "host", users(&["root"]))).unwrap();
        assert!(!h.ready_to_send(Duration::from_secs(1)));
        h.handle(PluginOutput::not_applicable(sshd_id, "host")).unwrap();
        assert!(h.ready_to_send(Duration::from_secs(1)));

        let (mut late, _) = handler(vec![PluginId::new("kernel", "modules")]);
        assert!(late.ready_to_send(Duration::from_secs(60)));
    }

    #[test]
    fn not_applicable_output_removes_stored_inventory() {
        let id = PluginId::new("sessions", "users");
        let (mut h, store) = handler(vec![id.clone()]);
        assert!(h.handle(PluginOutput::new(id.clone(), "host", users(&["root", "admin"]))).unwrap());
        assert_eq!(
            store.snapshot("host", "sessions/users").unwrap(),
            Some(json!({ "admin": { "id": "admin" }, "root": { "id": "root" } }))
        );

        assert!(h.handle(PluginOutput::not_applicable(id, "host")).unwrap());
        assert!(store.snapshot("host", "sessions/users").unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_mode_acknowledges_deltas() {
        let id = PluginId::new("sessions", "users");
        let (mut h, store) = handler(vec![id.clone()]);
        h.handle(PluginOutput::new(id, "host", users(&["root"]))).unwrap();
        assert_eq!(store.read_deltas("host").unwrap().len(), 1);

        let delay = h.send().await;
        assert_eq!(delay, Duration::from_secs(AgentConfig::default().inventory.send_interval_secs));
        assert!(store.read_deltas("host").unwrap().is_empty());
    }
}
