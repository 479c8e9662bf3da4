//! Ships one entity's pending deltas and records the backend's answer.

use crate::delta::DeltaStore;
use crate::error::AgentError;
use crate::plugins::Reconnect;
use crate::uplink::DeltaPoster;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Delay before the next send: the interval after a success, then `interval + 2^(errors-1)`
/// seconds plus up to one second of jitter, capped at `max`.
pub fn send_delay(interval: Duration, max: Duration, errors: u32, jitter: Duration) -> Duration {
    if errors == 0 {
        return interval;
    }
    if errors >= 31 {
        return max;
    }
    let backoff = interval + Duration::from_secs(1u64 << (errors - 1)) + jitter;
    backoff.clamp(Duration::from_secs(1), max.max(Duration::from_secs(1)))
}

pub fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..1000))
}

pub struct PatchSender {
    store: Arc<DeltaStore>,
    poster: Arc<dyn DeltaPoster>,
    agent_entity: String,
    reconnect: Reconnect,
    reset_if_offline: chrono::Duration,
    last_reset: Option<DateTime<Utc>>,
}

impl PatchSender {
    pub fn new(
        store: Arc<DeltaStore>,
        poster: Arc<dyn DeltaPoster>,
        agent_entity: impl Into<String>,
        reconnect: Reconnect,
        reset_if_offline: Duration,
    ) -> Self {
        Self {
            store,
            poster,
            agent_entity: agent_entity.into(),
            reconnect,
            reset_if_offline: chrono::Duration::from_std(reset_if_offline)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            last_reset: None,
        }
    }

    pub async fn process(&mut self, entity: &str) -> Result<(), AgentError> {
        self.process_at(entity, Utc::now()).await
    }

    /// Sends every pending block of `entity`. Stops at the first failed post; the caller backs off.
    pub async fn process_at(&mut self, entity: &str, now: DateTime<Utc>) -> Result<(), AgentError> {
        let is_agent = entity == self.agent_entity;

        if self.offline_too_long(entity, now) {
            warn!(entity, offline_limit = %self.reset_if_offline, "removing inventory cache after long disconnection");
            if let Err(e) = self.store.remove_entity(entity) {
                warn!(entity, error = %e, "could not remove inventory cache");
            }
            if is_agent {
                self.reconnect.request();
                debug!(entity, generation = self.reconnect.generation(), "asked plugins to sample again");
            }
            self.last_reset = Some(now);
            return Err(AgentError::InventoryReset(entity.to_string()));
        }

        let blocks = self.store.read_deltas(entity)?;
        if blocks.is_empty() {
            debug!(entity, "no deltas to send");
            return Ok(());
        }

        debug!(entity, blocks = blocks.len(), "sending deltas");
        let mut reset = false;
        let mut result = Ok(());
        for (n, block) in blocks.into_iter().enumerate() {
            debug!(entity, block = n, deltas = block.len(), "sending deltas block");
            let response = match self
                .poster
                .post_deltas(vec![entity.to_string()], is_agent, block.clone())
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    error!(entity, block = n, is_agent, error = %e, "could not post deltas");
                    result = Err(e);
                    break;
                }
            };
            if let Err(e) = self.store.set_last_submission(now) {
                error!(entity, error = %e, "cannot save submission time");
            }
            if response.reset_all() {
                reset = true;
            } else {
                self.store.update_state(entity, &block, Some(&response.state_map))?;
            }
        }

        if reset {
            debug!(entity, "full inventory reset requested");
            self.store.reset_all_deltas(entity)?;
            if is_agent {
                self.reconnect.request();
                debug!(entity, generation = self.reconnect.generation(), "asked plugins to sample again");
            }
        }
        result
    }

    /// A missing or unreadable submission time counts as never submitted. Entities without
    /// a key are reported under the agent and never reset on their own.
    fn offline_too_long(&self, entity: &str, now: DateTime<Utc>) -> bool {
        if entity.is_empty() {
            return false;
        }
        let last = match self.store.last_submission() {
            Ok(last) => last,
            Err(e) => {
                warn!(entity, error = %e, "cannot read last submission time");
                None
            }
        };
        let exceeded = last.map_or(true, |t| t + self.reset_if_offline < now);
        let recently_reset = self
            .last_reset
            .is_some_and(|r| r + self.reset_if_offline >= now);
        exceeded && !recently_reset
    }
}
