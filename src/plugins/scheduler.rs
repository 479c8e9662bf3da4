//! Drives one plugin: presence check, then samples on its schedule until shutdown.

use super::{FileTrigger, Plugin, PluginId, PluginOutput, Schedule};
use crate::error::AgentError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why a plugin task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginExit {
    Disabled,
    CannotRun,
    /// One-shot plugin sampled and nothing asks it to sample again
    Done,
    Shutdown,
    /// The handler went away or the plugin panicked
    Aborted,
}

/// Runs `plugin` until `shutdown` flips to true. Outputs go to `outputs`; a plugin that is
/// disabled or cannot run reports a not-applicable output so its stored inventory is dropped.
pub async fn run_plugin(
    plugin: Box<dyn Plugin>,
    entity_key: String,
    outputs: mpsc::Sender<PluginOutput>,
    mut reconnect: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> PluginExit {
    let id = plugin.id();
    let schedule = plugin.schedule();

    if schedule == Schedule::Disabled {
        info!(plugin = %id, "plugin disabled by configuration");
        let _ = outputs.send(PluginOutput::not_applicable(id, entity_key)).await;
        return PluginExit::Disabled;
    }

    let (mut plugin, can_run) = match tokio::task::spawn_blocking(move || {
        let mut plugin = plugin;
        let ok = plugin.can_run();
        (plugin, ok)
    })
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(plugin = %id, error = %e, "presence check panicked");
            return PluginExit::Aborted;
        }
    };
    if !can_run {
        info!(plugin = %id, "plugin cannot run on this host, unregistering");
        let _ = outputs.send(PluginOutput::not_applicable(id, entity_key)).await;
        return PluginExit::CannotRun;
    }

    match schedule {
        Schedule::Disabled => PluginExit::Disabled,
        Schedule::Once => loop {
            plugin = match sample(plugin, &id, &outputs).await {
                Some(p) => p,
                None => return PluginExit::Aborted,
            };
            tokio::select! {
                changed = reconnect.changed() => {
                    if changed.is_err() {
                        return PluginExit::Done;
                    }
                    debug!(plugin = %id, "reconnect requested, sampling again");
                }
                _ = shutdown.changed() => return PluginExit::Shutdown,
            }
        },
        Schedule::Every(every) => {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        plugin = match sample(plugin, &id, &outputs).await {
                            Some(p) => p,
                            None => return PluginExit::Aborted,
                        };
                    }
                    _ = shutdown.changed() => return PluginExit::Shutdown,
                }
            }
        }
        Schedule::Watch { paths, every } => {
            let mut trigger = match FileTrigger::watch_first(&paths) {
                Ok(t) => {
                    debug!(plugin = %id, path = %t.path().display(), "watching for changes");
                    Some(t)
                }
                Err(e) => {
                    warn!(plugin = %id, error = %e, "cannot watch files, sampling on every tick");
                    None
                }
            };
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut dirty = true;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(t) = trigger.as_mut() {
                            dirty |= t.drain();
                        } else {
                            dirty = true;
                        }
                        if !dirty {
                            continue;
                        }
                        dirty = false;
                        plugin = match sample(plugin, &id, &outputs).await {
                            Some(p) => p,
                            None => return PluginExit::Aborted,
                        };
                    }
                    _ = shutdown.changed() => return PluginExit::Shutdown,
                }
            }
        }
    }
}

/// Samples on the blocking pool and forwards outputs. Sampling errors are logged and the
/// plugin is handed back; `None` means the task must stop.
async fn sample(
    plugin: Box<dyn Plugin>,
    id: &PluginId,
    outputs: &mpsc::Sender<PluginOutput>,
) -> Option<Box<dyn Plugin>> {
    let joined = tokio::task::spawn_blocking(move || {
        let mut plugin = plugin;
        let result = plugin.sample();
        (plugin, result)
    })
    .await;
    let (plugin, result) = match joined {
        Ok(r) => r,
        Err(e) => {
            warn!(plugin = %id, error = %e, "plugin panicked while sampling");
            return None;
        }
    };
    match result {
        Ok(batch) => {
            debug!(plugin = %id, outputs = batch.len(), "sampled");
            for output in batch {
                if outputs.send(output).await.is_err() {
                    debug!(plugin = %id, "inventory handler closed");
                    return None;
                }
            }
        }
        Err(AgentError::NotApplicable(reason)) => {
            debug!(plugin = %id, %reason, "nothing to report");
        }
        Err(e) => warn!(plugin = %id, error = %e, "sampling failed"),
    }
    Some(plugin)
}
