//! File-change triggers backed by `notify`.

use crate::error::AgentError;
use notify::event::{AccessKind, AccessMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Watches one file; every relevant change yields a unit on `events`.
pub struct FileTrigger {
    _watcher: RecommendedWatcher,
    path: PathBuf,
    pub events: mpsc::UnboundedReceiver<()>,
}

impl FileTrigger {
    /// Watches the first candidate that can be watched.
    pub fn watch_first(candidates: &[PathBuf]) -> Result<Self, AgentError> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if is_change(&event.kind) {
                    let _ = tx.send(());
                }
            }
        })?;

        let mut last_err = None;
        for path in candidates {
            match watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    return Ok(Self {
                        _watcher: watcher,
                        path: path.clone(),
                        events,
                    })
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => AgentError::NotApplicable("no file to watch".to_string()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drains queued events; true if any arrived.
    pub fn drain(&mut self) -> bool {
        let mut changed = false;
        while self.events.try_recv().is_ok() {
            changed = true;
        }
        changed
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Remove(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_candidates_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.lock");
        assert!(FileTrigger::watch_first(&[missing]).is_err());
        assert!(FileTrigger::watch_first(&[]).is_err());
    }

    #[test]
    fn falls_back_to_second_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("Installtid");
        std::fs::write(&present, b"").unwrap();
        let trigger =
            FileTrigger::watch_first(&[dir.path().join(".rpm.lock"), present.clone()]).unwrap();
        assert_eq!(trigger.path(), present.as_path());
    }
}
