//! SQLite-backed inventory snapshots and pending deltas, per entity and plugin source.

use super::{create_merge_patch, remove_nulls, DeltaBlock, DeltaState, DeltaStateMap, RawDelta};
use crate::error::AgentError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const META_AGENT_ID: &str = "agent_id";
const META_LAST_SUBMISSION: &str = "last_submission";

struct SourceRow {
    snapshot: String,
    digest: String,
    delta_id: i64,
    last_sent_id: i64,
}

pub struct DeltaStore {
    conn: Mutex<Connection>,
    max_inventory_size: usize,
}

impl DeltaStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path, max_inventory_size: usize) -> Result<Self, AgentError> {
        Self::init(Connection::open(path)?, max_inventory_size)
    }

    pub fn open_in_memory(max_inventory_size: usize) -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?, max_inventory_size)
    }

    fn init(conn: Connection, max_inventory_size: usize) -> Result<Self, AgentError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                entity TEXT NOT NULL,
                source TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                digest TEXT NOT NULL,
                delta_id INTEGER NOT NULL,
                last_sent_id INTEGER NOT NULL,
                PRIMARY KEY (entity, source)
            );
            CREATE TABLE IF NOT EXISTS deltas (
                entity TEXT NOT NULL,
                source TEXT NOT NULL,
                id INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                diff TEXT NOT NULL,
                full INTEGER NOT NULL,
                PRIMARY KEY (entity, source, id)
            );
            CREATE TABLE IF NOT EXISTS meta (k TEXT PRIMARY KEY, v TEXT NOT NULL);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_inventory_size,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a plugin's latest inventory. Returns true when it differs from the stored
    /// snapshot, in which case a delta is queued: full for a new source, a merge patch otherwise.
    pub fn save_plugin_source(
        &self,
        entity: &str,
        source: &str,
        data: Map<String, Value>,
    ) -> Result<bool, AgentError> {
        let mut value = Value::Object(data);
        remove_nulls(&mut value);
        let serialized = serde_json::to_string(&value)?;
        if serialized.len() > self.max_inventory_size {
            return Err(AgentError::InventoryTooLarge {
                entity: entity.to_string(),
                source_id: source.to_string(),
                size: serialized.len(),
                max: self.max_inventory_size,
            });
        }
        let digest = hex_digest(&serialized);

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (delta_id, diff, full) = match source_row(&tx, entity, source)? {
            None => (1, value, true),
            Some(row) if row.digest == digest => return Ok(false),
            Some(row) => {
                let previous: Value = serde_json::from_str(&row.snapshot)?;
                let patch = create_merge_patch(&previous, &value);
                if patch.as_object().is_some_and(Map::is_empty) {
                    return Ok(false);
                }
                (row.delta_id + 1, patch, false)
            }
        };
        insert_delta(&tx, entity, source, delta_id, &diff, full)?;
        tx.execute(
            "INSERT INTO sources (entity, source, snapshot, digest, delta_id, last_sent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT (entity, source) DO UPDATE SET
                snapshot = excluded.snapshot, digest = excluded.digest, delta_id = excluded.delta_id",
            params![entity, source, serialized, digest, delta_id],
        )?;
        tx.commit()?;
        debug!(entity, source, delta_id, full, "queued inventory delta");
        Ok(true)
    }

    /// Latest stored inventory of one source.
    pub fn snapshot(&self, entity: &str, source: &str) -> Result<Option<Value>, AgentError> {
        let conn = self.conn();
        match source_row(&conn, entity, source)? {
            Some(row) => Ok(Some(serde_json::from_str(&row.snapshot)?)),
            None => Ok(None),
        }
    }

    /// Pending deltas ordered by source and id, grouped into blocks whose serialized deltas
    /// stay within the size limit. A source's deltas never straddle two blocks.
    pub fn read_deltas(&self, entity: &str) -> Result<Vec<DeltaBlock>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source, id, ts, diff, full FROM deltas WHERE entity = ?1 ORDER BY source, id",
        )?;
        let rows = stmt.query_map(params![entity], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;

        let mut by_source: BTreeMap<String, (usize, Vec<RawDelta>)> = BTreeMap::new();
        for row in rows {
            let (source, id, timestamp, diff_text, full_diff) = row?;
            let diff: Map<String, Value> = match serde_json::from_str(&diff_text) {
                Ok(d) => d,
                Err(e) => {
                    warn!(entity, source = %source, id, error = %e, "dropping unreadable delta");
                    continue;
                }
            };
            let delta = RawDelta {
                source,
                id,
                timestamp,
                diff,
                full_diff,
            };
            let size = serde_json::to_vec(&delta)?.len();
            let group = by_source.entry(delta.source.clone()).or_default();
            group.0 += size;
            group.1.push(delta);
        }

        let mut blocks = Vec::new();
        let mut block: DeltaBlock = Vec::new();
        let mut block_size = 0;
        for (size, deltas) in by_source.into_values() {
            if !block.is_empty() && block_size + size > self.max_inventory_size {
                blocks.push(std::mem::take(&mut block));
                block_size = 0;
            }
            block.extend(deltas);
            block_size += size;
        }
        if !block.is_empty() {
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Records the outcome of posting `sent`. Each source is settled once, by its newest
    /// delta in the block and the backend's hint for that source if there is one.
    pub fn update_state(
        &self,
        entity: &str,
        sent: &[RawDelta],
        states: Option<&DeltaStateMap>,
    ) -> Result<(), AgentError> {
        let mut newest: BTreeMap<&str, i64> = BTreeMap::new();
        for d in sent {
            let id = newest.entry(d.source.as_str()).or_insert(d.id);
            *id = (*id).max(d.id);
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (source, id) in newest {
            let Some(row) = source_row(&tx, entity, source)? else {
                continue;
            };
            let hint = states.and_then(|s| s.get(source));
            settle_source(&tx, entity, source, id, &row, hint)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Every source of `entity` queues a full delta of its snapshot.
    pub fn reset_all_deltas(&self, entity: &str) -> Result<(), AgentError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let sources: Vec<(String, i64, String)> = {
            let mut stmt =
                tx.prepare("SELECT source, delta_id, snapshot FROM sources WHERE entity = ?1")?;
            let rows = stmt.query_map(params![entity], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for (source, delta_id, snapshot) in &sources {
            requeue_full(&tx, entity, source, *delta_id, snapshot)?;
        }
        tx.commit()?;
        debug!(entity, sources = sources.len(), "reset all inventory deltas");
        Ok(())
    }

    pub fn remove_entity(&self, entity: &str) -> Result<(), AgentError> {
        let conn = self.conn();
        conn.execute("DELETE FROM deltas WHERE entity = ?1", params![entity])?;
        conn.execute("DELETE FROM sources WHERE entity = ?1", params![entity])?;
        Ok(())
    }

    /// Drops a source for every entity. Returns whether anything was stored for it.
    pub fn remove_source(&self, source: &str) -> Result<bool, AgentError> {
        let conn = self.conn();
        conn.execute("DELETE FROM deltas WHERE source = ?1", params![source])?;
        let removed = conn.execute("DELETE FROM sources WHERE source = ?1", params![source])?;
        Ok(removed > 0)
    }

    /// Persistent agent id, created on first use.
    pub fn agent_id(&self) -> Result<String, AgentError> {
        if let Some(id) = self.meta(META_AGENT_ID)? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set_meta(META_AGENT_ID, &id)?;
        Ok(id)
    }

    pub fn last_submission(&self) -> Result<Option<DateTime<Utc>>, AgentError> {
        let Some(raw) = self.meta(META_LAST_SUBMISSION)? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| AgentError::parse("last submission time", e.to_string()))
    }

    pub fn set_last_submission(&self, at: DateTime<Utc>) -> Result<(), AgentError> {
        self.set_meta(META_LAST_SUBMISSION, &at.to_rfc3339())
    }

    fn meta(&self, key: &str) -> Result<Option<String>, AgentError> {
        let conn = self.conn();
        let v = conn
            .query_row("SELECT v FROM meta WHERE k = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(v)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), AgentError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO meta (k, v) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

fn hex_digest(data: &str) -> String {
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn source_row(conn: &Connection, entity: &str, source: &str) -> Result<Option<SourceRow>, AgentError> {
    let row = conn
        .query_row(
            "SELECT snapshot, digest, delta_id, last_sent_id FROM sources WHERE entity = ?1 AND source = ?2",
            params![entity, source],
            |row| {
                Ok(SourceRow {
                    snapshot: row.get(0)?,
                    digest: row.get(1)?,
                    delta_id: row.get(2)?,
                    last_sent_id: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn insert_delta(
    conn: &Connection,
    entity: &str,
    source: &str,
    id: i64,
    diff: &Value,
    full: bool,
) -> Result<(), AgentError> {
    conn.execute(
        "INSERT OR REPLACE INTO deltas (entity, source, id, ts, diff, full) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![entity, source, id, Utc::now().timestamp(), serde_json::to_string(diff)?, full],
    )?;
    Ok(())
}

fn set_last_sent(conn: &Connection, entity: &str, source: &str, id: i64) -> Result<(), AgentError> {
    conn.execute(
        "UPDATE sources SET last_sent_id = ?3 WHERE entity = ?1 AND source = ?2",
        params![entity, source, id],
    )?;
    conn.execute(
        "DELETE FROM deltas WHERE entity = ?1 AND source = ?2 AND id <= ?3",
        params![entity, source, id],
    )?;
    Ok(())
}

/// Drops pending deltas and queues the snapshot as a full delta numbered after `delta_id`.
fn requeue_full(
    conn: &Connection,
    entity: &str,
    source: &str,
    delta_id: i64,
    snapshot: &str,
) -> Result<(), AgentError> {
    let full: Value = serde_json::from_str(snapshot)?;
    let id = delta_id + 1;
    conn.execute(
        "DELETE FROM deltas WHERE entity = ?1 AND source = ?2",
        params![entity, source],
    )?;
    insert_delta(conn, entity, source, id, &full, true)?;
    conn.execute(
        "UPDATE sources SET delta_id = ?3 WHERE entity = ?1 AND source = ?2",
        params![entity, source, id],
    )?;
    Ok(())
}

fn settle_source(
    conn: &Connection,
    entity: &str,
    source: &str,
    id: i64,
    row: &SourceRow,
    hint: Option<&DeltaState>,
) -> Result<(), AgentError> {
    let Some(hint) = hint else {
        if id > row.last_sent_id {
            return set_last_sent(conn, entity, source, id);
        }
        conn.execute(
            "DELETE FROM deltas WHERE entity = ?1 AND source = ?2 AND id <= ?3",
            params![entity, source, id],
        )?;
        return Ok(());
    };
    if let Some(error) = &hint.error {
        debug!(entity, source, error = %error, "delta submission returned an error hint");
    }
    if hint.needs_reset || (hint.send_next_id != 0 && hint.send_next_id != id && hint.send_next_id != id + 1) {
        // Numbering follows the backend from here on.
        debug!(
            entity,
            source,
            last_stored_id = hint.last_stored_id,
            send_next_id = hint.send_next_id,
            "reconciling delta ids with backend"
        );
        conn.execute(
            "UPDATE sources SET last_sent_id = ?3 WHERE entity = ?1 AND source = ?2",
            params![entity, source, hint.send_next_id - 1],
        )?;
        requeue_full(conn, entity, source, hint.last_stored_id, &row.snapshot)
    } else if hint.send_next_id == id + 1 {
        set_last_sent(conn, entity, source, id)
    } else if hint.send_next_id == 0 {
        requeue_full(conn, entity, source, row.delta_id, &row.snapshot)
    } else {
        debug!(entity, source, id, "backend asked to resend delta");
        set_last_sent(conn, entity, source, id - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn new_source_queues_full_delta_and_unchanged_data_is_noop() {
        let store = DeltaStore::open_in_memory(1000).unwrap();
        let inv = data(json!({ "sshd": { "id": "sshd", "pid": "10" } }));
        assert!(store.save_plugin_source("host", "services/systemd", inv.clone()).unwrap());
        assert!(!store.save_plugin_source("host", "services/systemd", inv).unwrap());

        let blocks = store.read_deltas("host").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 1);
        assert_eq!(blocks[0][0].id, 1);
        assert!(blocks[0][0].full_diff);
    }

    #[test]
    fn oversize_inventory_is_rejected() {
        let store = DeltaStore::open_in_memory(20).unwrap();
        let inv = data(json!({ "a-very-long-key": { "id": "a-very-long-key" } }));
        let err = store.save_plugin_source("host", "kernel/sysctl", inv).unwrap_err();
        assert!(matches!(err, AgentError::InventoryTooLarge { max: 20, .. }));
        assert!(store.read_deltas("host").unwrap().is_empty());
    }

    #[test]
    fn nulls_are_not_stored() {
        let store = DeltaStore::open_in_memory(1000).unwrap();
        let inv = data(json!({ "x": { "id": "x", "version": null } }));
        store.save_plugin_source("host", "kernel/modules", inv).unwrap();
        let snap = store.snapshot("host", "kernel/modules").unwrap().unwrap();
        assert_eq!(snap, json!({ "x": { "id": "x" } }));
    }

    #[test]
    fn hint_settles_only_the_newest_delta_of_a_source() {
        let store = DeltaStore::open_in_memory(1000).unwrap();
        for pid in ["1", "2", "3"] {
            store
                .save_plugin_source("host", "services/systemd", data(json!({ "sshd": { "pid": pid } })))
                .unwrap();
        }
        let sent = store.read_deltas("host").unwrap().remove(0);
        assert_eq!(sent.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let states = DeltaStateMap::from([(
            "services/systemd".to_string(),
            DeltaState { last_stored_id: 3, send_next_id: 4, ..Default::default() },
        )]);
        store.update_state("host", &sent, Some(&states)).unwrap();
        assert!(store.read_deltas("host").unwrap().is_empty());
    }
}
