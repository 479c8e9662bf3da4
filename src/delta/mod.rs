//! Inventory deltas: wire types, merge patches and the local delta store.

mod patch;
mod store;

pub use patch::{create_merge_patch, remove_nulls};
pub use store::DeltaStore;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::error;

/// `reset` value asking the agent to resend every source in full.
pub const RESET_ALL: &str = "all";

/// Longest `source` the backend accepts.
pub const MAX_SOURCE_LEN: usize = 100;

/// One change to one plugin source, numbered per entity and source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDelta {
    pub source: String,
    pub id: i64,
    pub timestamp: i64,
    pub diff: Map<String, Value>,
    pub full_diff: bool,
}

/// Deltas posted in one request.
pub type DeltaBlock = Vec<RawDelta>;

/// Backend view of one source after a post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaState {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_reset: bool,
    /// Latest id the backend stored, zero if none
    #[serde(default)]
    pub last_stored_id: i64,
    /// Id the backend expects next, zero to ask for a full delta
    #[serde(default)]
    pub send_next_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type DeltaStateMap = HashMap<String, DeltaState>;

#[derive(Debug, Clone, Serialize)]
pub struct PostDeltaBody {
    #[serde(rename = "entityKeys")]
    pub entity_keys: Vec<String>,
    #[serde(rename = "isAgent")]
    pub is_agent: bool,
    pub deltas: Vec<RawDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PostDeltaResponse {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub state_map: DeltaStateMap,
    #[serde(default)]
    pub reset: Option<String>,
}

impl PostDeltaResponse {
    pub fn reset_all(&self) -> bool {
        self.reset.as_deref() == Some(RESET_ALL)
    }
}

/// Drops deltas the backend would reject.
pub fn filter_deltas(deltas: Vec<RawDelta>) -> Vec<RawDelta> {
    deltas
        .into_iter()
        .filter(|d| {
            let ok = d.source.len() <= MAX_SOURCE_LEN;
            if !ok {
                error!(source = %d.source, max = MAX_SOURCE_LEN, "inventory delta source too long, dropping");
            }
            ok
        })
        .collect()
}
