//! Unified error type for the agent.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("cannot parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("cannot read config {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("delta store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("uplink rejected request: {status} {body}")]
    Uplink { status: u16, body: String },

    #[error("inventory for {entity} {source_id} is {size} bytes, above the {max} bytes limit")]
    InventoryTooLarge {
        entity: String,
        source_id: String,
        size: usize,
        max: usize,
    },

    #[error("inventory cache for {0} was removed after a long disconnection")]
    InventoryReset(String),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("plugin not applicable: {0}")]
    NotApplicable(String),
}

impl AgentError {
    pub fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        AgentError::Parse {
            what,
            detail: detail.into(),
        }
    }
}
