//! Host inventory agent: samples operating-system state through plugins and ships
//! only the changes to an ingest service.
//!
//! - [`plugins`] — plugin framework, scheduler and the Linux plugins
//! - [`delta`] — merge patches and the SQLite delta store
//! - [`inventory`] — stores plugin outputs and sends deltas with backoff
//! - [`uplink`] — ingest HTTP client and offline logging mode
//! - [`config`] — file and environment configuration
//! - [`logging`] — structured logging

pub mod agent;
pub mod config;
pub mod delta;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod plugins;
pub mod uplink;

pub use agent::Agent;
pub use config::AgentConfig;
pub use delta::DeltaStore;
pub use error::AgentError;
pub use inventory::InventoryHandler;
pub use logging::StructuredLogger;
