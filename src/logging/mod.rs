//! Structured logging setup.

mod format;

pub use format::{LogOnce, StructuredLogger};
