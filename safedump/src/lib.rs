//! Safedump Library
//!
//! Streaming backup and restore for PostgreSQL, MySQL and MariaDB, with
//! integrity checking, retention, authenticated encryption and uniform
//! object storage.

pub mod artifact;
pub mod backup;
pub mod classify;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod pitr;
pub mod process;
pub mod restore;
pub mod retention;
pub mod retry;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use context::OpContext;
pub use error::{Result, SafedumpError};
