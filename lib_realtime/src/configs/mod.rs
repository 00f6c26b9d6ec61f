//! # Configuration Modules
//!
//! Settings shared by every client built from this crate.

/// Client settings: defaults, JSON5 file and `REALTIME_*` overrides.
pub mod config_client;

pub use config_client::{ClientConfig, ConfigError};
