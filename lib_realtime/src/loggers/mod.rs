//! # Logging Setup
//!
//! The library itself only talks to the `log` facade. Binaries that want the
//! standard console + file output call `setup_logging` once at startup.

/// fern dispatcher with colored console output and a rotated log file.
pub mod logger_setup;

pub use logger_setup::{cleanup_old_logs, parse_level, setup_logging, LoggerError};
