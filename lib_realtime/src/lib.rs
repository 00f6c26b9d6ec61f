//! Realtime records, events and RPC over a single authenticated connection.
//!
//! Start with [`crate::core::RealtimeClient`].

pub mod configs;
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod protocol;

pub use crate::configs::{ClientConfig, ConfigError};
pub use crate::core::{ClientError, ConnectionState, ErrorEvent, LoginResult, RealtimeClient, RuntimeError};
