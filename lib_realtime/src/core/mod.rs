//! # Client Core Module
//!
//! Everything between the wire and the application callbacks.
//!
//! ## Core Components:
//!
//! - **`transport`**: The `Connector` seam that produces links, with the
//!   WebSocket implementation and an in-memory loopback.
//! - **`connection`**: The connection state machine and its supervisor task
//!   (reconnect with backoff, automatic re-login, ping handling).
//! - **`registry`**: Pattern subscriptions with per-pattern reference counts.
//! - **`record_store`**: Versioned records, optimistic writes and write acks.
//! - **`event_bus`**: Event emit and pattern fan-out.
//! - **`rpc_broker`**: Request correlation, timeouts, cancellation and providers.
//! - **`client`**: The facade that owns all of the above and runs dispatch.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Exponential reconnect backoff with jitter.
pub mod backoff;
/// The realtime client facade.
pub mod client;
/// Connection state machine and supervisor.
pub mod connection;
/// Client error types and runtime error reporting.
pub mod errors;
/// Event emit and subscription fan-out.
pub mod event_bus;
/// Versioned record synchronization.
pub mod record_store;
/// Pattern-based subscription registry.
pub mod registry;
/// Outgoing and provided remote procedure calls.
pub mod rpc_broker;
/// Link establishment.
pub mod transport;

// --- Public API Re-exports ---
pub use client::{LoginResult, RealtimeClient};
pub use connection::{ConnectionState, ConnectionStateListener};
pub use errors::{ClientError, ErrorEvent, RuntimeError, RuntimeErrorHandler};
pub use event_bus::EventHandler;
pub use record_store::{Record, RecordChangeHandler};
pub use registry::{DiscoveryHandler, SubscriptionHandle};
pub use rpc_broker::{RpcCall, RpcCallHandle, RpcProvider, RpcResponse, RpcState};
pub use transport::{Connector, Link, LoopbackConnector, LoopbackPeer};
#[cfg(feature = "ws")]
pub use transport::WsConnector;
