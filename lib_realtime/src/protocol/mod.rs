//! # Wire Protocol Module
//!
//! Text framing for the realtime server protocol. A frame carries one or more
//! messages; each message is a topic, an action and a list of data parts.
//!
//! ## Contained Modules:
//! - **`message`**: `Topic`, `Action` and `Message` with frame encoding/decoding.
//! - **`typed`**: The one-letter type prefix used for event, RPC and patch payloads.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Topics, actions and message framing.
pub mod message;
/// Typed scalar payload encoding.
pub mod typed;

// --- Public API Re-exports ---
pub use message::{decode_frame, has_separator, Action, Message, ParseError, Topic, MESSAGE_SEPARATOR, PART_SEPARATOR};
