//! # Client Errors and Runtime Error Reporting
//!
//! Two kinds of failure leave the client:
//!
//! - **Request-scoped** failures (an RPC, an acknowledged record write, a send
//!   while offline) are returned to the caller as a typed `ClientError`.
//! - **Runtime** failures that have no caller to return to (a malformed inbound
//!   message, a panicking user handler, a server-side error notification) are
//!   wrapped in a `RuntimeError` and handed to the single handler registered on
//!   the `ErrorReporter`. Without a handler they are logged.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::connection::ConnectionState;
use crate::protocol::Topic;

/// Errors returned by client operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("not connected (connection state: {0:?})")]
    NotConnected(ConnectionState),

    #[error("login failed: {event}: {message}")]
    LoginFailed { event: ErrorEvent, message: String },

    #[error("rpc '{name}' timed out")]
    RpcTimeout { name: String },

    #[error("rpc '{name}' was rejected")]
    RpcRejected { name: String },

    #[error("rpc '{name}' failed: {message}")]
    RpcError { name: String, message: String },

    #[error("rpc '{name}' was cancelled")]
    RpcCancelled { name: String },

    #[error("write to record '{record}' (version {version}) was not acknowledged in time")]
    AckTimeout { record: String, version: u64 },

    #[error("write to record '{record}' failed: {message}")]
    WriteFailed { record: String, message: String },

    #[error("path '{path}' cannot be written in record '{record}'")]
    InvalidPath { record: String, path: String },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

/// Classification of runtime errors and login failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorEvent {
    /// The link could not be established or was lost.
    ConnectionError,
    /// The server refused the credentials.
    InvalidAuthData,
    /// The server refused further login attempts.
    TooManyAuthAttempts,
    /// A message was sent before authentication completed.
    NotAuthenticated,
    /// A write acknowledgement did not arrive in time.
    AckTimeout,
    /// An RPC response did not arrive in time.
    ResponseTimeout,
    /// No provider exists for a requested RPC.
    NoRpcProvider,
    /// A record write conflicted with a newer server version.
    VersionExists,
    /// An inbound message could not be decoded.
    MessageParseError,
    /// The server denied a message (permissions).
    MessageDenied,
    /// A message referred to something this client does not know about.
    UnsolicitedMessage,
    /// A user callback panicked during dispatch.
    HandlerException,
    /// Any other server-provided event name.
    Other(String),
}

impl ErrorEvent {
    /// The server's name for this event.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorEvent::ConnectionError => "CONNECTION_ERROR",
            ErrorEvent::InvalidAuthData => "INVALID_AUTH_DATA",
            ErrorEvent::TooManyAuthAttempts => "TOO_MANY_AUTH_ATTEMPTS",
            ErrorEvent::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorEvent::AckTimeout => "ACK_TIMEOUT",
            ErrorEvent::ResponseTimeout => "RESPONSE_TIMEOUT",
            ErrorEvent::NoRpcProvider => "NO_RPC_PROVIDER",
            ErrorEvent::VersionExists => "VERSION_EXISTS",
            ErrorEvent::MessageParseError => "MESSAGE_PARSE_ERROR",
            ErrorEvent::MessageDenied => "MESSAGE_DENIED",
            ErrorEvent::UnsolicitedMessage => "UNSOLICITED_MESSAGE",
            ErrorEvent::HandlerException => "HANDLER_EXCEPTION",
            ErrorEvent::Other(name) => name,
        }
    }

    /// Maps a server event name; unknown names are kept verbatim.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "CONNECTION_ERROR" => ErrorEvent::ConnectionError,
            "INVALID_AUTH_DATA" => ErrorEvent::InvalidAuthData,
            "TOO_MANY_AUTH_ATTEMPTS" => ErrorEvent::TooManyAuthAttempts,
            "NOT_AUTHENTICATED" => ErrorEvent::NotAuthenticated,
            "ACK_TIMEOUT" => ErrorEvent::AckTimeout,
            "RESPONSE_TIMEOUT" => ErrorEvent::ResponseTimeout,
            "NO_RPC_PROVIDER" => ErrorEvent::NoRpcProvider,
            "VERSION_EXISTS" => ErrorEvent::VersionExists,
            "MESSAGE_PARSE_ERROR" => ErrorEvent::MessageParseError,
            "MESSAGE_DENIED" => ErrorEvent::MessageDenied,
            "UNSOLICITED_MESSAGE" => ErrorEvent::UnsolicitedMessage,
            "HANDLER_EXCEPTION" => ErrorEvent::HandlerException,
            other => ErrorEvent::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal, client-level failure. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    topic: Topic,
    event: ErrorEvent,
    message: String,
}

impl RuntimeError {
    /// Creates a runtime error.
    pub fn new(topic: Topic, event: ErrorEvent, message: impl Into<String>) -> Self {
        Self {
            topic,
            event,
            message: message.into(),
        }
    }

    /// The topic the failure belongs to.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// The failure class.
    pub fn event(&self) -> &ErrorEvent {
        &self.event
    }

    /// Human-readable detail.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.topic, self.event, self.message)
    }
}

/// Callback receiving runtime errors.
pub type RuntimeErrorHandler = Arc<dyn Fn(&RuntimeError) + Send + Sync>;

/// Holds the single runtime error handler and delivers errors to it.
#[derive(Default)]
pub struct ErrorReporter {
    handler: Mutex<Option<RuntimeErrorHandler>>,
}

impl ErrorReporter {
    /// Creates a reporter with no handler; errors are logged until one is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the registered handler.
    pub fn set_handler(&self, handler: RuntimeErrorHandler) {
        *self.handler.lock().expect("ErrorReporter lock poisoned") = Some(handler);
    }

    /// Delivers an error to the handler, or logs it when none is registered.
    pub fn report(&self, error: RuntimeError) {
        let handler = self.handler.lock().expect("ErrorReporter lock poisoned").clone();
        match handler {
            Some(h) => {
                log::debug!("Runtime error: {}", error);
                if catch_unwind(AssertUnwindSafe(|| h(&error))).is_err() {
                    log::error!("Runtime error handler panicked while handling: {}", error);
                }
            }
            None => log::error!("Unhandled runtime error: {}", error),
        }
    }

    /// Runs a user callback, converting a panic into a `HandlerException`
    /// report so the caller's dispatch loop keeps going.
    pub(crate) fn guard<F: FnOnce()>(&self, topic: Topic, context: &str, callback: F) -> bool {
        match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(()) => true,
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                self.report(RuntimeError::new(
                    topic,
                    ErrorEvent::HandlerException,
                    format!("{} handler panicked: {}", context, detail),
                ));
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
