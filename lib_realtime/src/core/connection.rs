//! # Connection Supervisor
//!
//! Owns the single active `Link` to the server and the connection state
//! machine:
//!
//! ```text
//! Closed -> Connecting -> AwaitingAuthentication -> Authenticating -> Open
//!              |                    ^                                  |
//!              v                    |                                  v
//!          Reconnecting ------------+---------------------------- (link lost)
//!              |
//!              v  (max consecutive failures)
//!            Error  (terminal until reconnect())
//! ```
//!
//! The supervisor task connects through the configured `Connector`, pumps
//! inbound frames into the client's single dispatch channel, answers
//! connection-topic housekeeping itself, and reconnects with exponential
//! backoff. Once a login has succeeded the stored credentials are re-sent on
//! every new link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::configs::ClientConfig;
use crate::core::backoff::Backoff;
use crate::core::errors::{ClientError, ErrorEvent, ErrorReporter, RuntimeError};
use crate::core::transport::{Connector, Link};
use crate::protocol::{decode_frame, Action, Message, Topic};

/// Lifecycle states of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Closed,
    /// First connection attempt in progress.
    Connecting,
    /// Link is up; waiting for credentials.
    AwaitingAuthentication,
    /// Credentials sent; waiting for the verdict.
    Authenticating,
    /// Authenticated; application traffic may flow.
    Open,
    /// Link lost or attempt failed; a retry is scheduled.
    Reconnecting,
    /// Gave up, or login was refused. Needs an explicit reconnect.
    Error,
}

/// Callback invoked with `(old, new)` on every state change.
pub type ConnectionStateListener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Builds the `A|REQ|{credentials}` message.
pub(crate) fn auth_message(credentials: &Value) -> Message {
    Message::new(Topic::Auth, Action::Request, [credentials.to_string()])
}

pub struct Connection {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    reporter: Arc<ErrorReporter>,
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<Vec<ConnectionStateListener>>,
    // (link generation, writer). Cleared when that generation's link ends.
    outbound: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    link_generation: AtomicU64,
    inbound: mpsc::UnboundedSender<Message>,
    credentials: Mutex<Option<Value>>,
    relogin: AtomicBool,
    // Set once the current link reaches `Open`.
    link_opened: AtomicBool,
    supervisor: Mutex<Option<CancellationToken>>,
}

impl Connection {
    /// Creates a closed connection. Decoded non-connection messages are
    /// forwarded to `inbound`.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        inbound: mpsc::UnboundedSender<Message>,
        reporter: Arc<ErrorReporter>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Arc::new(Self {
            config,
            connector,
            reporter,
            state,
            listeners: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
            link_generation: AtomicU64::new(0),
            inbound,
            credentials: Mutex::new(None),
            relogin: AtomicBool::new(false),
            link_opened: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Registers a listener. Listeners run in registration order.
    pub fn add_listener(&self, listener: ConnectionStateListener) {
        self.listeners.lock().expect("Connection lock poisoned").push(listener);
    }

    pub(crate) fn set_state(&self, new: ConnectionState) {
        let old = self.state.send_replace(new);
        if new == ConnectionState::Open {
            self.link_opened.store(true, Ordering::SeqCst);
        }
        if old == new {
            return;
        }
        log::info!("Connection state: {:?} -> {:?}", old, new);
        let listeners = self.listeners.lock().expect("Connection lock poisoned").clone();
        for listener in listeners {
            self.reporter
                .guard(Topic::Connection, "connection state", || listener(old, new));
        }
    }

    /// Starts the supervisor unless one is already running. Must be called
    /// from within a Tokio runtime.
    pub fn connect(self: &Arc<Self>) {
        let mut slot = self.supervisor.lock().expect("Connection lock poisoned");
        if let Some(token) = slot.as_ref() {
            if !token.is_cancelled() {
                log::debug!("Connection supervisor already running");
                return;
            }
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        self.set_state(ConnectionState::Connecting);
        tokio::spawn(Arc::clone(self).supervise(token));
    }

    /// Restarts a connection that ended in `Error` or `Closed`.
    pub fn reconnect(self: &Arc<Self>) {
        match self.state() {
            ConnectionState::Error | ConnectionState::Closed => self.connect(),
            other => log::debug!("reconnect() ignored in state {:?}", other),
        }
    }

    /// Stops the supervisor, drops the link and forgets the credentials.
    pub fn close(&self) {
        self.stop_supervisor();
        self.relogin.store(false, Ordering::SeqCst);
        *self.credentials.lock().expect("Connection lock poisoned") = None;
        self.set_state(ConnectionState::Closed);
    }

    /// Stops the supervisor and parks the connection in `Error`.
    pub(crate) fn fail(&self, reason: &str) {
        log::error!("Connection failed: {}", reason);
        self.stop_supervisor();
        self.relogin.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Error);
    }

    fn stop_supervisor(&self) {
        if let Some(token) = self.supervisor.lock().expect("Connection lock poisoned").take() {
            token.cancel();
        }
        *self.outbound.lock().expect("Connection lock poisoned") = None;
    }

    pub(crate) fn set_credentials(&self, credentials: Value) {
        *self.credentials.lock().expect("Connection lock poisoned") = Some(credentials);
    }

    /// After the first accepted login, new links re-authenticate by themselves.
    pub(crate) fn enable_relogin(&self) {
        self.relogin.store(true, Ordering::SeqCst);
    }

    /// Sends the credentials and moves to `Authenticating`.
    pub(crate) fn send_auth(&self, credentials: &Value) -> Result<(), ClientError> {
        self.set_state(ConnectionState::Authenticating);
        self.write(&auth_message(credentials))
    }

    /// Sends an application message. Fails with `NotConnected` unless `Open`.
    pub fn send(&self, message: &Message) -> Result<(), ClientError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(ClientError::NotConnected(state));
        }
        self.write(message)
    }

    /// Sends when `Open`; otherwise leaves it to the replay that follows the
    /// next successful login. Returns whether the message went out.
    pub(crate) fn send_when_open(&self, message: &Message) -> bool {
        match self.send(message) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("Deferred until open: {}", message);
                false
            }
        }
    }

    /// Writes to the current link regardless of state.
    fn write(&self, message: &Message) -> Result<(), ClientError> {
        message
            .check_parts()
            .map_err(|e| ClientError::Serialization(format!("{}: {}", message.action, e)))?;
        let outbound = self.outbound.lock().expect("Connection lock poisoned");
        match outbound.as_ref() {
            Some((_, tx)) => {
                log::trace!("Sending: {}", message);
                tx.send(message.encode())
                    .map_err(|_| ClientError::NotConnected(self.state()))
            }
            None => Err(ClientError::NotConnected(self.state())),
        }
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        let endpoint = self.config.endpoint.clone();
        let mut backoff = Backoff::new(
            self.config.reconnect_base_delay(),
            self.config.reconnect_max_delay(),
            self.config.reconnect_jitter,
        );
        let mut failures: u32 = 0;

        loop {
            log::info!("Connecting to {}", endpoint);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.connector.connect(&endpoint) => result,
            };

            match attempt {
                Ok(link) => {
                    let opened = self.run_link(link, &cancel).await;
                    if cancel.is_cancelled() {
                        return;
                    }
                    if opened {
                        failures = 0;
                        backoff.reset();
                        log::warn!("Link to {} lost. Reconnecting...", endpoint);
                    } else {
                        // A link that never got past login does not count as recovered.
                        failures += 1;
                        log::warn!(
                            "Link to {} closed before login completed ({}/{})",
                            endpoint,
                            failures,
                            self.config.max_reconnect_attempts
                        );
                    }
                }
                Err(e) => {
                    failures += 1;
                    log::error!(
                        "Failed to connect to {} ({}/{}): {}",
                        endpoint,
                        failures,
                        self.config.max_reconnect_attempts,
                        e
                    );
                }
            }

            if failures >= self.config.max_reconnect_attempts {
                cancel.cancel();
                self.set_state(ConnectionState::Error);
                self.reporter.report(RuntimeError::new(
                    Topic::Connection,
                    ErrorEvent::ConnectionError,
                    format!("giving up on {} after {} attempts", endpoint, failures),
                ));
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff.next_delay();
            log::info!("Retrying in {}ms", delay.as_millis());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Pumps one link until it ends. Returns whether it reached `Open`.
    async fn run_link(&self, link: Link, cancel: &CancellationToken) -> bool {
        let Link { outbound, mut inbound } = link;
        self.link_opened.store(false, Ordering::SeqCst);
        let generation = self.link_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.outbound.lock().expect("Connection lock poisoned") = Some((generation, outbound));

        let stored = self.credentials.lock().expect("Connection lock poisoned").clone();
        match stored {
            Some(credentials) if self.relogin.load(Ordering::SeqCst) => {
                log::info!("Link re-established; re-sending credentials");
                if let Err(e) = self.send_auth(&credentials) {
                    log::error!("Failed to re-send credentials: {}", e);
                }
            }
            _ => self.set_state(ConnectionState::AwaitingAuthentication),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => break,
                },
            }
        }

        let mut slot = self.outbound.lock().expect("Connection lock poisoned");
        if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
            *slot = None;
        }
        self.link_opened.load(Ordering::SeqCst)
    }

    fn handle_frame(&self, frame: &str) {
        for decoded in decode_frame(frame) {
            match decoded {
                Ok(message) if message.topic == Topic::Connection => self.handle_connection_message(&message),
                Ok(message) => {
                    if self.inbound.send(message).is_err() {
                        log::debug!("Dispatcher gone; dropping inbound message");
                    }
                }
                Err(e) => self.reporter.report(RuntimeError::new(
                    Topic::Connection,
                    ErrorEvent::MessageParseError,
                    e.to_string(),
                )),
            }
        }
    }

    fn handle_connection_message(&self, message: &Message) {
        let reply = match message.action {
            Action::Ping => Some(Message::new(Topic::Connection, Action::Pong, Vec::<String>::new())),
            Action::Challenge => Some(Message::new(
                Topic::Connection,
                Action::ChallengeResponse,
                [self.config.endpoint.clone()],
            )),
            Action::Error => {
                self.reporter.report(RuntimeError::new(
                    Topic::Connection,
                    ErrorEvent::from_wire(message.part(0)),
                    message.part(1).to_string(),
                ));
                None
            }
            _ => {
                log::debug!("Ignoring connection message {}", message);
                None
            }
        };
        if let Some(reply) = reply {
            if let Err(e) = self.write(&reply) {
                log::warn!("Failed to answer {}: {}", message, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::transport::LoopbackConnector;

    /// An `Open` connection without a supervisor. Returns the frames the
    /// connection writes.
    pub(crate) fn open_connection(
        reporter: Arc<ErrorReporter>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
        let (connector, _accepted) = LoopbackConnector::new();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(ClientConfig::default(), Arc::new(connector), inbound_tx, reporter);
        let (tx, rx) = mpsc::unbounded_channel();
        *conn.outbound.lock().unwrap() = Some((1, tx));
        conn.set_state(ConnectionState::Open);
        (conn, rx)
    }

    /// Decodes every frame written so far.
    pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.extend(decode_frame(&frame).into_iter().filter_map(Result::ok));
        }
        out
    }
}
