//! # Client Facade
//!
//! `RealtimeClient` owns the connection, the record store, the event bus and
//! the RPC broker, and runs the single dispatch task that feeds them. Every
//! inbound application message passes through that one task in arrival order,
//! so no two messages for the same record or RPC are ever processed
//! concurrently.
//!
//! ```no_run
//! use lib_realtime::configs::ClientConfig;
//! use lib_realtime::core::client::RealtimeClient;
//! use serde_json::json;
//!
//! # async fn run() {
//! let client = RealtimeClient::new(ClientConfig::new("localhost:6020"));
//! let result = client.login(&json!({"username": "Publisher"})).await;
//! if result.logged_in() {
//!     client.event().emit("event/hello", json!(["hi", 1])).ok();
//! }
//! client.close();
//! # }
//! ```

use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::configs::ClientConfig;
use crate::core::connection::{Connection, ConnectionState};
use crate::core::errors::{ClientError, ErrorEvent, ErrorReporter, RuntimeError};
use crate::core::event_bus::EventBus;
use crate::core::record_store::RecordStore;
use crate::core::rpc_broker::RpcBroker;
use crate::core::transport::Connector;
use crate::protocol::{typed, Action, Message, Topic};

/// Outcome of `RealtimeClient::login`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginResult {
    logged_in: bool,
    error_event: Option<ErrorEvent>,
    error_message: Option<String>,
    data: Option<Value>,
}

impl LoginResult {
    fn success(data: Option<Value>) -> Self {
        Self {
            logged_in: true,
            error_event: None,
            error_message: None,
            data,
        }
    }

    fn failure(event: ErrorEvent, message: impl Into<String>) -> Self {
        Self {
            logged_in: false,
            error_event: Some(event),
            error_message: Some(message.into()),
            data: None,
        }
    }

    pub fn logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn error_event(&self) -> Option<&ErrorEvent> {
        self.error_event.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Data the server attached to a successful login, if any.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Converts into a `Result`, for callers that prefer `?`.
    pub fn into_result(self) -> Result<Option<Value>, ClientError> {
        if self.logged_in {
            return Ok(self.data);
        }
        Err(ClientError::LoginFailed {
            event: self.error_event.unwrap_or(ErrorEvent::ConnectionError),
            message: self.error_message.unwrap_or_default(),
        })
    }
}

struct ClientInner {
    config: ClientConfig,
    reporter: Arc<ErrorReporter>,
    connection: Arc<Connection>,
    records: Arc<RecordStore>,
    events: Arc<EventBus>,
    rpcs: Arc<RpcBroker>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    login_slot: Mutex<Option<oneshot::Sender<LoginResult>>>,
    shutdown: CancellationToken,
}

/// The client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// A client that connects over WebSockets.
    #[cfg(feature = "ws")]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(crate::core::transport::WsConnector))
    }

    /// A client that establishes links through `connector`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let reporter = Arc::new(ErrorReporter::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(config.clone(), connector, inbound_tx, Arc::clone(&reporter));

        let records = Arc::new(RecordStore::new(
            Arc::clone(&connection),
            Arc::clone(&reporter),
            config.record_ack_timeout(),
        ));
        let events = Arc::new(EventBus::new(Arc::clone(&connection), Arc::clone(&reporter)));
        let rpcs = Arc::new(RpcBroker::new(
            Arc::clone(&connection),
            Arc::clone(&reporter),
            config.rpc_response_timeout(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                config,
                reporter,
                connection,
                records,
                events,
                rpcs,
                inbound: Mutex::new(Some(inbound_rx)),
                login_slot: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connects if needed and authenticates with `credentials`. Never panics:
    /// every failure, including a connection that never comes up within the
    /// login timeout, is reported through the returned `LoginResult`.
    pub async fn login<C: Serialize + ?Sized>(&self, credentials: &C) -> LoginResult {
        let connection = &self.inner.connection;
        if connection.is_open() {
            return LoginResult::success(None);
        }
        let credentials = match serde_json::to_value(credentials) {
            Ok(v) => v,
            Err(e) => return LoginResult::failure(ErrorEvent::InvalidAuthData, e.to_string()),
        };

        self.ensure_dispatcher();
        let (tx, rx) = oneshot::channel();
        *self.inner.login_slot.lock().expect("Client lock poisoned") = Some(tx);

        connection.set_credentials(credentials.clone());
        let mut state = connection.watch_state();
        connection.connect();

        let attempt = async {
            let reached = state
                .wait_for(|s| {
                    matches!(
                        s,
                        ConnectionState::AwaitingAuthentication
                            | ConnectionState::Authenticating
                            | ConnectionState::Open
                            | ConnectionState::Error
                    )
                })
                .await
                .map(|s| *s);

            match reached {
                Ok(ConnectionState::AwaitingAuthentication) => {
                    if let Err(e) = connection.send_auth(&credentials) {
                        return LoginResult::failure(ErrorEvent::ConnectionError, e.to_string());
                    }
                }
                Ok(ConnectionState::Error) => {
                    return LoginResult::failure(ErrorEvent::ConnectionError, "connection failed");
                }
                // Credentials already in flight, or already answered.
                Ok(_) => {}
                Err(_) => return LoginResult::failure(ErrorEvent::ConnectionError, "connection dropped"),
            }

            rx.await
                .unwrap_or_else(|_| LoginResult::failure(ErrorEvent::ConnectionError, "login superseded"))
        };

        let result = match tokio::time::timeout(self.inner.config.login_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => LoginResult::failure(
                ErrorEvent::ConnectionError,
                format!("no login answer within {}ms", self.inner.config.login_timeout_ms),
            ),
        };

        if result.logged_in {
            log::info!("Logged in to {}", self.inner.config.endpoint);
        } else {
            self.inner.login_slot.lock().expect("Client lock poisoned").take();
            connection.fail(result.error_message().unwrap_or("login failed"));
        }
        result
    }

    fn ensure_dispatcher(&self) {
        let Some(rx) = self.inner.inbound.lock().expect("Client lock poisoned").take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(dispatch(weak, rx, shutdown));
    }

    /// Replaces the runtime error handler.
    pub fn set_runtime_error_handler<F>(&self, handler: F)
    where
        F: Fn(&RuntimeError) + Send + Sync + 'static,
    {
        self.inner.reporter.set_handler(Arc::new(handler));
    }

    /// Adds a connection-state listener called with `(old, new)`.
    pub fn add_connection_change_listener<F>(&self, listener: F)
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.inner.connection.add_listener(Arc::new(listener));
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    /// Restarts a connection that gave up. Stored credentials are re-sent
    /// only after a previous login succeeded; otherwise call `login` again.
    pub fn reconnect(&self) {
        self.inner.connection.reconnect();
    }

    pub fn record(&self) -> &Arc<RecordStore> {
        &self.inner.records
    }

    pub fn event(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn rpc(&self) -> &Arc<RpcBroker> {
        &self.inner.rpcs
    }

    /// Disconnects and drops every record, subscription, provider and pending
    /// request. The client can log in again afterwards.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl ClientInner {
    fn close(&self) {
        if let Some(slot) = self.login_slot.lock().expect("Client lock poisoned").take() {
            let _ = slot.send(LoginResult::failure(ErrorEvent::ConnectionError, "client closed"));
        }
        self.connection.close();
        self.records.teardown();
        self.events.teardown();
        self.rpcs.teardown();
    }

    fn route(&self, message: &Message) {
        match message.topic {
            Topic::Auth => self.handle_auth(message),
            Topic::Event => self.events.handle(message),
            Topic::Record => self.records.handle(message),
            Topic::Rpc => self.rpcs.handle(message),
            Topic::Error => self.reporter.report(RuntimeError::new(
                Topic::Error,
                ErrorEvent::from_wire(message.part(0)),
                message.part(1).to_string(),
            )),
            Topic::Connection => log::debug!("Connection message reached dispatcher: {}", message),
        }
    }

    fn handle_auth(&self, message: &Message) {
        let state = self.connection.state();
        if matches!(state, ConnectionState::Error | ConnectionState::Closed) {
            log::debug!("Auth answer in state {:?} ignored: {}", state, message);
            return;
        }
        let slot = self.login_slot.lock().expect("Client lock poisoned").take();
        match message.action {
            Action::Ack => {
                let data = message.data.first().and_then(|raw| typed::decode(raw).ok());
                self.connection.set_state(ConnectionState::Open);
                self.connection.enable_relogin();
                self.records.replay();
                self.events.replay();
                self.rpcs.replay();
                match slot {
                    Some(slot) => {
                        let _ = slot.send(LoginResult::success(data));
                    }
                    None => log::info!("Re-authenticated after reconnect"),
                }
            }
            Action::Error => {
                let event = ErrorEvent::from_wire(message.part(0));
                let text = message.part(1).to_string();
                match slot {
                    Some(slot) => {
                        let _ = slot.send(LoginResult::failure(event, text));
                    }
                    None => {
                        self.connection.fail("re-authentication refused");
                        self.reporter.report(RuntimeError::new(Topic::Auth, event, text));
                    }
                }
            }
            _ => {
                if let Some(slot) = slot {
                    *self.login_slot.lock().expect("Client lock poisoned") = Some(slot);
                }
                self.reporter.report(RuntimeError::new(
                    Topic::Auth,
                    ErrorEvent::UnsolicitedMessage,
                    message.to_string(),
                ));
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.connection.close();
    }
}

async fn dispatch(inner: Weak<ClientInner>, mut inbound: mpsc::UnboundedReceiver<Message>, shutdown: CancellationToken) {
    log::debug!("Dispatcher started");
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };
        let Some(client) = inner.upgrade() else {
            break;
        };
        log::trace!("Dispatching {}", message);
        client.route(&message);
    }
    log::debug!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rpc_broker::RpcResponse;
    use crate::core::transport::{LoopbackConnector, LoopbackPeer};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> ClientConfig {
        ClientConfig {
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 20,
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 2,
            login_timeout_ms: 500,
            ..ClientConfig::new("loop:6020")
        }
    }

    async fn accept_login(peer: &mut LoopbackPeer) {
        let auth = peer.recv().await.unwrap();
        assert_eq!((auth.topic, auth.action), (Topic::Auth, Action::Request));
        peer.send(&Message::new(Topic::Auth, Action::Ack, ["O{\"id\":7}"]));
    }

    #[tokio::test]
    async fn test_login_success_opens_connection() {
        let (connector, mut accepted) = LoopbackConnector::new();
        let client = RealtimeClient::with_connector(config(), Arc::new(connector));

        let login = tokio::spawn({
            let client = client.clone();
            async move { client.login(&json!({"username": "u"})).await }
        });
        let mut peer = accepted.recv().await.unwrap();
        accept_login(&mut peer).await;

        let result = login.await.unwrap();
        assert!(result.logged_in());
        assert_eq!(result.data(), Some(&json!({"id": 7})));
        assert_eq!(client.connection_state(), ConnectionState::Open);

        // Already open: no second handshake.
        assert!(client.login(&json!({"username": "u"})).await.logged_in());
        client.close();
    }

    #[tokio::test]
    async fn test_refused_login_leaves_error_state() {
        let (connector, mut accepted) = LoopbackConnector::new();
        let client = RealtimeClient::with_connector(config(), Arc::new(connector));

        let login = tokio::spawn({
            let client = client.clone();
            async move { client.login(&json!({"username": "bad"})).await }
        });
        let mut peer = accepted.recv().await.unwrap();
        peer.recv().await.unwrap();
        peer.send(&Message::new(Topic::Auth, Action::Error, ["INVALID_AUTH_DATA", "Sno such user"]));

        let result = login.await.unwrap();
        assert!(!result.logged_in());
        assert_eq!(result.error_event(), Some(&ErrorEvent::InvalidAuthData));
        assert_eq!(client.connection_state(), ConnectionState::Error);
        assert!(matches!(result.into_result(), Err(ClientError::LoginFailed { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_login() {
        let (connector, _accepted) = LoopbackConnector::new();
        connector.set_refusing(true);
        let client = RealtimeClient::with_connector(config(), Arc::new(connector));

        let result = tokio::time::timeout(Duration::from_secs(5), client.login(&json!({})))
            .await
            .unwrap();
        assert!(!result.logged_in());
        assert_eq!(result.error_event(), Some(&ErrorEvent::ConnectionError));
        assert_eq!(client.connection_state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_late_auth_ack_does_not_reopen() {
        let (connector, _accepted) = LoopbackConnector::new();
        let client = RealtimeClient::with_connector(config(), Arc::new(connector));
        let ack = Message::new(Topic::Auth, Action::Ack, Vec::<String>::new());

        client.inner.connection.fail("no login answer");
        client.inner.route(&ack);
        assert_eq!(client.connection_state(), ConnectionState::Error);

        client.close();
        client.inner.route(&ack);
        assert_eq!(client.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_deferred_subscriptions_replayed_on_login() {
        let (connector, mut accepted) = LoopbackConnector::new();
        let client = RealtimeClient::with_connector(config(), Arc::new(connector));
        client.event().listen("event/.*", Arc::new(|_: &str, _: &Value| {})).unwrap();
        client.rpc().provide("add-numbers", Arc::new(|_: &str, _: Value, r: RpcResponse| {
            r.send(Value::Null);
        }));

        let login = tokio::spawn({
            let client = client.clone();
            async move { client.login(&json!({"username": "u"})).await }
        });
        let mut peer = accepted.recv().await.unwrap();
        accept_login(&mut peer).await;
        assert!(login.await.unwrap().logged_in());

        let mut replayed = vec![peer.recv().await.unwrap(), peer.recv().await.unwrap()];
        replayed.sort_by_key(|m| m.topic.as_str());
        assert_eq!(replayed[0], Message::new(Topic::Event, Action::Subscribe, ["event/.*"]));
        assert_eq!(replayed[1], Message::new(Topic::Rpc, Action::Subscribe, ["add-numbers"]));
        client.close();
    }
}
