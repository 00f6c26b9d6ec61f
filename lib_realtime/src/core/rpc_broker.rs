//! # RPC Broker
//!
//! Both sides of remote procedure calls.
//!
//! ## Caller
//! Each request gets a fresh correlation id and a pending entry holding a
//! oneshot responder. The entry is registered before the request is written,
//! so a fast response can never miss it, and the response deadline starts at
//! that point whether or not anyone awaits the call. Whatever settles the call
//! first (response, reject, error, timeout, cancel) removes the entry;
//! everything after that finds nothing and is ignored. Dropping an unsettled
//! `RpcCall` cancels it.
//!
//! ## Provider
//! An inbound request for a provided name is acknowledged, then handed to the
//! provider together with an `RpcResponse`. The response may be completed
//! later from any task; only the first `send` / `reject` / `error` goes out.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::core::connection::Connection;
use crate::core::errors::{ClientError, ErrorEvent, ErrorReporter, RuntimeError};
use crate::protocol::{typed, Action, Message, Topic};

/// Lifecycle of an outgoing request. Everything except `Pending` and
/// `Accepted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    Pending,
    Accepted,
    Rejected,
    Completed,
    TimedOut,
    Error,
    Cancelled,
}

impl RpcState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RpcState::Pending | RpcState::Accepted)
    }
}

/// Provider callback: `(rpc name, payload, response)`.
pub type RpcProvider = dyn Fn(&str, Value, RpcResponse) + Send + Sync;

type Responder = oneshot::Sender<Result<Value, ClientError>>;

struct PendingCall {
    name: String,
    state: Arc<Mutex<RpcState>>,
    responder: Responder,
    deadline: AbortHandle,
}

pub struct RpcBroker {
    connection: Arc<Connection>,
    reporter: Arc<ErrorReporter>,
    response_timeout: Duration,
    pending: Mutex<HashMap<String, PendingCall>>,
    providers: Mutex<HashMap<String, Arc<RpcProvider>>>,
}

/// An outstanding request. Await it with `result`, or stop it with `cancel`.
pub struct RpcCall {
    handle: RpcCallHandle,
    state: Arc<Mutex<RpcState>>,
    rx: oneshot::Receiver<Result<Value, ClientError>>,
}

/// Cancels a call from another task while its owner awaits the result.
#[derive(Clone)]
pub struct RpcCallHandle {
    id: String,
    name: String,
    broker: Arc<RpcBroker>,
}

impl RpcCallHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Settles the call as `Cancelled`. Returns false if it was already
    /// settled.
    pub fn cancel(&self) -> bool {
        let cancelled = self.broker.settle(
            &self.id,
            RpcState::Cancelled,
            Err(ClientError::RpcCancelled { name: self.name.clone() }),
        );
        if cancelled {
            log::debug!("Cancelled rpc '{}' ({})", self.name, self.id);
        }
        cancelled
    }
}

impl RpcCall {
    /// Correlation id of this call.
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn state(&self) -> RpcState {
        *self.state.lock().expect("RpcCall lock poisoned")
    }

    pub fn handle(&self) -> RpcCallHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Waits for the outcome. The response deadline was armed when the
    /// request was sent, so this never waits longer than that.
    pub async fn result(mut self) -> Result<Value, ClientError> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // The broker went away with the call still pending.
            Err(_) => Err(ClientError::RpcCancelled {
                name: self.handle.name.clone(),
            }),
        }
    }
}

impl Drop for RpcCall {
    fn drop(&mut self) {
        if !self.state().is_terminal() && self.handle.cancel() {
            log::debug!("rpc '{}' ({}) dropped before it settled", self.handle.name, self.handle.id);
        }
    }
}

impl fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCall")
            .field("id", &self.handle.id)
            .field("name", &self.handle.name)
            .field("state", &self.state())
            .finish()
    }
}

/// The provider's side of one inbound request.
#[derive(Clone)]
pub struct RpcResponse {
    inner: Arc<ResponseInner>,
}

struct ResponseInner {
    connection: Arc<Connection>,
    name: String,
    correlation_id: String,
    resolved: AtomicBool,
}

impl RpcResponse {
    fn new(connection: Arc<Connection>, name: &str, correlation_id: &str) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                connection,
                name: name.to_string(),
                correlation_id: correlation_id.to_string(),
                resolved: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::SeqCst)
    }

    /// Answers with `value`. Returns false if the request was already resolved.
    pub fn send(&self, value: Value) -> bool {
        self.resolve(Message::new(
            Topic::Rpc,
            Action::Response,
            [self.inner.name.clone(), self.inner.correlation_id.clone(), typed::encode(&value)],
        ))
    }

    /// Declines the request so the server can route it elsewhere.
    pub fn reject(&self) -> bool {
        self.resolve(Message::new(
            Topic::Rpc,
            Action::Reject,
            [self.inner.name.as_str(), self.inner.correlation_id.as_str()],
        ))
    }

    pub fn error(&self, message: &str) -> bool {
        self.resolve(Message::new(
            Topic::Rpc,
            Action::Error,
            [message, self.inner.name.as_str(), self.inner.correlation_id.as_str()],
        ))
    }

    fn resolve(&self, message: Message) -> bool {
        if self.inner.resolved.swap(true, Ordering::SeqCst) {
            log::debug!(
                "rpc '{}' ({}) already resolved; ignoring {}",
                self.inner.name,
                self.inner.correlation_id,
                message.action
            );
            return false;
        }
        if let Err(e) = self.inner.connection.send(&message) {
            log::warn!("Could not answer rpc '{}': {}", self.inner.name, e);
        }
        true
    }
}

impl RpcBroker {
    pub fn new(connection: Arc<Connection>, reporter: Arc<ErrorReporter>, response_timeout: Duration) -> Self {
        Self {
            connection,
            reporter,
            response_timeout,
            pending: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Sends a request and returns the in-flight call.
    pub fn start_request(self: &Arc<Self>, name: &str, payload: Value) -> Result<RpcCall, ClientError> {
        let id = Uuid::new_v4().simple().to_string();
        let state = Arc::new(Mutex::new(RpcState::Pending));
        let (tx, rx) = oneshot::channel();
        let deadline = tokio::spawn(expire(
            Arc::downgrade(self),
            id.clone(),
            name.to_string(),
            self.response_timeout,
        ))
        .abort_handle();

        self.pending.lock().expect("RpcBroker lock poisoned").insert(
            id.clone(),
            PendingCall {
                name: name.to_string(),
                state: Arc::clone(&state),
                responder: tx,
                deadline,
            },
        );

        let message = Message::new(
            Topic::Rpc,
            Action::Request,
            [name.to_string(), id.clone(), typed::encode(&payload)],
        );
        if let Err(e) = self.connection.send(&message) {
            if let Some(call) = self.pending.lock().expect("RpcBroker lock poisoned").remove(&id) {
                call.deadline.abort();
            }
            return Err(e);
        }
        log::debug!("rpc '{}' requested ({})", name, id);

        Ok(RpcCall {
            handle: RpcCallHandle {
                id,
                name: name.to_string(),
                broker: Arc::clone(self),
            },
            state,
            rx,
        })
    }

    /// Sends a request and waits for its outcome.
    pub async fn request(self: &Arc<Self>, name: &str, payload: Value) -> Result<Value, ClientError> {
        self.start_request(name, payload)?.result().await
    }

    /// Registers the provider for `name`, replacing any previous one.
    pub fn provide(&self, name: &str, provider: Arc<RpcProvider>) {
        let previous = self
            .providers
            .lock()
            .expect("RpcBroker lock poisoned")
            .insert(name.to_string(), provider);
        if previous.is_some() {
            log::warn!("Replacing provider for rpc '{}'", name);
            return;
        }
        self.connection
            .send_when_open(&Message::new(Topic::Rpc, Action::Subscribe, [name]));
    }

    pub fn unprovide(&self, name: &str) {
        let removed = self.providers.lock().expect("RpcBroker lock poisoned").remove(name);
        if removed.is_some() {
            self.connection
                .send_when_open(&Message::new(Topic::Rpc, Action::Unsubscribe, [name]));
        }
    }

    /// Removes the pending entry for `id` and delivers `outcome`. Returns false
    /// if the call had already been settled.
    fn settle(&self, id: &str, state: RpcState, outcome: Result<Value, ClientError>) -> bool {
        let Some(call) = self.pending.lock().expect("RpcBroker lock poisoned").remove(id) else {
            return false;
        };
        call.deadline.abort();
        *call.state.lock().expect("RpcCall lock poisoned") = state;
        let _ = call.responder.send(outcome);
        true
    }

    fn pending_name(&self, id: &str) -> Option<String> {
        self.pending
            .lock()
            .expect("RpcBroker lock poisoned")
            .get(id)
            .map(|call| call.name.clone())
    }

    pub(crate) fn handle(&self, message: &Message) {
        match message.action {
            Action::Request => self.serve(message),
            Action::Ack if message.part(0) == Action::Request.as_str() => {
                let id = message.part(2);
                if let Some(call) = self.pending.lock().expect("RpcBroker lock poisoned").get(id) {
                    *call.state.lock().expect("RpcCall lock poisoned") = RpcState::Accepted;
                }
            }
            Action::Ack => log::debug!("Rpc ack: {}", message),
            Action::Response => {
                let (name, id) = (message.part(0), message.part(1));
                let outcome = match message.data.get(2) {
                    None => Ok(Value::Null),
                    Some(raw) => typed::decode(raw).map_err(|e| ClientError::RpcError {
                        name: name.to_string(),
                        message: e.to_string(),
                    }),
                };
                let state = if outcome.is_ok() { RpcState::Completed } else { RpcState::Error };
                if !self.settle(id, state, outcome) {
                    log::debug!("Response for unknown rpc id {} ignored", id);
                }
            }
            Action::Reject => {
                let (name, id) = (message.part(0), message.part(1));
                let rejected = Err(ClientError::RpcRejected { name: name.to_string() });
                if !self.settle(id, RpcState::Rejected, rejected) {
                    log::debug!("Reject for unknown rpc id {} ignored", id);
                }
            }
            Action::Error => {
                let (error, name, id) = (message.part(0), message.part(1), message.part(2));
                let known = self.pending_name(id).is_some();
                if known {
                    self.settle(
                        id,
                        RpcState::Error,
                        Err(ClientError::RpcError {
                            name: name.to_string(),
                            message: error.to_string(),
                        }),
                    );
                } else {
                    self.reporter.report(RuntimeError::new(
                        Topic::Rpc,
                        ErrorEvent::from_wire(error),
                        format!("rpc '{}': {}", name, message.data.get(1..).map(|r| r.join(" ")).unwrap_or_default()),
                    ));
                }
            }
            _ => self.reporter.report(RuntimeError::new(
                Topic::Rpc,
                ErrorEvent::UnsolicitedMessage,
                message.to_string(),
            )),
        }
    }

    // P|REQ|name|cid|payload
    fn serve(&self, message: &Message) {
        let (name, id) = (message.part(0), message.part(1));
        let provider = self.providers.lock().expect("RpcBroker lock poisoned").get(name).cloned();
        let response = RpcResponse::new(Arc::clone(&self.connection), name, id);

        let Some(provider) = provider else {
            log::warn!("No provider for rpc '{}'; rejecting", name);
            response.reject();
            return;
        };

        let payload = match message.data.get(2) {
            None => Value::Null,
            Some(raw) => match typed::decode(raw) {
                Ok(v) => v,
                Err(e) => {
                    self.reporter.report(RuntimeError::new(
                        Topic::Rpc,
                        ErrorEvent::MessageParseError,
                        format!("rpc '{}': {}", name, e),
                    ));
                    response.error(ErrorEvent::MessageParseError.as_str());
                    return;
                }
            },
        };

        let accept = Message::new(Topic::Rpc, Action::Ack, [Action::Request.as_str(), name, id]);
        if let Err(e) = self.connection.send(&accept) {
            log::warn!("Could not accept rpc '{}': {}", name, e);
        }

        let context = format!("rpc '{}'", name);
        let handed = response.clone();
        if !self.reporter.guard(Topic::Rpc, &context, || provider(name, payload, handed)) {
            response.error(ErrorEvent::HandlerException.as_str());
        }
    }

    /// Re-registers every provider after a login.
    pub(crate) fn replay(&self) {
        let names: Vec<String> = self.providers.lock().expect("RpcBroker lock poisoned").keys().cloned().collect();
        for name in names {
            self.connection
                .send_when_open(&Message::new(Topic::Rpc, Action::Subscribe, [name]));
        }
    }

    pub(crate) fn teardown(&self) {
        let pending: Vec<(String, PendingCall)> = self.pending.lock().expect("RpcBroker lock poisoned").drain().collect();
        for (_, call) in pending {
            call.deadline.abort();
            *call.state.lock().expect("RpcCall lock poisoned") = RpcState::Cancelled;
            let _ = call.responder.send(Err(ClientError::RpcCancelled { name: call.name }));
        }
        self.providers.lock().expect("RpcBroker lock poisoned").clear();
    }
}

/// Times out call `id` once `after` has elapsed, unless it settled first.
async fn expire(broker: Weak<RpcBroker>, id: String, name: String, after: Duration) {
    tokio::time::sleep(after).await;
    let Some(broker) = broker.upgrade() else {
        return;
    };
    let timed_out = broker.settle(&id, RpcState::TimedOut, Err(ClientError::RpcTimeout { name: name.clone() }));
    if timed_out {
        log::warn!("rpc '{}' ({}) timed out", name, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::test_support::{drain, open_connection};
    use crate::protocol::MESSAGE_SEPARATOR;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn broker(timeout: Duration) -> (Arc<RpcBroker>, mpsc::UnboundedReceiver<String>, Arc<Mutex<Vec<RuntimeError>>>) {
        let reporter = Arc::new(ErrorReporter::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        reporter.set_handler(Arc::new(move |e: &RuntimeError| sink.lock().unwrap().push(e.clone())));
        let (conn, wire) = open_connection(Arc::clone(&reporter));
        (Arc::new(RpcBroker::new(conn, reporter, timeout)), wire, errors)
    }

    fn rpc(action: Action, parts: &[&str]) -> Message {
        Message::new(Topic::Rpc, action, parts.iter().copied())
    }

    async fn next_sent(wire: &mut mpsc::UnboundedReceiver<String>) -> Message {
        let frame = wire.recv().await.unwrap();
        Message::decode(frame.trim_end_matches(MESSAGE_SEPARATOR)).unwrap()
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let (broker, mut wire, _) = broker(Duration::from_secs(5));
        let call = broker.start_request("add-numbers", json!([2, 3])).unwrap();
        let id = call.id().to_string();

        let sent = next_sent(&mut wire).await;
        assert_eq!(sent, rpc(Action::Request, &["add-numbers", id.as_str(), "O[2,3]"]));

        broker.handle(&rpc(Action::Ack, &["REQ", "add-numbers", id.as_str()]));
        assert_eq!(call.state(), RpcState::Accepted);

        broker.handle(&rpc(Action::Response, &["add-numbers", id.as_str(), "N5"]));
        assert_eq!(call.result().await, Ok(json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_provider_times_out() {
        let (broker, _wire, _) = broker(Duration::from_millis(500));
        let call = broker.start_request("add-numbers", json!([2, 3])).unwrap();
        let handle = call.handle();
        assert_eq!(
            call.result().await,
            Err(ClientError::RpcTimeout { name: "add-numbers".to_string() })
        );
        // Late response and late cancel are both no-ops.
        broker.handle(&rpc(Action::Response, &["add-numbers", handle.id(), "N5"]));
        assert!(!handle.cancel());
    }

    fn pending_len(broker: &RpcBroker) -> usize {
        broker.pending.lock().unwrap().len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_runs_without_anyone_awaiting() {
        let (broker, _wire, _) = broker(Duration::from_millis(100));
        let call = broker.start_request("add-numbers", json!([2, 3])).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(call.state(), RpcState::TimedOut);
        assert_eq!(pending_len(&broker), 0);
        assert_eq!(
            call.result().await,
            Err(ClientError::RpcTimeout { name: "add-numbers".to_string() })
        );
    }

    #[tokio::test]
    async fn test_dropped_call_is_cancelled() {
        let (broker, _wire, _) = broker(Duration::from_secs(60));
        let call = broker.start_request("add-numbers", json!([2, 3])).unwrap();
        let id = call.id().to_string();
        assert_eq!(pending_len(&broker), 1);

        drop(call);
        assert_eq!(pending_len(&broker), 0);
        // A late answer finds nothing to settle.
        broker.handle(&rpc(Action::Response, &["add-numbers", id.as_str(), "N5"]));
        assert_eq!(pending_len(&broker), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_future_leaves_nothing_behind() {
        let (broker, _wire, _) = broker(Duration::from_secs(60));
        let waited = tokio::time::timeout(Duration::from_millis(10), broker.request("slow", Value::Null)).await;
        assert!(waited.is_err());
        assert_eq!(pending_len(&broker), 0);
    }

    #[tokio::test]
    async fn test_reject_and_error_outcomes() {
        let (broker, _wire, _) = broker(Duration::from_secs(5));

        let call = broker.start_request("a", Value::Null).unwrap();
        broker.handle(&rpc(Action::Reject, &["a", call.id()]));
        assert_eq!(call.result().await, Err(ClientError::RpcRejected { name: "a".to_string() }));

        let call = broker.start_request("b", Value::Null).unwrap();
        broker.handle(&rpc(Action::Error, &["NO_RPC_PROVIDER", "b", call.id()]));
        assert_eq!(
            call.result().await,
            Err(ClientError::RpcError {
                name: "b".to_string(),
                message: "NO_RPC_PROVIDER".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let (broker, _wire, _) = broker(Duration::from_secs(5));
        let call = broker.start_request("slow", json!(1)).unwrap();
        let id = call.id().to_string();

        assert!(call.cancel());
        assert!(!call.cancel());
        assert_eq!(call.state(), RpcState::Cancelled);

        broker.handle(&rpc(Action::Response, &["slow", id.as_str(), "N1"]));
        assert_eq!(call.result().await, Err(ClientError::RpcCancelled { name: "slow".to_string() }));
    }

    #[test]
    fn test_provider_answers_once() {
        let (broker, mut wire, _) = broker(Duration::from_secs(5));
        broker.provide(
            "add-numbers",
            Arc::new(|_: &str, payload: Value, response: RpcResponse| {
                let sum: f64 = payload.as_array().into_iter().flatten().filter_map(Value::as_f64).sum();
                assert!(response.send(json!(sum as i64)));
                assert!(!response.reject());
                assert!(!response.error("late"));
            }),
        );
        broker.handle(&rpc(Action::Request, &["add-numbers", "c1", "O[2,3]"]));

        assert_eq!(
            drain(&mut wire),
            vec![
                rpc(Action::Subscribe, &["add-numbers"]),
                rpc(Action::Ack, &["REQ", "add-numbers", "c1"]),
                rpc(Action::Response, &["add-numbers", "c1", "N5"]),
            ]
        );
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let (broker, mut wire, _) = broker(Duration::from_secs(5));
        broker.handle(&rpc(Action::Request, &["nobody", "c2", "L"]));
        assert_eq!(drain(&mut wire), vec![rpc(Action::Reject, &["nobody", "c2"])]);
    }

    #[test]
    fn test_panicking_provider_answers_with_error() {
        let (broker, mut wire, errors) = broker(Duration::from_secs(5));
        broker.provide("boom", Arc::new(|_: &str, _: Value, _: RpcResponse| panic!("provider failed")));
        drain(&mut wire);

        broker.handle(&rpc(Action::Request, &["boom", "c3", "L"]));
        let sent = drain(&mut wire);
        assert_eq!(sent.last(), Some(&rpc(Action::Error, &["HANDLER_EXCEPTION", "boom", "c3"])));
        assert_eq!(errors.lock().unwrap()[0].event(), &ErrorEvent::HandlerException);
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_calls() {
        let (broker, _wire, _) = broker(Duration::from_secs(5));
        let call = broker.start_request("x", Value::Null).unwrap();
        broker.teardown();
        assert_eq!(call.result().await, Err(ClientError::RpcCancelled { name: "x".to_string() }));
    }
}
