//! # Record Store
//!
//! Named, versioned JSON records kept in sync with the server.
//!
//! - Local writes are optimistic: the version is bumped and the value applied
//!   before the server has seen it. Writes to one record are serialized by the
//!   record's lock, which is held while the update is queued on the wire, so
//!   wire order always matches version order.
//! - Remote updates only ever move a record forward. Anything at or below the
//!   local version is stale and dropped quietly.
//! - Acknowledged writes park a oneshot keyed by `(record, version)`; the
//!   `WA` reply resolves it with a single map lookup. A deadline guarantees the
//!   caller is released even if the server never answers.
//! - A `VERSION_EXISTS` conflict is settled last-writer-wins by version.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::core::connection::{Connection, ConnectionState};
use crate::core::errors::{ClientError, ErrorEvent, ErrorReporter, RuntimeError};
use crate::core::registry::{compile_pattern, DiscoveryHandler};
use crate::protocol::{typed, Action, Message, Topic};

/// Callback receiving `(record name, new value)`.
pub type RecordChangeHandler = dyn Fn(&str, &Value) + Send + Sync;

type AckSender = oneshot::Sender<Result<(), ClientError>>;

struct RecordState {
    version: u64,
    data: Value,
    // Versions of local writes still waiting for a write acknowledgement.
    pending_acks: VecDeque<u64>,
    listeners: Vec<(u64, Arc<RecordChangeHandler>)>,
}

struct RecordEntry {
    state: Mutex<RecordState>,
}

impl RecordEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(RecordState {
                version: 0,
                data: Value::Object(Map::new()),
                pending_acks: VecDeque::new(),
                listeners: Vec::new(),
            }),
        }
    }
}

pub struct RecordStore {
    connection: Arc<Connection>,
    reporter: Arc<ErrorReporter>,
    ack_timeout: Duration,
    records: Mutex<HashMap<String, Arc<RecordEntry>>>,
    pending_writes: Mutex<HashMap<(String, u64), AckSender>>,
    discovery: Mutex<HashMap<String, Arc<DiscoveryHandler>>>,
    next_listener_id: AtomicU64,
}

/// A handle to one record. Cheap to clone.
#[derive(Clone)]
pub struct Record {
    name: String,
    store: Arc<RecordStore>,
}

impl Record {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current version; 0 until the first write or read.
    pub fn version(&self) -> u64 {
        self.store.version(&self.name).unwrap_or(0)
    }

    /// Snapshot of the whole value.
    pub fn get(&self) -> Value {
        self.store.get(&self.name).unwrap_or(Value::Null)
    }

    /// Snapshot of the value at a dotted path such as `address.city`.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        self.store.get_path(&self.name, path)
    }

    pub fn set(&self, value: Value) -> Result<u64, ClientError> {
        self.store.set(&self.name, value)
    }

    pub fn set_path(&self, path: &str, value: Value) -> Result<u64, ClientError> {
        self.store.set_path(&self.name, path, value)
    }

    pub async fn set_with_ack(&self, field: &str, value: Value) -> Result<(), ClientError> {
        self.store.set_with_ack(&self.name, field, value).await
    }

    pub fn subscribe(&self, handler: Arc<RecordChangeHandler>) -> u64 {
        self.store.subscribe(&self.name, handler)
    }

    pub fn unsubscribe(&self, listener_id: u64) -> bool {
        self.store.unsubscribe(&self.name, listener_id)
    }

    pub fn discard(self) {
        self.store.discard(&self.name);
    }
}

impl RecordStore {
    pub fn new(connection: Arc<Connection>, reporter: Arc<ErrorReporter>, ack_timeout: Duration) -> Self {
        Self {
            connection,
            reporter,
            ack_timeout,
            records: Mutex::new(HashMap::new()),
            pending_writes: Mutex::new(HashMap::new()),
            discovery: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Returns a handle to `name`, creating the local record (and asking the
    /// server for it) on first use.
    pub fn get_record(self: &Arc<Self>, name: &str) -> Record {
        self.entry(name);
        Record {
            name: name.to_string(),
            store: Arc::clone(self),
        }
    }

    fn entry(&self, name: &str) -> Arc<RecordEntry> {
        let mut records = self.records.lock().expect("RecordStore lock poisoned");
        if let Some(existing) = records.get(name) {
            return Arc::clone(existing);
        }
        let entry = Arc::new(RecordEntry::new());
        records.insert(name.to_string(), Arc::clone(&entry));
        drop(records);

        log::debug!("Created record '{}'", name);
        self.connection
            .send_when_open(&Message::new(Topic::Record, Action::CreateOrRead, [name]));
        entry
    }

    fn existing(&self, name: &str) -> Option<Arc<RecordEntry>> {
        self.records.lock().expect("RecordStore lock poisoned").get(name).cloned()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.connection.state() {
            ConnectionState::Open => Ok(()),
            other => Err(ClientError::NotConnected(other)),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let entry = self.existing(name)?;
        let state = entry.state.lock().expect("Record lock poisoned");
        Some(state.data.clone())
    }

    pub fn get_path(&self, name: &str, path: &str) -> Option<Value> {
        let entry = self.existing(name)?;
        let state = entry.state.lock().expect("Record lock poisoned");
        read_path(&state.data, path).cloned()
    }

    pub fn version(&self, name: &str) -> Option<u64> {
        let entry = self.existing(name)?;
        let version = entry.state.lock().expect("Record lock poisoned").version;
        Some(version)
    }

    /// Replaces the whole value. Returns the new version without waiting for
    /// the server.
    pub fn set(&self, name: &str, value: Value) -> Result<u64, ClientError> {
        self.ensure_open()?;
        let entry = self.entry(name);
        let (version, listeners) = {
            let mut state = entry.state.lock().expect("Record lock poisoned");
            let version = state.version + 1;
            self.connection.send(&Message::new(
                Topic::Record,
                Action::Update,
                [name.to_string(), version.to_string(), value.to_string()],
            ))?;
            state.version = version;
            state.data = value.clone();
            (version, state.listeners.clone())
        };
        self.notify(name, &value, listeners);
        Ok(version)
    }

    /// `data` with `path` set to `value`, or `InvalidPath` if it cannot be.
    fn patched(&self, name: &str, data: &Value, path: &str, value: Value) -> Result<Value, ClientError> {
        let mut next = data.clone();
        if write_path(&mut next, path, value) {
            Ok(next)
        } else {
            Err(ClientError::InvalidPath {
                record: name.to_string(),
                path: path.to_string(),
            })
        }
    }

    /// Writes one dotted path. Fire-and-forget like `set`.
    pub fn set_path(&self, name: &str, path: &str, value: Value) -> Result<u64, ClientError> {
        self.ensure_open()?;
        let entry = self.entry(name);
        let (version, data, listeners) = {
            let mut state = entry.state.lock().expect("Record lock poisoned");
            let version = state.version + 1;
            let encoded = typed::encode(&value);
            let next = self.patched(name, &state.data, path, value)?;
            self.connection.send(&Message::new(
                Topic::Record,
                Action::Patch,
                [name.to_string(), version.to_string(), path.to_string(), encoded],
            ))?;
            state.version = version;
            state.data = next;
            (version, state.data.clone(), state.listeners.clone())
        };
        self.notify(name, &data, listeners);
        Ok(version)
    }

    /// Writes `field` (a dotted path, or the whole record when empty) and waits
    /// for the server's write acknowledgement or the ack deadline.
    pub async fn set_with_ack(&self, name: &str, field: &str, value: Value) -> Result<(), ClientError> {
        self.ensure_open()?;
        let entry = self.entry(name);
        let (version, rx, data, listeners) = {
            let mut state = entry.state.lock().expect("Record lock poisoned");
            let version = state.version + 1;
            let key = (name.to_string(), version);
            let next = self.patched(name, &state.data, field, value.clone())?;

            let (tx, rx) = oneshot::channel();
            self.pending_writes
                .lock()
                .expect("RecordStore lock poisoned")
                .insert(key.clone(), tx);

            let config = r#"{"writeSuccess":true}"#.to_string();
            let message = if field.is_empty() {
                Message::new(
                    Topic::Record,
                    Action::Update,
                    [name.to_string(), version.to_string(), value.to_string(), config],
                )
            } else {
                Message::new(
                    Topic::Record,
                    Action::Patch,
                    [name.to_string(), version.to_string(), field.to_string(), typed::encode(&value), config],
                )
            };
            if let Err(e) = self.connection.send(&message) {
                self.pending_writes.lock().expect("RecordStore lock poisoned").remove(&key);
                return Err(e);
            }

            state.version = version;
            state.data = next;
            state.pending_acks.push_back(version);
            (version, rx, state.data.clone(), state.listeners.clone())
        };
        self.notify(name, &data, listeners);

        // Forgets the waiter on timeout, and also when this future is dropped
        // before anything answered.
        let mut waiter = AckWaiter {
            store: self,
            entry: &entry,
            name,
            version,
            settled: false,
        };
        let outcome = match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::WriteFailed {
                record: name.to_string(),
                message: "write abandoned".to_string(),
            }),
            Err(_) => {
                log::warn!("No write acknowledgement for '{}' version {}", name, version);
                return Err(ClientError::AckTimeout {
                    record: name.to_string(),
                    version,
                });
            }
        };
        waiter.settled = true;
        outcome
    }

    /// Adds a value-change listener, creating the record if needed.
    pub fn subscribe(&self, name: &str, handler: Arc<RecordChangeHandler>) -> u64 {
        let entry = self.entry(name);
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        entry.state.lock().expect("Record lock poisoned").listeners.push((id, handler));
        id
    }

    pub fn unsubscribe(&self, name: &str, listener_id: u64) -> bool {
        let Some(entry) = self.existing(name) else {
            return false;
        };
        let mut state = entry.state.lock().expect("Record lock poisoned");
        let before = state.listeners.len();
        state.listeners.retain(|(id, _)| *id != listener_id);
        state.listeners.len() != before
    }

    /// Drops the local copy and tells the server we are no longer interested.
    /// Outstanding acknowledged writes fail.
    pub fn discard(&self, name: &str) {
        if self.forget(name, "record discarded") {
            self.connection
                .send_when_open(&Message::new(Topic::Record, Action::Unsubscribe, [name]));
        }
    }

    /// Deletes the record on the server and drops the local copy.
    pub fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.connection
            .send(&Message::new(Topic::Record, Action::Delete, [name]))?;
        self.forget(name, "record deleted");
        Ok(())
    }

    fn forget(&self, name: &str, reason: &str) -> bool {
        let removed = self.records.lock().expect("RecordStore lock poisoned").remove(name);
        let Some(entry) = removed else {
            return false;
        };
        let versions: Vec<u64> = entry
            .state
            .lock()
            .expect("Record lock poisoned")
            .pending_acks
            .drain(..)
            .collect();
        self.fail_writes(name, &versions, reason);
        true
    }

    /// Registers a discovery handler told when other clients start or stop
    /// subscribing to records matching `pattern`.
    pub fn listen(&self, pattern: &str, handler: Arc<DiscoveryHandler>) -> Result<(), ClientError> {
        compile_pattern(pattern)?;
        let previous = self
            .discovery
            .lock()
            .expect("RecordStore lock poisoned")
            .insert(pattern.to_string(), handler);
        if previous.is_none() {
            self.connection
                .send_when_open(&Message::new(Topic::Record, Action::Listen, [pattern]));
        }
        Ok(())
    }

    pub fn unlisten(&self, pattern: &str) {
        let removed = self.discovery.lock().expect("RecordStore lock poisoned").remove(pattern);
        if removed.is_some() {
            self.connection
                .send_when_open(&Message::new(Topic::Record, Action::Unlisten, [pattern]));
        }
    }

    pub(crate) fn handle(&self, message: &Message) {
        match message.action {
            Action::Read | Action::Update => {
                let data = match serde_json::from_str::<Value>(message.part(2)) {
                    Ok(v) => v,
                    Err(e) => return self.parse_error(message, &e.to_string()),
                };
                self.apply_remote(message, move |current| *current = data);
            }
            Action::Patch => {
                let value = match typed::decode(message.part(3)) {
                    Ok(v) => v,
                    Err(e) => return self.parse_error(message, &e.to_string()),
                };
                let path = message.part(2).to_string();
                self.apply_remote(message, move |current| {
                    write_path(current, &path, value);
                });
            }
            Action::WriteAcknowledgement => self.acknowledge(message),
            Action::SubscriptionForPatternFound => self.discovered(message, true),
            Action::SubscriptionForPatternRemoved => self.discovered(message, false),
            Action::Error if message.part(0) == ErrorEvent::VersionExists.as_str() => self.conflict(message),
            Action::Error => self.reporter.report(RuntimeError::new(
                Topic::Record,
                ErrorEvent::from_wire(message.part(0)),
                message.data.get(1..).map(|rest| rest.join(" ")).unwrap_or_default(),
            )),
            Action::Ack => log::debug!("Record ack: {}", message),
            _ => self.reporter.report(RuntimeError::new(
                Topic::Record,
                ErrorEvent::UnsolicitedMessage,
                message.to_string(),
            )),
        }
    }

    fn parse_error(&self, message: &Message, reason: &str) {
        self.reporter.report(RuntimeError::new(
            Topic::Record,
            ErrorEvent::MessageParseError,
            format!("{}: {}", message, reason),
        ));
    }

    fn apply_remote<F: FnOnce(&mut Value)>(&self, message: &Message, mutate: F) {
        let name = message.part(0);
        let Ok(version) = message.part(1).parse::<u64>() else {
            return self.parse_error(message, "bad version");
        };
        let Some(entry) = self.existing(name) else {
            log::debug!("Update for unknown record '{}' ignored", name);
            return;
        };

        let (data, listeners) = {
            let mut state = entry.state.lock().expect("Record lock poisoned");
            if version <= state.version {
                log::debug!(
                    "Stale update for '{}' dropped (remote {} <= local {})",
                    name,
                    version,
                    state.version
                );
                return;
            }
            state.version = version;
            mutate(&mut state.data);
            (state.data.clone(), state.listeners.clone())
        };
        self.notify(name, &data, listeners);
    }

    fn acknowledge(&self, message: &Message) {
        let name = message.part(0);
        let Ok(version) = message.part(1).parse::<u64>() else {
            return self.parse_error(message, "bad version");
        };
        if let Some(entry) = self.existing(name) {
            entry
                .state
                .lock()
                .expect("Record lock poisoned")
                .pending_acks
                .retain(|v| *v != version);
        }

        let sender = self
            .pending_writes
            .lock()
            .expect("RecordStore lock poisoned")
            .remove(&(name.to_string(), version));
        let Some(sender) = sender else {
            log::debug!("Write ack for '{}' version {} has no waiter", name, version);
            return;
        };
        let result = match message.part(2) {
            "" | "L" => Ok(()),
            error => Err(ClientError::WriteFailed {
                record: name.to_string(),
                message: typed::decode(error)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| error.to_string()),
            }),
        };
        let _ = sender.send(result);
    }

    // E|VERSION_EXISTS|name|version|data
    fn conflict(&self, message: &Message) {
        let name = message.part(1);
        let Ok(remote_version) = message.part(2).parse::<u64>() else {
            return self.parse_error(message, "bad version");
        };
        let remote_data = serde_json::from_str::<Value>(message.part(3)).ok();

        if let Some(entry) = self.existing(name) {
            let (failed, adopted) = {
                let mut state = entry.state.lock().expect("Record lock poisoned");
                if remote_version >= state.version {
                    state.version = remote_version;
                    if let Some(data) = remote_data {
                        state.data = data;
                    }
                    let failed: Vec<u64> = state.pending_acks.drain(..).collect();
                    (failed, Some((state.data.clone(), state.listeners.clone())))
                } else {
                    let failed: Vec<u64> = state.pending_acks.iter().copied().filter(|v| *v <= remote_version).collect();
                    state.pending_acks.retain(|v| *v > remote_version);
                    (failed, None)
                }
            };
            if let Some((data, listeners)) = adopted {
                self.notify(name, &data, listeners);
            }
            self.fail_writes(name, &failed, &format!("version conflict at {}", remote_version));
        }

        self.reporter.report(RuntimeError::new(
            Topic::Record,
            ErrorEvent::VersionExists,
            format!("record '{}' already has version {}", name, remote_version),
        ));
    }

    fn fail_writes(&self, name: &str, versions: &[u64], reason: &str) {
        if versions.is_empty() {
            return;
        }
        let mut pending = self.pending_writes.lock().expect("RecordStore lock poisoned");
        for version in versions {
            if let Some(sender) = pending.remove(&(name.to_string(), *version)) {
                let _ = sender.send(Err(ClientError::WriteFailed {
                    record: name.to_string(),
                    message: reason.to_string(),
                }));
            }
        }
    }

    fn discovered(&self, message: &Message, is_subscribed: bool) {
        let pattern = message.part(0);
        let name = message.part(1);
        let handler = self.discovery.lock().expect("RecordStore lock poisoned").get(pattern).cloned();
        match handler {
            Some(h) => {
                let context = format!("record discovery '{}'", pattern);
                self.reporter.guard(Topic::Record, &context, || h(name, is_subscribed));
            }
            None => self.reporter.report(RuntimeError::new(
                Topic::Record,
                ErrorEvent::UnsolicitedMessage,
                format!("no discovery handler for pattern '{}'", pattern),
            )),
        }
    }

    fn notify(&self, name: &str, value: &Value, listeners: Vec<(u64, Arc<RecordChangeHandler>)>) {
        let context = format!("record '{}'", name);
        for (_, listener) in listeners {
            self.reporter.guard(Topic::Record, &context, || listener(name, value));
        }
    }

    /// Re-reads every known record and re-sends discovery patterns.
    pub(crate) fn replay(&self) {
        let names: Vec<String> = self.records.lock().expect("RecordStore lock poisoned").keys().cloned().collect();
        for name in names {
            self.connection
                .send_when_open(&Message::new(Topic::Record, Action::CreateOrRead, [name]));
        }
        let patterns: Vec<String> = self.discovery.lock().expect("RecordStore lock poisoned").keys().cloned().collect();
        for pattern in patterns {
            self.connection
                .send_when_open(&Message::new(Topic::Record, Action::Listen, [pattern]));
        }
    }

    pub(crate) fn teardown(&self) {
        let pending: Vec<((String, u64), AckSender)> = self
            .pending_writes
            .lock()
            .expect("RecordStore lock poisoned")
            .drain()
            .collect();
        for ((record, _), sender) in pending {
            let _ = sender.send(Err(ClientError::WriteFailed {
                record,
                message: "client closed".to_string(),
            }));
        }
        self.records.lock().expect("RecordStore lock poisoned").clear();
        self.discovery.lock().expect("RecordStore lock poisoned").clear();
    }
}

struct AckWaiter<'a> {
    store: &'a RecordStore,
    entry: &'a RecordEntry,
    name: &'a str,
    version: u64,
    settled: bool,
}

impl Drop for AckWaiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.store
            .pending_writes
            .lock()
            .expect("RecordStore lock poisoned")
            .remove(&(self.name.to_string(), self.version));
        self.entry
            .state
            .lock()
            .expect("Record lock poisoned")
            .pending_acks
            .retain(|v| *v != self.version);
    }
}

/// Reads a dotted path. The empty path is the root. Numeric segments index
/// into arrays.
pub fn read_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    root.pointer(&format!("/{}", path.replace('.', "/")))
}

/// Writes a dotted path, creating intermediate objects. The empty path
/// replaces the root. On an array a segment must be an existing index or the
/// length (which appends); anything else leaves the value untouched and
/// returns false.
pub fn write_path(root: &mut Value, path: &str, value: Value) -> bool {
    if path.is_empty() {
        *root = value;
        return true;
    }
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();
        let index = match &*current {
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(i) if i <= items.len() => Some(i),
                _ => {
                    log::warn!(
                        "Path '{}': '{}' is not a usable index for an array of {}",
                        path,
                        segment,
                        items.len()
                    );
                    return false;
                }
            },
            _ => None,
        };
        current = match (current, index) {
            (Value::Array(items), Some(slot)) => {
                if slot == items.len() {
                    items.push(Value::Null);
                }
                if last {
                    items[slot] = value;
                    return true;
                }
                &mut items[slot]
            }
            (other, _) => {
                if !other.is_object() {
                    *other = Value::Object(Map::new());
                }
                let Value::Object(map) = other else {
                    return false;
                };
                if last {
                    map.insert(segment.to_string(), value);
                    return true;
                }
                map.entry(segment.to_string()).or_insert(Value::Null)
            }
        };
    }
    false
}
