//! # Event Bus
//!
//! Fire-and-forget events with pattern subscriptions.
//!
//! ## Fan-out
//! An inbound `E|EVT|name|payload` is decoded once and the same payload
//! reference is handed to every handler whose pattern matches, in registration
//! order. Each handler runs behind the `ErrorReporter` guard: a panicking
//! handler becomes a `HandlerException` runtime error and delivery continues
//! with the next one.
//!
//! ## Provider discovery
//! `listen_subscriptions` is the publisher side: the server tells us when some
//! client subscribes to (`SP`) or leaves (`SR`) an event name matching our
//! pattern, so we can start or stop producing it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::core::connection::Connection;
use crate::core::errors::{ClientError, ErrorEvent, ErrorReporter, RuntimeError};
use crate::core::registry::{compile_pattern, DiscoveryHandler, SubscriptionHandle, TopicRegistry};
use crate::protocol::{typed, Action, Message, Topic};

/// Callback receiving `(event name, payload)`.
pub type EventHandler = dyn Fn(&str, &Value) + Send + Sync;

pub struct EventBus {
    connection: Arc<Connection>,
    reporter: Arc<ErrorReporter>,
    subscribers: TopicRegistry<EventHandler>,
    discovery: Mutex<HashMap<String, Arc<DiscoveryHandler>>>,
}

impl EventBus {
    pub fn new(connection: Arc<Connection>, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            connection,
            reporter,
            subscribers: TopicRegistry::new(),
            discovery: Mutex::new(HashMap::new()),
        }
    }

    /// Publishes an event. Having no subscribers anywhere is not an error.
    pub fn emit(&self, name: &str, payload: Value) -> Result<(), ClientError> {
        let message = Message::new(Topic::Event, Action::Event, [name.to_string(), typed::encode(&payload)]);
        self.connection.send(&message)
    }

    /// Subscribes `handler` to every event whose name matches `pattern`. The
    /// server subscription is sent once per pattern, now if open or on the
    /// next login otherwise.
    pub fn listen(&self, pattern: &str, handler: Arc<EventHandler>) -> Result<SubscriptionHandle, ClientError> {
        let outcome = self.subscribers.listen(pattern, handler)?;
        if outcome.first_for_pattern {
            self.connection
                .send_when_open(&Message::new(Topic::Event, Action::Subscribe, [pattern]));
        }
        Ok(outcome.handle)
    }

    /// Removes one subscription. Unknown handles are ignored.
    pub fn unlisten(&self, handle: &SubscriptionHandle) {
        if let Some(true) = self.subscribers.unlisten(handle) {
            self.connection
                .send_when_open(&Message::new(Topic::Event, Action::Unsubscribe, [handle.pattern()]));
        }
    }

    /// Registers a discovery handler for `pattern`, replacing any previous one.
    pub fn listen_subscriptions(&self, pattern: &str, handler: Arc<DiscoveryHandler>) -> Result<(), ClientError> {
        compile_pattern(pattern)?;
        let previous = self
            .discovery
            .lock()
            .expect("EventBus lock poisoned")
            .insert(pattern.to_string(), handler);
        if previous.is_some() {
            log::warn!("Replacing event discovery handler for '{}'", pattern);
        } else {
            self.connection
                .send_when_open(&Message::new(Topic::Event, Action::Listen, [pattern]));
        }
        Ok(())
    }

    pub fn unlisten_subscriptions(&self, pattern: &str) {
        let removed = self.discovery.lock().expect("EventBus lock poisoned").remove(pattern);
        if removed.is_some() {
            self.connection
                .send_when_open(&Message::new(Topic::Event, Action::Unlisten, [pattern]));
        }
    }

    /// Inbound messages for the event topic.
    pub(crate) fn handle(&self, message: &Message) {
        match message.action {
            Action::Event => self.deliver(message),
            Action::SubscriptionForPatternFound => self.discovered(message, true),
            Action::SubscriptionForPatternRemoved => self.discovered(message, false),
            Action::Ack => log::debug!("Event ack: {}", message),
            Action::Error => self.reporter.report(RuntimeError::new(
                Topic::Event,
                ErrorEvent::from_wire(message.part(0)),
                message.data.get(1..).map(|rest| rest.join(" ")).unwrap_or_default(),
            )),
            _ => self.reporter.report(RuntimeError::new(
                Topic::Event,
                ErrorEvent::UnsolicitedMessage,
                message.to_string(),
            )),
        }
    }

    fn deliver(&self, message: &Message) {
        let name = message.part(0);
        let payload = match message.data.get(1) {
            Some(raw) => match typed::decode(raw) {
                Ok(v) => v,
                Err(e) => {
                    self.reporter.report(RuntimeError::new(
                        Topic::Event,
                        ErrorEvent::MessageParseError,
                        format!("event '{}': {}", name, e),
                    ));
                    return;
                }
            },
            None => Value::Null,
        };

        let handlers = self.subscribers.match_topic(name);
        if handlers.is_empty() {
            log::debug!("No listeners for event '{}'", name);
            return;
        }
        let context = format!("event '{}'", name);
        for handler in handlers {
            self.reporter.guard(Topic::Event, &context, || handler(name, &payload));
        }
    }

    fn discovered(&self, message: &Message, is_subscribed: bool) {
        let pattern = message.part(0);
        let name = message.part(1);
        let handler = self.discovery.lock().expect("EventBus lock poisoned").get(pattern).cloned();
        match handler {
            Some(h) => {
                let context = format!("event discovery '{}'", pattern);
                self.reporter.guard(Topic::Event, &context, || h(name, is_subscribed));
            }
            None => self.reporter.report(RuntimeError::new(
                Topic::Event,
                ErrorEvent::UnsolicitedMessage,
                format!("no discovery handler for pattern '{}'", pattern),
            )),
        }
    }

    /// Re-sends every subscription and discovery pattern after a login.
    pub(crate) fn replay(&self) {
        for pattern in self.subscribers.patterns() {
            self.connection
                .send_when_open(&Message::new(Topic::Event, Action::Subscribe, [pattern]));
        }
        let patterns: Vec<String> = self
            .discovery
            .lock()
            .expect("EventBus lock poisoned")
            .keys()
            .cloned()
            .collect();
        for pattern in patterns {
            self.connection
                .send_when_open(&Message::new(Topic::Event, Action::Listen, [pattern]));
        }
    }

    pub(crate) fn teardown(&self) {
        self.subscribers.clear();
        self.discovery.lock().expect("EventBus lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::test_support::{drain, open_connection};
    use serde_json::json;

    fn bus() -> (EventBus, tokio::sync::mpsc::UnboundedReceiver<String>, Arc<Mutex<Vec<RuntimeError>>>) {
        let reporter = Arc::new(ErrorReporter::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        reporter.set_handler(Arc::new(move |e: &RuntimeError| sink.lock().unwrap().push(e.clone())));
        let (conn, wire) = open_connection(Arc::clone(&reporter));
        (EventBus::new(conn, reporter), wire, errors)
    }

    fn inbound_event(name: &str, payload: &Value) -> Message {
        Message::new(Topic::Event, Action::Event, [name.to_string(), typed::encode(payload)])
    }

    #[test]
    fn test_pattern_subscriber_gets_exactly_one_delivery() {
        let (bus, mut wire, _) = bus();
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        bus.listen("event/.*", Arc::new(move |name: &str, payload: &Value| {
            sink.lock().unwrap().push((name.to_string(), payload.clone()));
        }))
        .unwrap();

        let sent = drain(&mut wire);
        assert_eq!(sent, vec![Message::new(Topic::Event, Action::Subscribe, ["event/.*"])]);

        bus.handle(&inbound_event("event/foo", &json!([42, "x"])));
        assert_eq!(*got.lock().unwrap(), vec![("event/foo".to_string(), json!([42, "x"]))]);
    }

    #[test]
    fn test_emit_without_listeners_is_fine() {
        let (bus, mut wire, errors) = bus();
        bus.emit("event/nobody", json!("hello")).unwrap();
        let sent = drain(&mut wire);
        assert_eq!(sent[0].data, vec!["event/nobody".to_string(), "Shello".to_string()]);

        bus.handle(&inbound_event("event/nobody", &json!(1)));
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let (bus, _wire, errors) = bus();
        let count = Arc::new(Mutex::new(0));
        bus.listen("a/.*", Arc::new(|_: &str, _: &Value| panic!("handler blew up"))).unwrap();
        let c = Arc::clone(&count);
        bus.listen("a/.*", Arc::new(move |_: &str, _: &Value| *c.lock().unwrap() += 1)).unwrap();

        bus.handle(&inbound_event("a/1", &Value::Null));
        assert_eq!(*count.lock().unwrap(), 1);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event(), &ErrorEvent::HandlerException);
    }

    #[test]
    fn test_unlisten_sends_unsubscribe_for_last_handler_only() {
        let (bus, mut wire, _) = bus();
        let h1 = bus.listen("e/.*", Arc::new(|_: &str, _: &Value| {})).unwrap();
        let h2 = bus.listen("e/.*", Arc::new(|_: &str, _: &Value| {})).unwrap();
        drain(&mut wire);

        bus.unlisten(&h1);
        assert!(drain(&mut wire).is_empty());
        bus.unlisten(&h2);
        assert_eq!(drain(&mut wire), vec![Message::new(Topic::Event, Action::Unsubscribe, ["e/.*"])]);
    }

    #[test]
    fn test_discovery_callbacks() {
        let (bus, mut wire, errors) = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.listen_subscriptions("event/.*", Arc::new(move |name: &str, on: bool| {
            sink.lock().unwrap().push((name.to_string(), on));
        }))
        .unwrap();
        assert_eq!(drain(&mut wire), vec![Message::new(Topic::Event, Action::Listen, ["event/.*"])]);

        bus.handle(&Message::new(Topic::Event, Action::SubscriptionForPatternFound, ["event/.*", "event/a"]));
        bus.handle(&Message::new(Topic::Event, Action::SubscriptionForPatternRemoved, ["event/.*", "event/a"]));
        bus.handle(&Message::new(Topic::Event, Action::SubscriptionForPatternFound, ["other/.*", "other/a"]));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("event/a".to_string(), true), ("event/a".to_string(), false)]
        );
        assert_eq!(errors.lock().unwrap()[0].event(), &ErrorEvent::UnsolicitedMessage);
    }

    #[test]
    fn test_separator_in_payload_or_name_is_refused() {
        let (bus, mut wire, _) = bus();
        assert!(matches!(
            bus.emit("event/a", json!("left\u{1f}right")),
            Err(ClientError::Serialization(_))
        ));
        assert!(matches!(
            bus.emit("event/\u{1e}a", json!(1)),
            Err(ClientError::Serialization(_))
        ));
        assert!(drain(&mut wire).is_empty());

        // Inside JSON the separators are escaped and travel intact.
        bus.emit("event/a", json!({"text": "left\u{1f}right"})).unwrap();
        let sent = drain(&mut wire);
        assert_eq!(typed::decode(sent[0].part(1)).unwrap(), json!({"text": "left\u{1f}right"}));
    }

    #[test]
    fn test_bad_payload_reported() {
        let (bus, _wire, errors) = bus();
        bus.listen("x", Arc::new(|_: &str, _: &Value| {})).unwrap();
        bus.handle(&Message::new(Topic::Event, Action::Event, ["x", "Nnope"]));
        assert_eq!(errors.lock().unwrap()[0].event(), &ErrorEvent::MessageParseError);
    }
}
