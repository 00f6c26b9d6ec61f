//! # End-to-end Test Harness
//!
//! Drives a `RealtimeClient` against a scripted server built on the in-memory
//! loopback connector. The test plays the server: it reads what the client
//! writes with `expect` and answers with `LoopbackPeer::send`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lib_realtime::configs::ClientConfig;
use lib_realtime::core::{LoopbackConnector, LoopbackPeer, RealtimeClient};
use lib_realtime::protocol::{Action, Message, Topic};
use serde_json::json;
use tokio::sync::mpsc;

/// How long a scripted step waits before the test fails.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        reconnect_jitter: 0.0,
        max_reconnect_attempts: 3,
        rpc_response_timeout_ms: 300,
        record_ack_timeout_ms: 300,
        login_timeout_ms: 500,
        ..ClientConfig::new("loopback:6020")
    }
}

pub fn msg<'a>(topic: Topic, action: Action, parts: impl IntoIterator<Item = &'a str>) -> Message {
    Message::new(topic, action, parts)
}

/// The server side of one client's connections.
pub struct FakeServer {
    pub connector: Arc<LoopbackConnector>,
    accepted: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl FakeServer {
    pub fn new() -> Self {
        let (connector, accepted) = LoopbackConnector::new();
        Self {
            connector: Arc::new(connector),
            accepted,
        }
    }

    pub fn client(&self, config: ClientConfig) -> RealtimeClient {
        RealtimeClient::with_connector(config, self.connector.clone())
    }

    /// Waits for the client's next link.
    pub async fn accept(&mut self) -> LoopbackPeer {
        tokio::time::timeout(STEP_TIMEOUT, self.accepted.recv())
            .await
            .expect("client did not connect in time")
            .expect("connector dropped")
    }

    /// Answers the pending authentication request on `peer` with success.
    pub async fn accept_auth(peer: &mut LoopbackPeer) -> Message {
        let auth = expect(peer, Topic::Auth, Action::Request).await;
        peer.send(&msg(Topic::Auth, Action::Ack, []));
        auth
    }

    /// A logged-in client and the server end of its link.
    pub async fn logged_in(&mut self, config: ClientConfig) -> (RealtimeClient, LoopbackPeer) {
        let client = self.client(config);
        let login = tokio::spawn({
            let client = client.clone();
            async move { client.login(&json!({"username": "tester"})).await }
        });
        let mut peer = self.accept().await;
        Self::accept_auth(&mut peer).await;
        let result = login.await.expect("login task panicked");
        assert!(result.logged_in(), "login failed: {:?}", result);
        (client, peer)
    }
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Next message the client wrote, whatever it is.
pub async fn next(peer: &mut LoopbackPeer) -> Message {
    tokio::time::timeout(STEP_TIMEOUT, peer.recv())
        .await
        .expect("client sent nothing in time")
        .expect("link closed")
}

/// Next message with the given topic and action, skipping anything else.
pub async fn expect(peer: &mut LoopbackPeer, topic: Topic, action: Action) -> Message {
    loop {
        let message = next(peer).await;
        if message.topic == topic && message.action == action {
            return message;
        }
    }
}

/// Everything the client has written so far, without waiting.
pub fn drain(peer: &mut LoopbackPeer) -> Vec<Message> {
    let mut out = Vec::new();
    while let Some(message) = peer.try_recv() {
        out.push(message);
    }
    out
}
