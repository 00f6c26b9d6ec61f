//! # Transport Links
//!
//! A `Link` is one established, bidirectional text-frame pipe to the server.
//! The `Connection` supervisor asks a `Connector` for a new link every time it
//! (re)connects and treats the inbound side returning `None` as link loss.
//!
//! - **`WsConnector`** (feature `ws`): WebSocket via `tokio-tungstenite`. Reading
//!   and writing run in two pump tasks so that the connection only ever deals
//!   with channels; the writer task is the single writer on the socket.
//! - **`LoopbackConnector`**: an in-memory link whose far end is handed to the
//!   embedding code as a `LoopbackPeer`. Used by tests to script a server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::errors::ClientError;
use crate::protocol::{decode_frame, Message};

/// One established connection, seen as a pair of frame channels.
pub struct Link {
    /// Frames written here are sent to the server in order.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames received from the server. `None` means the link is gone.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Establishes links to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new link to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Link, ClientError>;
}

/// Turns a bare `host:port` endpoint into a WebSocket URL; full URLs pass through.
pub fn endpoint_url(endpoint: &str) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        format!("ws://{}", endpoint)
    }
}

#[cfg(feature = "ws")]
pub use ws::WsConnector;

#[cfg(feature = "ws")]
mod ws {
    use super::{endpoint_url, Connector, Link};
    use crate::core::errors::ClientError;

    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

    /// WebSocket connector backed by `tokio-tungstenite`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WsConnector;

    #[async_trait]
    impl Connector for WsConnector {
        async fn connect(&self, endpoint: &str) -> Result<Link, ClientError> {
            let url = endpoint_url(endpoint);
            log::info!("Opening WebSocket link to {}", url);

            let (ws_stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let (mut write, mut read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            // Writer pump: ends when the connection drops its sender.
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
                        log::error!("WebSocket write error: {}", e);
                        break;
                    }
                }
                let _ = write.close().await;
            });

            // Reader pump: ends on close, error, or when nobody listens any more.
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    let frame = match msg {
                        Ok(WsMessage::Text(text)) => text.to_string(),
                        Ok(WsMessage::Binary(bin)) => match String::from_utf8(bin.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                log::warn!("Dropping non UTF-8 binary frame ({} bytes)", bin.len());
                                continue;
                            }
                        },
                        Ok(WsMessage::Close(_)) => {
                            log::warn!("WebSocket closed by remote host.");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            log::error!("WebSocket read error: {}", e);
                            break;
                        }
                    };
                    if in_tx.send(frame).is_err() {
                        break;
                    }
                }
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}

/// The server end of a loopback link.
pub struct LoopbackPeer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
    buffered: VecDeque<Message>,
}

impl LoopbackPeer {
    /// Sends one message to the client as its own frame.
    pub fn send(&self, message: &Message) -> bool {
        self.to_client.send(message.encode()).is_ok()
    }

    /// Sends a raw frame, which may hold several messages or garbage.
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).is_ok()
    }

    /// Next message written by the client. Undecodable messages are skipped.
    /// `None` once the client side has gone away.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(msg) = self.buffered.pop_front() {
                return Some(msg);
            }
            let frame = self.from_client.recv().await?;
            self.buffered.extend(decode_frame(&frame).into_iter().filter_map(Result::ok));
        }
    }

    /// Returns a message if one is already waiting, without suspending.
    pub fn try_recv(&mut self) -> Option<Message> {
        while self.buffered.is_empty() {
            let frame = self.from_client.try_recv().ok()?;
            self.buffered.extend(decode_frame(&frame).into_iter().filter_map(Result::ok));
        }
        self.buffered.pop_front()
    }
}

/// In-memory connector. Every successful `connect` yields a new `LoopbackPeer`
/// on the receiver returned by `new`. Dropping a peer closes its link.
pub struct LoopbackConnector {
    accept: mpsc::UnboundedSender<LoopbackPeer>,
    refusing: AtomicBool,
}

impl LoopbackConnector {
    /// Creates the connector and the stream of accepted peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (accept, accepted) = mpsc::unbounded_channel();
        (
            Self {
                accept,
                refusing: AtomicBool::new(false),
            },
            accepted,
        )
    }

    /// While set, every connection attempt fails.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link, ClientError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(ClientError::Transport(format!("connection to {} refused", endpoint)));
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            to_client,
            from_client,
            buffered: VecDeque::new(),
        };
        self.accept
            .send(peer)
            .map_err(|_| ClientError::Transport(format!("nobody accepts on {}", endpoint)))?;
        Ok(Link { outbound, inbound })
    }
}
