//! Transport abstraction and the WebSocket implementation.
//!
//! A [`Transport`] is the engine's half of one live connection: a sync `send`
//! and an async stream of [`TransportEvent`]s. The other half, a [`Peer`], is
//! driven either by the WebSocket pump task or directly by tests.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::{IntoClientRequest, uri_mode};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Something that happened on a live connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One inbound text frame.
    Message(String),
    /// The remote end closed, with its reason if it gave one.
    Closed(Option<String>),
    Error(TransportError),
}

/// Opens transports. The engine holds one connector for its whole life and
/// calls it once per attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, TransportError>>;
}

/// The engine's handle on one connection. Dropping it releases the
/// connection.
pub struct Transport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    _release: DropGuard,
}

impl Transport {
    /// A connected transport and the peer that feeds it.
    pub fn pair() -> (Transport, Peer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let transport = Transport {
            outbound: outbound_tx,
            inbound: inbound_rx,
            _release: cancel.clone().drop_guard(),
        };
        let peer = Peer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            cancel,
        };
        (transport, peer)
    }

    /// Queue one text frame for the remote end. Fails once the other side
    /// has gone away.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    /// Next event. A vanished peer reads as a close without reason.
    pub async fn recv(&mut self) -> TransportEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(None))
    }
}

/// The far side of a [`Transport`].
pub struct Peer {
    inbound: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl Peer {
    /// Push one inbound text frame. Returns false if the transport is gone.
    pub fn deliver(&self, text: impl Into<String>) -> bool {
        self.inbound
            .send(TransportEvent::Message(text.into()))
            .is_ok()
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self
            .inbound
            .send(TransportEvent::Closed(reason.map(str::to_string)));
    }

    pub fn fail(&self, err: TransportError) {
        let _ = self.inbound.send(TransportEvent::Error(err));
    }

    /// Next frame the engine sent, or `None` once the transport is dropped
    /// and everything it sent has been read.
    pub async fn recv_outbound(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_recv_outbound(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Whether the engine has let go of the transport.
    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn released(&self) {
        self.cancel.cancelled().await;
    }
}

/// How long a released socket waits for the server's answering close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens real WebSocket connections with `tokio-tungstenite`.
///
/// Each connection gets a socket task. Clones share the task set, so a caller
/// can keep one clone and wait on [`WsConnector::drained`] after the client
/// has shut down.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    sockets: TaskTracker,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once every socket task has written its pending frames and
    /// finished the close handshake. Sockets that are still live keep this
    /// pending until their transport is released.
    pub async fn drained(&self) {
        self.sockets.close();
        self.sockets.wait().await;
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, TransportError>> {
        let url = url.to_string();
        let sockets = self.sockets.clone();
        async move {
            // connect_async dials before it checks the scheme
            let request = url
                .as_str()
                .into_client_request()
                .map_err(TransportError::from_tungstenite)?;
            uri_mode(request.uri()).map_err(TransportError::from_tungstenite)?;

            let (ws_stream, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(TransportError::from_tungstenite)?;
            debug!(url = %url, "websocket established");

            let (transport, peer) = Transport::pair();
            sockets.spawn(pump(ws_stream, peer));
            Ok(transport)
        }
        .boxed()
    }
}

/// Shuttle frames between a WebSocket and a [`Peer`] until either side goes
/// away.
pub async fn pump<S>(ws_stream: WebSocketStream<S>, peer: Peer)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Peer {
        inbound,
        mut outbound,
        cancel,
    } = peer;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Frames handed over before release still go out
                while let Ok(text) = outbound.try_recv() {
                    if ws_write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                if ws_write.send(Message::Close(None)).await.is_ok() {
                    let answered = async {
                        while let Some(Ok(msg)) = ws_read.next().await {
                            if msg.is_close() {
                                break;
                            }
                        }
                    };
                    if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, answered).await.is_err() {
                        debug!("server never answered close");
                    }
                }
                break;
            }

            text = outbound.recv() => {
                match text {
                    Some(text) => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            let _ = inbound.send(TransportEvent::Error(TransportError::from_tungstenite(e)));
                            break;
                        }
                    }
                    None => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound.send(TransportEvent::Message(text.to_string()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            let _ = inbound.send(TransportEvent::Message(text));
                        }
                        Err(_) => warn!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        let _ = inbound.send(TransportEvent::Closed(reason));
                        break;
                    }
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inbound.send(TransportEvent::Error(TransportError::from_tungstenite(e)));
                        break;
                    }
                    None => {
                        let _ = inbound.send(TransportEvent::Closed(None));
                        break;
                    }
                }
            }
        }
    }

    let unsent = discard_unsent(&mut outbound);
    if unsent > 0 {
        warn!(unsent, "connection ended before queued frames were written");
    }
}

/// Empty whatever the engine handed over but the socket never wrote.
fn discard_unsent(outbound: &mut mpsc::UnboundedReceiver<String>) -> usize {
    outbound.close();
    let mut unsent = 0;
    while outbound.try_recv().is_ok() {
        unsent += 1;
    }
    unsent
}
