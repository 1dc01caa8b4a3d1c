//! In-memory connector that plays back a scripted sequence of connect
//! outcomes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;

use switchboard::{
    Client, ClientConfig, ConnectionState, Connector, Peer, Transport, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Transient failure, as if nothing is listening.
    Refuse,
    /// Fatal failure, as if the server answered 403.
    Reject,
    /// Succeed and hand the peer to the test.
    Accept,
    /// Succeed, but the far side is already gone, so the first write fails.
    AcceptDead,
    /// Never complete.
    Hang,
}

struct Script {
    plan: VecDeque<Outcome>,
    fallback: Outcome,
    attempts: Vec<Instant>,
}

#[derive(Clone)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    peers: mpsc::UnboundedSender<Peer>,
}

impl ScriptedConnector {
    /// Plays `plan`, then refuses every later attempt.
    pub fn new(plan: impl IntoIterator<Item = Outcome>) -> (Self, mpsc::UnboundedReceiver<Peer>) {
        Self::with_fallback(plan, Outcome::Refuse)
    }

    pub fn with_fallback(
        plan: impl IntoIterator<Item = Outcome>,
        fallback: Outcome,
    ) -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(Script {
                plan: plan.into_iter().collect(),
                fallback,
                attempts: Vec::new(),
            })),
            peers,
        };
        (connector, rx)
    }

    /// When each attempt started.
    pub fn attempts(&self) -> Vec<Instant> {
        self.script.lock().unwrap().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.script.lock().unwrap().attempts.len()
    }

    pub fn push(&self, outcome: Outcome) {
        self.script.lock().unwrap().plan.push_back(outcome);
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Transport, TransportError>> {
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push(Instant::now());
            let fallback = script.fallback;
            script.plan.pop_front().unwrap_or(fallback)
        };
        let peers = self.peers.clone();

        async move {
            match outcome {
                Outcome::Refuse => Err(TransportError::Unavailable("connection refused".into())),
                Outcome::Reject => Err(TransportError::Rejected("HTTP 403 Forbidden".into())),
                Outcome::Accept => {
                    let (transport, peer) = Transport::pair();
                    let _ = peers.send(peer);
                    Ok(transport)
                }
                Outcome::AcceptDead => {
                    let (transport, peer) = Transport::pair();
                    drop(peer);
                    Ok(transport)
                }
                Outcome::Hang => std::future::pending().await,
            }
        }
        .boxed()
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::with_url("ws://dashboard.test/ws")
}

/// Wait for the next accepted peer and for the client to report `Open`.
pub async fn opened(client: &Client, peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    let peer = peers.recv().await.expect("connector dropped");
    assert_eq!(
        client.wait_for_state(ConnectionState::Open).await,
        ConnectionState::Open
    );
    peer
}

/// Drain frames the client has written so far, decoded as JSON.
pub fn written(peer: &mut Peer) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Some(text) = peer.try_recv_outbound() {
        frames.push(serde_json::from_str(&text).expect("client wrote invalid JSON"));
    }
    frames
}

pub async fn settle() {
    // Let the engine task drain its command queue
    tokio::time::sleep(Duration::from_millis(1)).await;
}
