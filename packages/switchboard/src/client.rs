//! The handle collaborators hold.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::ClientConfig;
use crate::dispatch::{HandlerFailure, HandlerId};
use crate::engine::{Command, Engine, Stats};
use crate::envelope::Envelope;
use crate::state::ConnectionState;
use crate::transport::Connector;

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Cheap-to-clone handle on one engine. Every clone shares the same
/// connection, queue and subscriptions.
///
/// `connect`, `disconnect`, `send` and `subscribe` never block and never fail:
/// they are forwarded to the engine task. Once the engine has shut down they
/// do nothing.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    failures: broadcast::Sender<HandlerFailure>,
}

impl Client {
    /// Start the engine task. Must be called inside a tokio runtime.
    pub fn spawn(config: ClientConfig, connector: impl Connector) -> Self {
        Self::spawn_shared(config, Arc::new(connector))
    }

    pub fn spawn_shared(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (failures_tx, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);

        let engine = Engine::new(
            &config,
            connector,
            commands_rx,
            state_tx,
            failures_tx.clone(),
        );
        tokio::spawn(engine.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            failures: failures_tx,
        }
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Deliver now if open, otherwise queue until the next open.
    pub fn send(&self, envelope: Envelope) {
        self.command(Command::Send(envelope));
    }

    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) {
        self.send(Envelope::new(event_type, data));
    }

    /// Call `handler` for every inbound envelope of `event_type` until the
    /// returned subscription is unsubscribed.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: FnMut(&Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        let id = HandlerId::next();
        self.command(Command::Subscribe {
            id,
            event_type: event_type.into(),
            handler: Box::new(handler),
        });
        Subscription {
            id,
            commands: self.commands.downgrade(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Like [`subscribe`](Self::subscribe), but envelopes arrive on a channel.
    /// The channel closes when the subscription ends or the engine stops.
    pub fn subscribe_channel(
        &self,
        event_type: impl Into<String>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(event_type, move |envelope| {
            // A dropped receiver just stops listening
            let _ = tx.send(envelope.clone());
            Ok(())
        });
        (subscription, rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolve once the connection reaches `target`. Returns the state seen
    /// last if the engine stops first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(|state| *state == target).await {
            return *state;
        }
        *rx.borrow()
    }

    /// Failures of any subscriber, from now on.
    pub fn handler_failures(&self) -> broadcast::Receiver<HandlerFailure> {
        self.failures.subscribe()
    }

    /// `None` once the engine has stopped.
    pub async fn stats(&self) -> Option<Stats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Stats { respond_to: tx }).ok()?;
        rx.await.ok()
    }

    /// Close the connection, drop every subscription and stop the engine.
    /// Affects every clone.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { respond_to: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn command(&self, cmd: Command) {
        // Engine gone means shut down; nothing left to do
        let _ = self.commands.send(cmd);
    }
}

/// A live registration returned by [`Client::subscribe`].
///
/// Dropping it does not unsubscribe. Clones share the registration, so
/// `unsubscribe` through any of them ends it once.
#[derive(Clone)]
pub struct Subscription {
    id: HandlerId,
    commands: mpsc::WeakUnboundedSender<Command>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery to this handler. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Unsubscribe(self.id));
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
