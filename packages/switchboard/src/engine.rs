//! The engine task: sole owner of the transport, lifecycle, outbound queue and
//! dispatcher.
//!
//! Every state change happens inside [`Engine::run`], one wake-up at a time:
//! a command from a [`Client`](crate::Client), the result of a connect
//! attempt, an event on the live transport, or the backoff timer. Nothing the
//! engine owns is shared, so none of it is locked.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::dispatch::{Dispatcher, Handler, HandlerFailure, HandlerId};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::queue::OutboundQueue;
use crate::state::{ConnectionState, Effect, Lifecycle, Trigger};
use crate::transport::{Connector, Transport, TransportEvent};

/// Requests from client handles to the engine task.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(Envelope),
    Subscribe {
        id: HandlerId,
        event_type: String,
        handler: Handler,
    },
    Unsubscribe(HandlerId),
    Stats {
        respond_to: oneshot::Sender<Stats>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Point-in-time counters for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub state: ConnectionState,
    /// Envelopes waiting for the connection to open.
    pub queued: usize,
    /// Envelopes discarded by a bounded queue.
    pub dropped: u64,
    pub reconnect_counter: u32,
    pub subscriptions: usize,
    /// Envelopes handed to a live transport.
    pub sent: u64,
    /// Inbound envelopes decoded and dispatched.
    pub received: u64,
    /// Inbound frames discarded as malformed.
    pub malformed: u64,
}

type Attempt = BoxFuture<'static, Result<Transport, TransportError>>;

enum Wake {
    Command(Command),
    Attempt(Result<Transport, TransportError>),
    Transport(TransportEvent),
    RetryDue,
}

pub(crate) struct Engine {
    url: String,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    lifecycle: Lifecycle,
    queue: OutboundQueue,
    dispatcher: Dispatcher,
    transport: Option<Transport>,
    attempt: Option<Attempt>,
    retry_at: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    sent: u64,
    received: u64,
    malformed: u64,
}

impl Engine {
    pub(crate) fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        failures_tx: broadcast::Sender<HandlerFailure>,
    ) -> Self {
        let queue = match config.queue.capacity {
            Some(capacity) => OutboundQueue::bounded(capacity, config.queue.overflow),
            None => OutboundQueue::unbounded(),
        };
        let dispatcher = Dispatcher::with_observer(Box::new(move |failure| {
            // No receivers is fine
            let _ = failures_tx.send(failure);
        }));

        Self {
            url: config.url.clone(),
            connector,
            connect_timeout: config.connect_timeout(),
            lifecycle: Lifecycle::new(config.backoff(), config.max_reconnect_attempts),
            queue,
            dispatcher,
            transport: None,
            attempt: None,
            retry_at: None,
            commands,
            state_tx,
            sent: 0,
            received: 0,
            malformed: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(url = %self.url, "engine started");

        loop {
            let wake = tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => Wake::Command(cmd),
                    None => break,
                },
                result = next_attempt(&mut self.attempt) => Wake::Attempt(result),
                event = next_event(&mut self.transport) => Wake::Transport(event),
                () = retry_due(self.retry_at) => Wake::RetryDue,
            };

            match wake {
                Wake::Command(Command::Shutdown { respond_to }) => {
                    self.teardown();
                    let _ = respond_to.send(());
                    return;
                }
                Wake::Command(cmd) => self.on_command(cmd),
                Wake::Attempt(result) => self.on_attempt(result),
                Wake::Transport(event) => self.on_transport(event),
                Wake::RetryDue => {
                    self.retry_at = None;
                    self.drive(Trigger::RetryElapsed);
                }
            }
        }

        // Every handle is gone
        self.teardown();
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.drive(Trigger::Connect),
            Command::Disconnect => self.drive(Trigger::Disconnect),
            Command::Send(envelope) => self.send(envelope),
            Command::Subscribe {
                id,
                event_type,
                handler,
            } => {
                debug!(handler = %id, event_type = %event_type, "subscribed");
                self.dispatcher.insert(id, event_type, handler);
            }
            Command::Unsubscribe(id) => {
                if self.dispatcher.unsubscribe(id) {
                    debug!(handler = %id, "unsubscribed");
                }
            }
            Command::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            Command::Shutdown { respond_to } => {
                // Handled by the run loop
                let _ = respond_to.send(());
            }
        }
    }

    fn on_attempt(&mut self, result: Result<Transport, TransportError>) {
        match result {
            Ok(transport) => {
                if self.lifecycle.state() != ConnectionState::Connecting {
                    return;
                }
                self.transport = Some(transport);
                self.drive(Trigger::Opened);
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, fatal = err.is_fatal(), "connect attempt failed");
                self.drive(Trigger::Lost {
                    fatal: err.is_fatal(),
                });
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.deliver(&text),
            TransportEvent::Closed(reason) => {
                info!(url = %self.url, reason = reason.as_deref().unwrap_or("none"), "connection closed by remote");
                self.drive(Trigger::Lost { fatal: false });
            }
            TransportEvent::Error(err) => {
                warn!(url = %self.url, error = %err, "connection error");
                self.drive(Trigger::Lost {
                    fatal: err.is_fatal(),
                });
            }
        }
    }

    fn deliver(&mut self, text: &str) {
        if self.lifecycle.state() != ConnectionState::Open {
            return;
        }
        match Envelope::decode(text) {
            Ok(envelope) => {
                self.received += 1;
                let delivered = self.dispatcher.dispatch(&envelope);
                debug!(event_type = %envelope.event_type(), delivered, "dispatched");
            }
            Err(err) => {
                self.malformed += 1;
                warn!(error = %err, len = text.len(), "dropping malformed inbound frame");
            }
        }
    }

    fn send(&mut self, envelope: Envelope) {
        if self.lifecycle.state() == ConnectionState::Open {
            if let Some(transport) = &self.transport {
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        error!(event_type = %envelope.event_type(), error = %err, "cannot encode envelope");
                        return;
                    }
                };
                match transport.send(text) {
                    Ok(()) => {
                        self.sent += 1;
                        return;
                    }
                    Err(err) => {
                        warn!(error = %err, "send failed, requeueing");
                        self.enqueue(envelope);
                        self.drive(Trigger::Lost {
                            fatal: err.is_fatal(),
                        });
                        return;
                    }
                }
            }
        }
        self.enqueue(envelope);
    }

    fn enqueue(&mut self, envelope: Envelope) {
        let event_type = envelope.event_type().to_string();
        match self.queue.enqueue(envelope) {
            Some(discarded) => warn!(
                discarded = %discarded.event_type(),
                dropped_total = self.queue.dropped(),
                "outbound queue full"
            ),
            None => debug!(
                event_type = %event_type,
                queued = self.queue.len(),
                state = %self.lifecycle.state(),
                "queued envelope"
            ),
        }
    }

    fn flush(&mut self) {
        let Some(transport) = &self.transport else {
            return;
        };
        let result = self.queue.flush(|envelope| match envelope.encode() {
            Ok(text) => transport.send(text),
            Err(err) => {
                error!(event_type = %envelope.event_type(), error = %err, "cannot encode queued envelope");
                Ok(())
            }
        });
        match result {
            Ok(0) => {}
            Ok(n) => {
                self.sent += n as u64;
                info!(flushed = n, "flushed outbound queue");
            }
            Err(err) => {
                warn!(error = %err, remaining = self.queue.len(), "flush interrupted");
                self.drive(Trigger::Lost {
                    fatal: err.is_fatal(),
                });
            }
        }
    }

    /// Feed one trigger to the lifecycle and carry out its effect.
    fn drive(&mut self, trigger: Trigger) {
        let from = self.lifecycle.state();
        let effect = match self.lifecycle.apply(trigger) {
            Ok(effect) => effect,
            Err(err) => {
                debug!("ignoring trigger: {}", err);
                return;
            }
        };
        let to = self.lifecycle.state();
        if from != to {
            info!(url = %self.url, from = %from, to = %to, "connection state changed");
            self.state_tx.send_replace(to);
        }

        match effect {
            Effect::None => {}
            Effect::StartAttempt => {
                self.release();
                self.start_attempt();
            }
            Effect::Flush => self.flush(),
            Effect::ScheduleRetry(delay) => {
                self.release();
                info!(
                    attempt = self.lifecycle.reconnect_counter(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            Effect::Release => self.release(),
        }
    }

    fn start_attempt(&mut self) {
        info!(url = %self.url, attempt = self.lifecycle.reconnect_counter(), "connecting");
        let connecting = self.connector.connect(&self.url);
        let timeout = self.connect_timeout;
        self.attempt = Some(
            async move {
                tokio::time::timeout(timeout, connecting)
                    .await
                    .unwrap_or(Err(TransportError::Timeout(timeout)))
            }
            .boxed(),
        );
    }

    /// Drop the live transport, any in-flight attempt and any pending retry.
    fn release(&mut self) {
        self.transport = None;
        self.attempt = None;
        self.retry_at = None;
    }

    fn teardown(&mut self) {
        self.drive(Trigger::Disconnect);
        self.dispatcher.clear();
        if !self.queue.is_empty() {
            warn!(discarded = self.queue.len(), "shutting down with unsent envelopes");
        }
        info!(url = %self.url, "engine stopped");
    }

    fn stats(&self) -> Stats {
        Stats {
            state: self.lifecycle.state(),
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
            reconnect_counter: self.lifecycle.reconnect_counter(),
            subscriptions: self.dispatcher.len(),
            sent: self.sent,
            received: self.received,
            malformed: self.malformed,
        }
    }
}

async fn next_attempt(attempt: &mut Option<Attempt>) -> Result<Transport, TransportError> {
    let Some(connecting) = attempt.as_mut() else {
        return std::future::pending().await;
    };
    let result = connecting.await;
    *attempt = None;
    result
}

async fn next_event(transport: &mut Option<Transport>) -> TransportEvent {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
