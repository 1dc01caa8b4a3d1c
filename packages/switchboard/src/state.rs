//! Connection state machine: states, triggers, and the effects each
//! transition asks the engine to carry out.
//!
//! `Lifecycle` does no I/O. The engine feeds it triggers (a `connect()` call,
//! a finished attempt, a dropped link, an expired timer) and executes the
//! returned [`Effect`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Explicit `connect()` from a collaborator.
    Connect,
    /// The transport reported a successful establishment.
    Opened,
    /// A connect attempt failed, or an open link closed or errored.
    Lost { fatal: bool },
    /// The backoff timer fired.
    RetryElapsed,
    /// Explicit `disconnect()` or teardown.
    Disconnect,
}

/// Work the engine must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing changed.
    None,
    /// Drop any transport and start a fresh connect attempt.
    StartAttempt,
    /// The link is up: drain the outbound queue.
    Flush,
    /// Drop the transport and retry after the delay.
    ScheduleRetry(Duration),
    /// Drop the transport, abandon any attempt, cancel any timer.
    Release,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot apply {trigger:?} while {from}")]
    InvalidTransition { from: ConnectionState, trigger: Trigger },
}

/// The connection lifecycle and its counters.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    /// Feeds the backoff policy. Reset only on entry to `Open`.
    reconnect_counter: u32,
    /// Failures since the last explicit connect or successful open.
    budget_used: u32,
    max_reconnect_attempts: Option<u32>,
    backoff: Backoff,
}

impl Lifecycle {
    pub fn new(backoff: Backoff, max_reconnect_attempts: Option<u32>) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect_counter: 0,
            budget_used: 0,
            max_reconnect_attempts,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_counter(&self) -> u32 {
        self.reconnect_counter
    }

    pub fn apply(&mut self, trigger: Trigger) -> Result<Effect, TransitionError> {
        use ConnectionState::*;

        let effect = match (self.state, trigger) {
            (Idle | Closed | Failed, Trigger::Connect) => {
                self.budget_used = 0;
                self.state = Connecting;
                Effect::StartAttempt
            }
            (Connecting | Open | Reconnecting, Trigger::Connect) => Effect::None,

            (Connecting, Trigger::Opened) => {
                self.reconnect_counter = 0;
                self.budget_used = 0;
                self.state = Open;
                Effect::Flush
            }

            (Connecting | Open | Reconnecting, Trigger::Lost { fatal: true }) => {
                self.state = Failed;
                Effect::Release
            }
            (Connecting | Open, Trigger::Lost { fatal: false }) => {
                self.reconnect_counter = self.reconnect_counter.saturating_add(1);
                self.budget_used = self.budget_used.saturating_add(1);
                if self
                    .max_reconnect_attempts
                    .is_some_and(|max| self.budget_used > max)
                {
                    self.state = Failed;
                    Effect::Release
                } else {
                    self.state = Reconnecting;
                    Effect::ScheduleRetry(self.backoff.delay(self.reconnect_counter))
                }
            }

            (Reconnecting, Trigger::RetryElapsed) => {
                self.state = Connecting;
                Effect::StartAttempt
            }

            (Closed, Trigger::Disconnect) => Effect::None,
            (_, Trigger::Disconnect) => {
                self.state = Closed;
                Effect::Release
            }

            (from, trigger) => {
                return Err(TransitionError::InvalidTransition { from, trigger });
            }
        };
        Ok(effect)
    }
}
