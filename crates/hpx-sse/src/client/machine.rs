//! Subscription state machine.
//!
//! Pure: every input returns the side effects the runtime must perform, so
//! the transitions are testable without timers or transports.
//!
//! ```text
//!            start / retry elapsed
//!   ┌───────────────────────────────┐
//!   ▼                               │
//! Connecting ──open──► Open ──error─┤ attempts < max
//!   │                   │           │
//!   └─────error─────────┴───────────┴─► Closed (no reconnect / exhausted / close)
//! ```

use std::{fmt, time::Duration};

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{reconnect::ReconnectPolicy, transport::MessageEvent};

/// Connection state observed by subscribers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Waiting for the transport to open, including the wait before a retry.
    #[default]
    Connecting,
    /// The transport is delivering events.
    Open,
    /// Terminal until reopened.
    Closed,
}

impl ConnectionState {
    /// Returns the string name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced in a [`SubscriptionSnapshot`].
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionError {
    /// A message payload was not valid for the target type.
    #[error("{message}")]
    Parse { message: String },

    /// The transport failed.
    #[error("{message}")]
    Transport { message: String },
}

impl SubscriptionError {
    /// Whether the error came from a malformed payload.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// What subscribers observe.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionSnapshot<T> {
    /// Most recent successfully parsed payload.
    pub data: Option<T>,
    /// Most recent error; cleared by the next good message.
    pub error: Option<SubscriptionError>,
    /// Id of the most recent message that carried one.
    pub last_event_id: Option<String>,
    pub state: ConnectionState,
}

impl<T> Default for SubscriptionSnapshot<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            last_event_id: None,
            state: ConnectionState::Connecting,
        }
    }
}

/// Side effect requested by the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Acquire the transport and attach listeners tagged with `generation`.
    Attach { generation: u64 },
    /// Remove listeners and release the transport.
    Detach,
    /// Feed `on_retry_elapsed` after `delay`.
    ScheduleRetry { delay: Duration },
    /// Drop the pending retry timer.
    CancelRetry,
}

/// Reconnecting subscription transitions.
///
/// Notifications carry the generation of the attach that produced them;
/// anything from an older attach is ignored.
#[derive(Debug)]
pub struct SubscriptionMachine<T> {
    policy: Option<ReconnectPolicy>,
    attempt_count: u32,
    generation: u64,
    attached: bool,
    retry_pending: bool,
    snapshot: SubscriptionSnapshot<T>,
}

impl<T: DeserializeOwned> SubscriptionMachine<T> {
    /// Create a machine. `None` disables reconnection.
    pub fn new(policy: Option<ReconnectPolicy>) -> Self {
        Self {
            policy,
            attempt_count: 0,
            generation: 0,
            attached: false,
            retry_pending: false,
            snapshot: SubscriptionSnapshot::default(),
        }
    }

    pub fn snapshot(&self) -> &SubscriptionSnapshot<T> {
        &self.snapshot
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.state
    }

    /// Reconnection attempts since the last successful open.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Generation of the current (or most recent) attach.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Begin (or resume after close) connecting. No-op while already
    /// attached or waiting to retry.
    pub fn start(&mut self) -> Vec<Effect> {
        if self.attached || self.retry_pending {
            return Vec::new();
        }
        self.attempt_count = 0;
        self.attach()
    }

    pub fn on_open(&mut self, generation: u64) -> Vec<Effect> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        self.snapshot.state = ConnectionState::Open;
        self.attempt_count = 0;
        Vec::new()
    }

    /// Parse a message. A malformed payload records an error and leaves
    /// `data` and `state` untouched.
    pub fn on_message(&mut self, generation: u64, message: &MessageEvent) -> Vec<Effect> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        match serde_json::from_str::<T>(&message.data) {
            Ok(data) => {
                self.snapshot.data = Some(data);
                self.snapshot.error = None;
                if !message.last_event_id.is_empty() {
                    self.snapshot.last_event_id = Some(message.last_event_id.clone());
                }
            }
            Err(err) => {
                self.snapshot.error = Some(SubscriptionError::Parse {
                    message: format!("Failed to parse event data: {err}"),
                });
            }
        }
        Vec::new()
    }

    /// The transport failed. Schedules a retry while attempts remain,
    /// otherwise closes.
    pub fn on_error(
        &mut self,
        generation: u64,
        message: &str,
        retry_hint: Option<Duration>,
    ) -> Vec<Effect> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        self.attached = false;
        self.snapshot.error = Some(SubscriptionError::Transport {
            message: message.to_string(),
        });

        let mut effects = vec![Effect::Detach];
        match self.policy {
            Some(policy) if self.attempt_count < policy.max_attempts => {
                let delay = policy.delay_for(self.attempt_count, retry_hint);
                self.attempt_count += 1;
                self.retry_pending = true;
                self.snapshot.state = ConnectionState::Connecting;
                effects.push(Effect::ScheduleRetry { delay });
            }
            _ => self.snapshot.state = ConnectionState::Closed,
        }
        effects
    }

    pub fn on_retry_elapsed(&mut self) -> Vec<Effect> {
        if !self.retry_pending {
            return Vec::new();
        }
        self.retry_pending = false;
        self.attach()
    }

    /// Close: cancel any pending retry, detach, and stay closed.
    pub fn close(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.retry_pending {
            self.retry_pending = false;
            effects.push(Effect::CancelRetry);
        }
        if self.attached {
            self.attached = false;
            effects.push(Effect::Detach);
        }
        self.snapshot.state = ConnectionState::Closed;
        effects
    }

    fn attach(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.attached = true;
        self.snapshot.state = ConnectionState::Connecting;
        vec![Effect::Attach {
            generation: self.generation,
        }]
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attached && generation == self.generation
    }
}
