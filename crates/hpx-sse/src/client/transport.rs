//! Transport abstraction consumed by the connection registry.
//!
//! An [`EventTransport`] is one physical push channel (for HTTP, one
//! long-lived response). It reports three kinds of notifications, keyed by
//! name the way a browser `EventSource` does: [`OPEN_EVENT`],
//! [`ERROR_EVENT`], and one name per message event type.
//!
//! Transports never reconnect by themselves. After an error they are dead;
//! [`Subscription`](super::Subscription) decides whether to acquire a new one.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use http::HeaderMap;
use parking_lot::Mutex;

/// Listener name for the open notification.
pub const OPEN_EVENT: &str = "open";

/// Listener name for the error notification.
pub const ERROR_EVENT: &str = "error";

/// A message delivered by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    /// Event type.
    pub event: String,
    /// Raw data payload.
    pub data: String,
    /// Last event id seen on the connection (empty when none was sent).
    pub last_event_id: String,
}

impl MessageEvent {
    /// Create a message event.
    pub fn new(
        event: impl Into<String>,
        data: impl Into<String>,
        last_event_id: impl Into<String>,
    ) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            last_event_id: last_event_id.into(),
        }
    }
}

/// Notification emitted by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established.
    Open,
    /// A message arrived.
    Message(MessageEvent),
    /// The connection failed or ended. Terminal for the transport.
    Error {
        /// Human-readable cause.
        message: String,
    },
}

impl TransportEvent {
    /// Create an error notification.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Listener name this notification is dispatched under.
    pub fn name(&self) -> &str {
        match self {
            Self::Open => OPEN_EVENT,
            Self::Message(message) => &message.event,
            Self::Error { .. } => ERROR_EVENT,
        }
    }
}

/// Callback invoked for transport notifications.
pub type TransportCallback = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// One physical push channel.
pub trait EventTransport: Send + Sync + 'static {
    /// Attach a listener for a notification name.
    fn add_event_listener(&self, event: &str, callback: TransportCallback);

    /// Stop the transport. No further notifications are delivered.
    fn close(&self);

    /// Reconnect delay advised by the server, if any.
    ///
    /// Default implementation returns `None`.
    fn retry_hint(&self) -> Option<Duration> {
        None
    }

    /// Whether the open notification has already fired. Listeners attached
    /// to a shared transport after that point never see it.
    fn is_open(&self) -> bool {
        false
    }

    /// Cause of the terminal error once it has fired. A transport can fail
    /// before anyone listens, so late listeners check this instead.
    fn terminal_error(&self) -> Option<String> {
        None
    }
}

/// Options used when a transport is created.
#[derive(Clone, Debug)]
pub struct TransportInit {
    /// Extra request headers.
    pub headers: HeaderMap,
    /// Sent as `Last-Event-ID` so the server can resume.
    pub last_event_id: Option<String>,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
}

impl Default for TransportInit {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            last_event_id: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Creates physical transports for the registry.
pub trait TransportFactory: Send + Sync + 'static {
    /// Open a transport for `url`.
    fn connect(&self, url: &str, init: &TransportInit) -> Arc<dyn EventTransport>;
}

/// Listener table for transport implementations.
///
/// Callbacks run outside the lock, so a callback may add listeners.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Mutex<HashMap<String, Vec<TransportCallback>>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let mut names: Vec<&String> = listeners.keys().collect();
        names.sort();
        f.debug_struct("EventDispatcher")
            .field("events", &names)
            .finish()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener.
    pub fn add(&self, event: &str, callback: TransportCallback) {
        self.listeners
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    /// Deliver a notification to every listener for its name, returning how
    /// many were invoked.
    pub fn dispatch(&self, event: &TransportEvent) -> usize {
        let callbacks = self
            .listeners
            .lock()
            .get(event.name())
            .cloned()
            .unwrap_or_default();
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    /// Number of listeners attached for a name.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map_or(0, Vec::len)
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}
