//! Reference-counted sharing of transports across subscribers.
//!
//! Subscribers of the same URL share one physical transport. Each event
//! name gets a single physical listener on that transport the first time
//! anyone listens for it; the registry fans notifications out to the
//! logical listeners it tracks.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::transport::{
    EventTransport, TransportCallback, TransportEvent, TransportFactory, TransportInit,
};

type ListenerTable = HashMap<String, Vec<TransportCallback>>;

struct ConnectionRecord {
    transport: Arc<dyn EventTransport>,
    ref_count: usize,
    listeners: Arc<Mutex<ListenerTable>>,
}

/// Shared transports keyed by URL.
///
/// Invariant: a URL has an entry iff its reference count is positive, and
/// every entry owns exactly one transport.
pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    connections: Mutex<HashMap<String, ConnectionRecord>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connections = self.connections.lock();
        let mut counts: Vec<(&String, usize)> = connections
            .iter()
            .map(|(url, record)| (url, record.ref_count))
            .collect();
        counts.sort();
        f.debug_struct("ConnectionRegistry")
            .field("connections", &counts)
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Create a registry opening transports through `factory`.
    pub fn new(factory: impl TransportFactory) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    /// Create a registry from a shared factory.
    pub fn with_factory(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Create a registry backed by HTTP transports.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    #[cfg(feature = "http-client")]
    pub fn http() -> crate::error::SseResult<Self> {
        Ok(Self::new(super::http::HttpTransportFactory::new()?))
    }

    /// Take a reference to the transport for `url`, opening it if this is
    /// the first reference. `init` only applies when a transport is opened.
    pub fn acquire(&self, url: &str, init: Option<&TransportInit>) -> Arc<dyn EventTransport> {
        let mut connections = self.connections.lock();
        let record = connections.entry(url.to_string()).or_insert_with(|| {
            info!(url, "Opening shared SSE transport");
            let transport = match init {
                Some(init) => self.factory.connect(url, init),
                None => self.factory.connect(url, &TransportInit::default()),
            };
            ConnectionRecord {
                transport,
                ref_count: 0,
                listeners: Arc::new(Mutex::new(HashMap::new())),
            }
        });
        record.ref_count += 1;
        debug!(url, ref_count = record.ref_count, "Acquired SSE transport");
        Arc::clone(&record.transport)
    }

    /// Drop a reference. The last release closes the transport and forgets
    /// its listeners. Unknown URLs are ignored.
    pub fn release(&self, url: &str) {
        let removed = {
            let mut connections = self.connections.lock();
            let Some(record) = connections.get_mut(url) else {
                debug!(url, "Release of unknown SSE transport ignored");
                return;
            };
            record.ref_count = record.ref_count.saturating_sub(1);
            if record.ref_count > 0 {
                debug!(url, ref_count = record.ref_count, "Released SSE transport");
                return;
            }
            connections.remove(url)
        };

        if let Some(record) = removed {
            info!(url, "Closing shared SSE transport");
            record.transport.close();
        }
    }

    /// Add a logical listener. Returns `false` when `url` has no live
    /// connection. Adding the same callback twice is a no-op.
    pub fn add_listener(&self, url: &str, event: &str, callback: TransportCallback) -> bool {
        let attach = {
            let connections = self.connections.lock();
            let Some(record) = connections.get(url) else {
                return false;
            };
            let mut table = record.listeners.lock();
            let first = !table.contains_key(event);
            let set = table.entry(event.to_string()).or_default();
            if !set.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
                set.push(callback);
            }
            first.then(|| {
                (
                    Arc::clone(&record.transport),
                    Arc::downgrade(&record.listeners),
                )
            })
        };

        if let Some((transport, listeners)) = attach {
            debug!(url, event, "Attaching physical SSE listener");
            transport.add_event_listener(event, fan_out(listeners));
        }
        true
    }

    /// Remove a logical listener by identity. The physical listener stays
    /// attached until the transport closes.
    pub fn remove_listener(&self, url: &str, event: &str, callback: &TransportCallback) -> bool {
        let connections = self.connections.lock();
        let Some(record) = connections.get(url) else {
            return false;
        };
        let mut table = record.listeners.lock();
        let Some(set) = table.get_mut(event) else {
            return false;
        };
        let before = set.len();
        set.retain(|existing| !Arc::ptr_eq(existing, callback));
        before != set.len()
    }

    /// Current reference count for `url` (0 when absent).
    pub fn ref_count(&self, url: &str) -> usize {
        self.connections
            .lock()
            .get(url)
            .map_or(0, |record| record.ref_count)
    }

    /// Logical listeners registered for `event` on `url`.
    pub fn listener_count(&self, url: &str, event: &str) -> usize {
        self.connections.lock().get(url).map_or(0, |record| {
            record.listeners.lock().get(event).map_or(0, Vec::len)
        })
    }

    pub fn contains(&self, url: &str) -> bool {
        self.connections.lock().contains_key(url)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

fn fan_out(listeners: Weak<Mutex<ListenerTable>>) -> TransportCallback {
    Arc::new(move |event: &TransportEvent| {
        let Some(listeners) = listeners.upgrade() else {
            return;
        };
        let callbacks = listeners
            .lock()
            .get(event.name())
            .cloned()
            .unwrap_or_default();
        for callback in &callbacks {
            callback(event);
        }
    })
}
