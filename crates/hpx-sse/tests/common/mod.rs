//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hpx_sse::client::{
    ConnectionRegistry, EventDispatcher, EventTransport, MessageEvent, TransportCallback,
    TransportEvent, TransportFactory, TransportInit,
};
use parking_lot::Mutex;

/// In-memory transport driven by the test.
pub struct MockTransport {
    pub url: String,
    pub init: TransportInit,
    dispatcher: EventDispatcher,
    open: AtomicBool,
    closed: AtomicBool,
    retry: Mutex<Option<Duration>>,
    failed: Mutex<Option<String>>,
    close_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    fn new(url: &str, init: &TransportInit) -> Self {
        Self {
            url: url.to_string(),
            init: init.clone(),
            dispatcher: EventDispatcher::new(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            retry: Mutex::new(None),
            failed: Mutex::new(None),
            close_delay: Mutex::new(None),
        }
    }

    pub fn emit_open(&self) -> usize {
        self.open.store(true, Ordering::SeqCst);
        self.dispatcher.dispatch(&TransportEvent::Open)
    }

    pub fn emit_message(&self, event: &str, data: &str, id: &str) -> usize {
        self.dispatcher
            .dispatch(&TransportEvent::Message(MessageEvent::new(event, data, id)))
    }

    pub fn emit_error(&self, message: &str) -> usize {
        self.open.store(false, Ordering::SeqCst);
        *self.failed.lock() = Some(message.to_string());
        self.dispatcher.dispatch(&TransportEvent::error(message))
    }

    pub fn set_retry(&self, delay: Duration) {
        *self.retry.lock() = Some(delay);
    }

    /// Make `close` block the calling thread after marking the transport
    /// closed.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn physical_listeners(&self, event: &str) -> usize {
        self.dispatcher.listener_count(event)
    }
}

impl EventTransport for MockTransport {
    fn add_event_listener(&self, event: &str, callback: TransportCallback) {
        self.dispatcher.add(event, callback);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.dispatcher.clear();
        let delay = *self.close_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }

    fn retry_hint(&self) -> Option<Duration> {
        *self.retry.lock()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn terminal_error(&self) -> Option<String> {
        self.failed.lock().clone()
    }
}

/// Factory recording every transport it creates.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
    fail_on_connect: Mutex<Option<String>>,
}

impl MockFactory {
    /// Make every new transport fail before `connect` returns, so the
    /// error fires while nobody is listening.
    pub fn fail_on_connect(&self, message: Option<&str>) {
        *self.fail_on_connect.lock() = message.map(str::to_string);
    }

    /// Number of `connect` calls, i.e. physical acquires.
    pub fn connects(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        Arc::clone(self.created.lock().last().expect("no transport created"))
    }

    pub fn get(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.created.lock()[index])
    }
}

impl TransportFactory for MockFactory {
    fn connect(&self, url: &str, init: &TransportInit) -> Arc<dyn EventTransport> {
        let transport = Arc::new(MockTransport::new(url, init));
        if let Some(message) = self.fail_on_connect.lock().as_deref() {
            transport.emit_error(message);
        }
        self.created.lock().push(Arc::clone(&transport));
        transport
    }
}

pub fn mock_registry() -> (Arc<ConnectionRegistry>, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    let registry = ConnectionRegistry::with_factory(Arc::clone(&factory) as _);
    (Arc::new(registry), factory)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
