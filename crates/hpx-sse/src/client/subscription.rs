//! Reconnecting subscription runtime.
//!
//! Drives a [`SubscriptionMachine`] from transport callbacks and retry
//! timers. Inputs are queued and applied by whichever caller holds the
//! runtime lock, so a callback fired while another input is being applied
//! never blocks or re-enters the machine.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use http::HeaderMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    machine::{
        ConnectionState, Effect, SubscriptionError, SubscriptionMachine, SubscriptionSnapshot,
    },
    reconnect::ReconnectPolicy,
    registry::ConnectionRegistry,
    transport::{
        ERROR_EVENT, EventTransport, MessageEvent, OPEN_EVENT, TransportCallback, TransportEvent,
        TransportInit,
    },
};
use crate::{
    codec::DEFAULT_EVENT,
    error::{SseError, SseResult},
};

/// Configuration for a [`Subscription`].
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Stream URL; also the registry key.
    pub url: String,
    /// Event type to listen for.
    pub event_name: String,
    /// `None` disables reconnection.
    pub reconnect: Option<ReconnectPolicy>,
    /// Extra request headers, used when this subscription opens the
    /// transport.
    pub headers: HeaderMap,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
}

impl SubscriptionConfig {
    /// Create a configuration for `url` listening to `message` events
    /// without reconnection.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            event_name: DEFAULT_EVENT.to_string(),
            reconnect: None,
            headers: HeaderMap::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the event type.
    #[must_use]
    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = name.into();
        self
    }

    /// Enable reconnection with `policy`.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Disable reconnection.
    #[must_use]
    pub fn no_reconnect(mut self) -> Self {
        self.reconnect = None;
        self
    }

    /// Add a request header.
    #[must_use]
    pub fn header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        if self.event_name.is_empty() {
            return Err("Event name cannot be empty".to_string());
        }
        if self.event_name == OPEN_EVENT || self.event_name == ERROR_EVENT {
            return Err(format!(
                "Event name {:?} is reserved for connection notifications",
                self.event_name
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if let Some(policy) = &self.reconnect {
            policy.validate()?;
        }
        Ok(())
    }
}

enum Input {
    Start,
    Open(u64),
    Message(u64, MessageEvent),
    Error {
        generation: u64,
        message: String,
    },
    RetryElapsed,
    Close,
}

struct Listeners {
    message: TransportCallback,
    open: TransportCallback,
    error: TransportCallback,
}

struct Runtime<T> {
    machine: SubscriptionMachine<T>,
    registry: Arc<ConnectionRegistry>,
    config: SubscriptionConfig,
    transport: Option<Arc<dyn EventTransport>>,
    listeners: Option<Listeners>,
    retry_task: Option<JoinHandle<()>>,
    publisher: watch::Sender<SubscriptionSnapshot<T>>,
    this: Weak<Shared<T>>,
}

struct Shared<T> {
    queue: Mutex<VecDeque<Input>>,
    runtime: Mutex<Runtime<T>>,
}

impl<T> Shared<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Queue `input` from a transport callback or timer. Returns without
    /// waiting when another thread is applying inputs.
    fn submit(&self, input: Input) {
        self.queue.lock().push_back(input);
        self.drain();
    }

    /// Queue `input` from the owner and wait until it has been applied.
    ///
    /// Never called with the runtime lock held: inputs raised while applying
    /// go through [`submit`](Self::submit).
    fn submit_and_wait(&self, input: Input) {
        self.queue.lock().push_back(input);
        let mut runtime = self.runtime.lock();
        self.apply_queued(&mut runtime);
        drop(runtime);
        self.drain();
    }

    fn drain(&self) {
        loop {
            let Some(mut runtime) = self.runtime.try_lock() else {
                // The holder re-checks the queue after unlocking.
                return;
            };
            self.apply_queued(&mut runtime);
            drop(runtime);
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn apply_queued(&self, runtime: &mut Runtime<T>) {
        loop {
            let next = self.queue.lock().pop_front();
            let Some(input) = next else {
                break;
            };
            runtime.apply(input);
        }
    }
}

impl<T> Runtime<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn apply(&mut self, input: Input) {
        let effects = match input {
            Input::Start => self.machine.start(),
            Input::Open(generation) => self.machine.on_open(generation),
            Input::Message(generation, message) => self.machine.on_message(generation, &message),
            Input::Error {
                generation,
                message,
            } => {
                let hint = self.transport.as_ref().and_then(|t| t.retry_hint());
                let effects = self.machine.on_error(generation, &message, hint);
                if !effects.is_empty() && self.machine.state() == ConnectionState::Closed {
                    error!(
                        url = %self.config.url,
                        attempts = self.machine.attempt_count(),
                        error = %message,
                        "SSE subscription closed after transport error"
                    );
                }
                effects
            }
            Input::RetryElapsed => {
                self.retry_task = None;
                self.machine.on_retry_elapsed()
            }
            Input::Close => self.machine.close(),
        };

        for effect in effects {
            self.execute(effect);
        }
        self.publisher.send_replace(self.machine.snapshot().clone());
    }

    fn execute(&mut self, effect: Effect) {
        let url = self.config.url.clone();
        match effect {
            Effect::Attach { generation } => {
                let init = TransportInit {
                    headers: self.config.headers.clone(),
                    last_event_id: self.machine.snapshot().last_event_id.clone(),
                    connect_timeout: self.config.connect_timeout,
                };
                let transport = self.registry.acquire(&url, Some(&init));
                let listeners = Listeners::new(&self.this, generation);
                self.registry.add_listener(
                    &url,
                    &self.config.event_name,
                    Arc::clone(&listeners.message),
                );
                self.registry
                    .add_listener(&url, OPEN_EVENT, Arc::clone(&listeners.open));
                self.registry
                    .add_listener(&url, ERROR_EVENT, Arc::clone(&listeners.error));
                info!(
                    url = %url,
                    event = %self.config.event_name,
                    generation,
                    attempt = self.machine.attempt_count(),
                    "SSE subscription connecting"
                );

                // The transport may have opened or failed before the listeners
                // above existed. A duplicate error for this generation is
                // ignored once the first one detaches.
                let missed = match transport.terminal_error() {
                    Some(message) => Some(Input::Error {
                        generation,
                        message,
                    }),
                    None => transport.is_open().then_some(Input::Open(generation)),
                };
                if let Some(input) = missed
                    && let Some(shared) = self.this.upgrade()
                {
                    shared.queue.lock().push_back(input);
                }
                self.transport = Some(transport);
                self.listeners = Some(listeners);
            }
            Effect::Detach => {
                if let Some(listeners) = self.listeners.take() {
                    self.registry
                        .remove_listener(&url, &self.config.event_name, &listeners.message);
                    self.registry
                        .remove_listener(&url, OPEN_EVENT, &listeners.open);
                    self.registry
                        .remove_listener(&url, ERROR_EVENT, &listeners.error);
                }
                if self.transport.take().is_some() {
                    self.registry.release(&url);
                }
                debug!(url = %url, state = %self.machine.state(), "SSE subscription detached");
            }
            Effect::ScheduleRetry { delay } => {
                warn!(
                    url = %url,
                    attempt = self.machine.attempt_count(),
                    delay_ms = delay.as_millis() as u64,
                    "SSE subscription reconnecting"
                );
                let this = self.this.clone();
                self.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = this.upgrade() {
                        shared.submit(Input::RetryElapsed);
                    }
                }));
            }
            Effect::CancelRetry => {
                if let Some(task) = self.retry_task.take() {
                    task.abort();
                }
            }
        }
    }
}

impl Listeners {
    fn new<T>(this: &Weak<Shared<T>>, generation: u64) -> Self
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Self {
            message: forward(this, move |event| match event {
                TransportEvent::Message(message) => {
                    Some(Input::Message(generation, message.clone()))
                }
                _ => None,
            }),
            open: forward(this, move |event| {
                matches!(event, TransportEvent::Open).then_some(Input::Open(generation))
            }),
            error: forward(this, move |event| match event {
                TransportEvent::Error { message } => Some(Input::Error {
                    generation,
                    message: message.clone(),
                }),
                _ => None,
            }),
        }
    }
}

fn forward<T, F>(this: &Weak<Shared<T>>, to_input: F) -> TransportCallback
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    F: Fn(&TransportEvent) -> Option<Input> + Send + Sync + 'static,
{
    let this = this.clone();
    Arc::new(move |event: &TransportEvent| {
        let Some(input) = to_input(event) else {
            return;
        };
        if let Some(shared) = this.upgrade() {
            shared.submit(input);
        }
    })
}

/// A live, reconnecting view of one event type on one stream.
///
/// Payloads are parsed as JSON into `T`. Observe changes through
/// [`watch`](Self::watch) or [`changed`](Self::changed). Dropping the
/// subscription closes it.
///
/// Must be opened inside a tokio runtime: retry timers and HTTP
/// transports run as spawned tasks.
pub struct Subscription<T = serde_json::Value>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<T>>,
    snapshots: watch::Receiver<SubscriptionSnapshot<T>>,
    url: String,
    event_name: String,
}

impl<T> fmt::Debug for Subscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("url", &self.url)
            .field("event_name", &self.event_name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start subscribing.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn open(registry: Arc<ConnectionRegistry>, config: SubscriptionConfig) -> SseResult<Self> {
        config.validate().map_err(SseError::config)?;

        let url = config.url.clone();
        let event_name = config.event_name.clone();
        let (publisher, snapshots) = watch::channel(SubscriptionSnapshot::default());
        let shared = Arc::new_cyclic(|this| Shared {
            queue: Mutex::new(VecDeque::new()),
            runtime: Mutex::new(Runtime {
                machine: SubscriptionMachine::new(config.reconnect),
                registry,
                config,
                transport: None,
                listeners: None,
                retry_task: None,
                publisher,
                this: this.clone(),
            }),
        });
        shared.submit(Input::Start);

        Ok(Self {
            shared,
            snapshots,
            url,
            event_name,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> SubscriptionSnapshot<T> {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshots.borrow().state
    }

    /// Most recent successfully parsed payload.
    pub fn data(&self) -> Option<T> {
        self.snapshots.borrow().data.clone()
    }

    pub fn error(&self) -> Option<SubscriptionError> {
        self.snapshots.borrow().error.clone()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.snapshots.borrow().last_event_id.clone()
    }

    /// A receiver notified on every transition.
    pub fn watch(&self) -> watch::Receiver<SubscriptionSnapshot<T>> {
        self.snapshots.clone()
    }

    /// Wait for the next transition and return the new snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime behind the subscription is gone.
    pub async fn changed(&mut self) -> SseResult<SubscriptionSnapshot<T>> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| SseError::internal("subscription runtime dropped"))?;
        Ok(self.snapshots.borrow_and_update().clone())
    }

    /// Wait until the state equals `state`, returning that snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime behind the subscription is gone.
    pub async fn wait_for(&mut self, state: ConnectionState) -> SseResult<SubscriptionSnapshot<T>> {
        let snapshot = self
            .snapshots
            .wait_for(|snapshot| snapshot.state == state)
            .await
            .map_err(|_| SseError::internal("subscription runtime dropped"))?;
        Ok(snapshot.clone())
    }

    /// Stop: cancels a pending retry, detaches from the transport and
    /// enters `closed`. Idempotent.
    ///
    /// The transport reference is released before this returns, waiting
    /// for a transport notification that is being handled on another
    /// thread.
    pub fn close(&self) {
        self.shared.submit_and_wait(Input::Close);
    }

    /// Connect again after a close or after retries were exhausted, with a
    /// fresh attempt budget. No-op while connecting or open.
    pub fn reopen(&self) {
        self.shared.submit_and_wait(Input::Start);
    }
}

impl<T> Drop for Subscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shared.submit_and_wait(Input::Close);
    }
}
