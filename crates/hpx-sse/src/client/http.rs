//! HTTP implementation of [`EventTransport`] over `reqwest`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::StreamExt;
use http::{HeaderValue, header};
use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{
    EventDispatcher, EventTransport, MessageEvent, TransportCallback, TransportEvent,
    TransportFactory, TransportInit,
};
use crate::{
    codec::{Decoded, FrameDecoder},
    error::{SseError, SseResult},
    server::LAST_EVENT_ID_HEADER,
};

/// Opens [`HttpEventSource`]s with a shared `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    /// Create a factory with a default client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> SseResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    /// Create a factory around an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(&self, url: &str, init: &TransportInit) -> Arc<dyn EventTransport> {
        HttpEventSource::connect(self.client.clone(), url, init.clone())
    }
}

struct SourceShared {
    url: String,
    dispatcher: EventDispatcher,
    retry_hint: Mutex<Option<Duration>>,
    open: AtomicBool,
    failed: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl SourceShared {
    fn emit(&self, event: &TransportEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.dispatcher.dispatch(event);
    }
}

/// One streaming GET request.
///
/// Emits `open` once the response headers are validated, a message per
/// decoded event, then a single `error` when the stream fails or ends.
/// Never reconnects on its own.
pub struct HttpEventSource {
    shared: Arc<SourceShared>,
}

impl std::fmt::Debug for HttpEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEventSource")
            .field("url", &self.shared.url)
            .field("open", &self.shared.open.load(Ordering::Acquire))
            .field("closed", &self.shared.cancel.is_cancelled())
            .finish()
    }
}

impl HttpEventSource {
    /// Start the request on a background task. Must be called inside a
    /// tokio runtime.
    pub fn connect(client: reqwest::Client, url: &str, init: TransportInit) -> Arc<Self> {
        let shared = Arc::new(SourceShared {
            url: url.to_string(),
            dispatcher: EventDispatcher::new(),
            retry_hint: Mutex::new(None),
            open: AtomicBool::new(false),
            failed: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(drive(client, init, Arc::clone(&shared)));
        Arc::new(Self { shared })
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }
}

impl EventTransport for HttpEventSource {
    fn add_event_listener(&self, event: &str, callback: TransportCallback) {
        self.shared.dispatcher.add(event, callback);
    }

    fn close(&self) {
        if !self.shared.cancel.is_cancelled() {
            debug!(url = %self.shared.url, "Closing SSE transport");
        }
        self.shared.cancel.cancel();
        self.shared.dispatcher.clear();
    }

    fn retry_hint(&self) -> Option<Duration> {
        *self.shared.retry_hint.lock()
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn terminal_error(&self) -> Option<String> {
        self.shared.failed.lock().clone()
    }
}

impl Drop for HttpEventSource {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn drive(client: reqwest::Client, init: TransportInit, shared: Arc<SourceShared>) {
    let result = tokio::select! {
        biased;
        () = shared.cancel.cancelled() => return,
        result = run(&client, &init, &shared) => result,
    };

    let err = match result {
        Ok(()) => SseError::StreamEnded,
        Err(err) => err,
    };
    shared.open.store(false, Ordering::Release);
    if shared.cancel.is_cancelled() {
        return;
    }
    warn!(url = %shared.url, error = %err, "SSE transport failed");
    let message = err.to_string();
    *shared.failed.lock() = Some(message.clone());
    shared.emit(&TransportEvent::error(message));
}

async fn run(
    client: &reqwest::Client,
    init: &TransportInit,
    shared: &SourceShared,
) -> SseResult<()> {
    let response = establish(client, &shared.url, init).await?;
    info!(url = %shared.url, "SSE transport open");
    shared.open.store(true, Ordering::Release);
    shared.emit(&TransportEvent::Open);

    let mut decoder = FrameDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for decoded in decoder.decode(&chunk)? {
            match decoded {
                Decoded::Event(event) => {
                    debug!(
                        url = %shared.url,
                        event = %event.event,
                        id = %event.id,
                        "SSE event received"
                    );
                    shared.emit(&TransportEvent::Message(MessageEvent::new(
                        event.event,
                        event.data,
                        event.id,
                    )));
                }
                Decoded::Retry(delay) => {
                    debug!(
                        url = %shared.url,
                        retry_ms = delay.as_millis() as u64,
                        "Server retry advisory"
                    );
                    *shared.retry_hint.lock() = Some(delay);
                }
            }
        }
    }
    Ok(())
}

async fn establish(
    client: &reqwest::Client,
    url: &str,
    init: &TransportInit,
) -> SseResult<reqwest::Response> {
    let mut headers = init.headers.clone();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    if let Some(id) = init.last_event_id.as_deref()
        && let Ok(value) = HeaderValue::from_str(id)
    {
        headers.insert(LAST_EVENT_ID_HEADER, value);
    }

    let request = client.get(url).headers(headers).send();
    let response = timeout(init.connect_timeout, request)
        .await
        .map_err(|_| SseError::timeout(init.connect_timeout))??;

    let status = response.status();
    if !status.is_success() {
        return Err(SseError::invalid_status(status));
    }

    if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
        let content_type = content_type.to_str().unwrap_or("");
        if !content_type.contains("text/event-stream") {
            return Err(SseError::invalid_content_type(content_type));
        }
    }

    Ok(response)
}
