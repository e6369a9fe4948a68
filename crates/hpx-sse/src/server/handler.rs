//! Stream handlers and the HTTP endpoint that drives them.

use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use http::{HeaderMap, HeaderValue, Response, header};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    config::SessionConfig,
    resume::ResumeInfo,
    session::{Cleanup, CleanupOrigin, SessionStream, StreamSession},
};
use crate::error::{SseError, SseResult};

/// Boxed error returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler: optionally a teardown to run when the session
/// closes.
pub type HandlerResult = Result<Option<Cleanup>, BoxError>;

/// Everything a handler gets for one session.
#[derive(Clone, Debug)]
pub struct SessionContext {
    session: StreamSession,
    resume: ResumeInfo,
}

impl SessionContext {
    /// Build a context for a session and the client's resumption info.
    pub fn new(session: StreamSession, resume: ResumeInfo) -> Self {
        Self { session, resume }
    }

    /// Send a frame. See [`StreamSession::send`].
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn send<T>(&self, payload: &T, event: Option<&str>) -> SseResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.session.send(payload, event)
    }

    /// Close the stream. See [`StreamSession::close`].
    ///
    /// # Errors
    ///
    /// Returns an error if the session was never started.
    pub fn close(&self) -> SseResult<()> {
        self.session.close()
    }

    /// Register the session teardown. See [`StreamSession::on_close`].
    pub fn on_close<F>(&self, cleanup: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.session.on_close(cleanup)
    }

    /// Resolves once the session closes.
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    /// Whether the session has closed.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Last event id the client saw before reconnecting.
    pub fn last_event_id(&self) -> Option<&str> {
        self.resume.last_event_id.as_deref()
    }

    /// Client identity from the `clientId` query parameter.
    pub fn client_id(&self) -> Option<&str> {
        self.resume.client_id.as_deref()
    }

    /// Full resumption info.
    pub fn resume(&self) -> &ResumeInfo {
        &self.resume
    }

    /// The underlying session handle, for moving into spawned producers.
    pub fn session(&self) -> &StreamSession {
        &self.session
    }
}

/// Produces the events of one stream.
///
/// Invoked once per session. Handlers usually spawn a producer that sends
/// until [`SessionContext::closed`] resolves, and return a teardown for it.
/// Returning `Err` (or panicking) closes the session; the client only sees
/// the connection end.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Run the handler for one session.
    async fn handle(&self, ctx: SessionContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(SessionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: SessionContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Headers every event-stream response carries.
pub fn event_stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

/// Response body backed by a [`SessionStream`].
pub struct SseBody {
    stream: SessionStream,
}

impl SseBody {
    /// Wrap a session stream.
    pub fn new(stream: SessionStream) -> Self {
        Self { stream }
    }

    /// The session feeding this body.
    pub fn session(&self) -> &StreamSession {
        self.stream.session()
    }
}

impl http_body::Body for SseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream)
            .poll_next(cx)
            .map(|item| item.map(|chunk| chunk.map(http_body::Frame::data)))
    }
}

/// HTTP endpoint turning requests into handler-driven event streams.
pub struct SseEndpoint<H> {
    handler: Arc<H>,
    config: SessionConfig,
}

impl<H> Clone for SseEndpoint<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
        }
    }
}

impl<H: StreamHandler> SseEndpoint<H> {
    /// Create an endpoint with the default session configuration.
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            config: SessionConfig::default(),
        }
    }

    /// Create an endpoint with a custom session configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn with_config(handler: H, config: SessionConfig) -> SseResult<Self> {
        config.validate().map_err(SseError::config)?;
        Ok(Self {
            handler: Arc::new(handler),
            config,
        })
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a session for an inbound request.
    ///
    /// `abort` is the request's cancellation signal; cancelling it closes
    /// the session. The handler runs on a spawned task, so this must be
    /// called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be built.
    pub fn serve<B>(
        &self,
        request: &http::Request<B>,
        abort: CancellationToken,
    ) -> SseResult<Response<SseBody>> {
        self.serve_parts(request.headers(), request.uri(), abort)
    }

    /// Like [`serve`](Self::serve), for frameworks that hand out headers and
    /// URI separately.
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be built.
    pub fn serve_parts(
        &self,
        headers: &HeaderMap,
        uri: &http::Uri,
        abort: CancellationToken,
    ) -> SseResult<Response<SseBody>> {
        let resume = ResumeInfo::from_request(headers, uri);
        let mut config = self.config.clone();
        if config.continue_ids
            && let Some(next) = resume.resume_from()
        {
            config.initial_message_id = next;
        }
        let session = StreamSession::new(config);
        let stream = session.start()?;

        info!(
            session_id = session.id(),
            path = %uri.path(),
            last_event_id = ?resume.last_event_id,
            client_id = ?resume.client_id,
            "SSE session opened"
        );

        tokio::spawn(watch_abort(session.clone(), abort));
        tokio::spawn(run_handler(
            Arc::clone(&self.handler),
            SessionContext::new(session, resume),
        ));

        let mut response = Response::new(SseBody::new(stream));
        response.headers_mut().extend(event_stream_headers());
        Ok(response)
    }
}

async fn watch_abort(session: StreamSession, abort: CancellationToken) {
    tokio::select! {
        () = abort.cancelled() => {
            info!(session_id = session.id(), "SSE request aborted");
            session.abort("request aborted");
        }
        () = session.closed() => {}
    }
}

async fn run_handler<H: StreamHandler>(handler: Arc<H>, ctx: SessionContext) {
    let session = ctx.session().clone();
    let task = tokio::spawn(async move { handler.handle(ctx).await });

    match task.await {
        Ok(Ok(Some(cleanup))) => {
            session.register_boxed(CleanupOrigin::Handler, cleanup);
        }
        Ok(Ok(None)) => {
            debug!(session_id = session.id(), "SSE handler returned without teardown");
        }
        Ok(Err(err)) => {
            error!(session_id = session.id(), error = %err, "SSE handler failed");
            session.abort("handler failed");
        }
        Err(join_err) => {
            let err = SseError::handler(join_err.to_string());
            error!(session_id = session.id(), error = %err, "SSE handler panicked");
            session.abort("handler panicked");
        }
    }
}
