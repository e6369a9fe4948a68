//! Server-side stream session.
//!
//! A [`StreamSession`] owns the outgoing channel of one `text/event-stream`
//! response. It is cheap to clone; every clone drives the same session. The
//! consuming side is the [`SessionStream`] returned by
//! [`StreamSession::start`], which becomes the response body.
//!
//! Teardown runs exactly once no matter which trigger fires first: an
//! explicit [`close`](StreamSession::close), the request's abort signal, or
//! the body being dropped because the peer went away.

use std::{
    convert::Infallible,
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::SessionConfig;
use crate::{
    codec::{KEEP_ALIVE_COMMENT, encode_comment, encode_frame, encode_retry},
    error::{SseError, SseResult},
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Finalizer run once when a session closes.
pub type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Who registered a session's cleanup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupOrigin {
    /// Supplied by [`SessionConfig::default_cleanup`].
    Default,
    /// Returned by the stream handler.
    Handler,
    /// Registered from inside the handler via `on_close`.
    Explicit,
}

impl fmt::Display for CleanupOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Handler => write!(f, "handler"),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

struct SessionState {
    channel: Option<mpsc::UnboundedSender<Bytes>>,
    started: bool,
    closed: bool,
    next_message_id: u64,
    cleanup: Option<(CleanupOrigin, Cleanup)>,
}

struct SessionShared {
    id: u64,
    config: SessionConfig,
    state: Mutex<SessionState>,
    closed: CancellationToken,
}

/// Handle to one server-side event stream.
#[derive(Clone)]
pub struct StreamSession {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamSession")
            .field("id", &self.shared.id)
            .field("started", &state.started)
            .field("closed", &state.closed)
            .field("next_message_id", &state.next_message_id)
            .finish()
    }
}

impl StreamSession {
    /// Create a session. Nothing can be sent until [`start`](Self::start)
    /// creates the outgoing channel.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let next_message_id = config.initial_message_id;
        Self {
            shared: Arc::new(SessionShared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: Mutex::new(SessionState {
                    channel: None,
                    started: false,
                    closed: false,
                    next_message_id,
                    cleanup: None,
                }),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Process-unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Create the outgoing channel and return its consuming end.
    ///
    /// When keep-alive is configured this must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the session was already started.
    pub fn start(&self) -> SseResult<SessionStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state.lock();
            if state.started {
                return Err(SseError::internal(format!(
                    "session {} already started",
                    self.shared.id
                )));
            }
            if let Some(delay) = self.shared.config.retry {
                let _ = tx.send(Bytes::from(encode_retry(delay)));
            }
            state.started = true;
            state.channel = Some(tx);
        }

        let keep_alive = self.shared.config.keep_alive.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        debug!(session_id = self.shared.id, "SSE session started");
        Ok(SessionStream {
            rx,
            keep_alive,
            session: self.clone(),
        })
    }

    /// Encode `payload` as the next frame and queue it.
    ///
    /// Sending on a closed session is a silent no-op: whoever closed it has
    /// already won and late frames are shed.
    ///
    /// # Errors
    ///
    /// Returns an error if the session was never started, if the payload
    /// cannot be serialized, or if the event name is invalid. The message id
    /// only advances when a frame is actually queued.
    pub fn send<T>(&self, payload: &T, event: Option<&str>) -> SseResult<()>
    where
        T: Serialize + ?Sized,
    {
        let mut state = self.shared.state.lock();
        if !state.started {
            return Err(SseError::not_started("send"));
        }
        if state.closed {
            debug!(session_id = self.shared.id, "Dropping frame for closed session");
            return Ok(());
        }

        let id = state.next_message_id;
        let frame = encode_frame(id, payload, event)?;
        if let Some(channel) = &state.channel
            && channel.send(Bytes::from(frame)).is_err()
        {
            debug!(session_id = self.shared.id, id, "SSE body already dropped");
        }
        state.next_message_id = id + 1;
        Ok(())
    }

    /// Close the session. Only the first call has an effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the session was never started.
    pub fn close(&self) -> SseResult<()> {
        if !self.shared.state.lock().started {
            return Err(SseError::not_started("close"));
        }
        self.finish("closed explicitly");
        Ok(())
    }

    /// Close the session because the transport or peer went away.
    pub fn abort(&self, reason: &str) {
        self.finish(reason);
    }

    /// Register the session's single cleanup.
    ///
    /// The first registration wins; later ones are rejected with a warning
    /// and `false` is returned. A cleanup registered after the session has
    /// already closed runs immediately.
    pub fn register_cleanup<F>(&self, origin: CleanupOrigin, cleanup: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_boxed(origin, Box::new(cleanup))
    }

    /// Shorthand for an [`Explicit`](CleanupOrigin::Explicit) registration.
    pub fn on_close<F>(&self, cleanup: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_cleanup(CleanupOrigin::Explicit, cleanup)
    }

    pub(crate) fn register_boxed(&self, origin: CleanupOrigin, cleanup: Cleanup) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            debug!(
                session_id = self.shared.id,
                %origin,
                "Session already closed, running cleanup now"
            );
            cleanup();
            return true;
        }

        if let Some(existing) = state.cleanup.as_ref().map(|(origin, _)| *origin) {
            drop(state);
            warn!(
                session_id = self.shared.id,
                %existing,
                rejected = %origin,
                "Session cleanup already registered, keeping the first registration"
            );
            return false;
        }

        state.cleanup = Some((origin, cleanup));
        true
    }

    /// Whether the session has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether [`start`](Self::start) has been called.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Id the next frame will carry.
    pub fn next_message_id(&self) -> u64 {
        self.shared.state.lock().next_message_id
    }

    /// Resolves once the session closes, whatever the trigger.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    fn finish(&self, reason: &str) -> bool {
        let cleanup = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.channel = None;
            state.cleanup.take()
        };

        self.shared.closed.cancel();
        debug!(session_id = self.shared.id, reason, "SSE session closed");

        let cleanup = cleanup.or_else(|| {
            self.shared.config.default_cleanup.clone().map(|default| {
                let cleanup: Cleanup = Box::new(move || default());
                (CleanupOrigin::Default, cleanup)
            })
        });
        if let Some((origin, cleanup)) = cleanup {
            debug!(session_id = self.shared.id, %origin, "Running session cleanup");
            cleanup();
        }
        true
    }
}

/// Consuming end of a session: the response body bytes.
///
/// Dropping it closes the session, which is how a peer disconnect reaches
/// the handler.
pub struct SessionStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    keep_alive: Option<Interval>,
    session: StreamSession,
}

impl SessionStream {
    /// The session feeding this stream.
    pub fn session(&self) -> &StreamSession {
        &self.session
    }
}

impl Stream for SessionStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if let Some(interval) = &mut this.keep_alive {
                    interval.reset();
                }
                return Poll::Ready(Some(Ok(frame)));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        if let Some(interval) = &mut this.keep_alive
            && interval.poll_tick(cx).is_ready()
        {
            return Poll::Ready(Some(Ok(Bytes::from(encode_comment(KEEP_ALIVE_COMMENT)))));
        }
        Poll::Pending
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.session.abort("response body dropped");
    }
}
