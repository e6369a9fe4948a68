//! Server side: one [`StreamSession`] per inbound request.
//!
//! # Architecture
//!
//! ```text
//! SseEndpoint::serve(request, abort)
//!   ├─ StreamSession::start() ──► SessionStream ──► SseBody (response)
//!   ├─ spawn(handler.handle(ctx))        ctx.send(..) ─► mpsc ─► SessionStream
//!   └─ spawn(watch_abort)                abort.cancel() ─► session.abort()
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use hpx_sse::server::{HandlerResult, SessionContext, SseEndpoint};
//! use serde_json::json;
//!
//! # fn example() {
//! let endpoint = SseEndpoint::new(|ctx: SessionContext| async move {
//!     let producer = tokio::spawn({
//!         let ctx = ctx.clone();
//!         async move {
//!             let mut count = 0u64;
//!             while !ctx.is_closed() {
//!                 let _ = ctx.send(&json!({ "count": count }), Some("counter"));
//!                 count += 1;
//!                 tokio::time::sleep(Duration::from_secs(1)).await;
//!             }
//!         }
//!     });
//!     let result: HandlerResult = Ok(Some(Box::new(move || producer.abort())));
//!     result
//! });
//! # let _ = endpoint;
//! # }
//! ```

mod config;
mod handler;
mod resume;
mod session;

pub use config::{DefaultCleanup, SessionConfig};
pub use handler::{
    BoxError, HandlerResult, SessionContext, SseBody, SseEndpoint, StreamHandler,
    event_stream_headers,
};
pub use resume::{CLIENT_ID_PARAM, LAST_EVENT_ID_HEADER, LAST_EVENT_ID_PARAM, ResumeInfo};
pub use session::{Cleanup, CleanupOrigin, SessionStream, StreamSession};
