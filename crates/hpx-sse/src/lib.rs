//! # hpx-sse
//!
//! Server-Sent Events for both ends of the wire.
//!
//! - **Server**: a [`StreamSession`](server::StreamSession) per request with
//!   monotonically numbered frames, idempotent close, a single teardown
//!   hook, abort propagation, keep-alive comments and `Last-Event-ID`
//!   resumption context.
//! - **Client**: a [`ConnectionRegistry`](client::ConnectionRegistry) that
//!   shares one transport per URL between subscribers, and a reconnecting
//!   [`Subscription`](client::Subscription) exposing
//!   `connecting`/`open`/`closed` state, the latest parsed payload and the
//!   latest error.
//! - **Codec**: the `id:`/`event:`/`data:` frame encoder and an incremental
//!   decoder.
//!
//! ## Feature flags
//!
//! - `http-client` (default): HTTP transport built on `reqwest`.

pub mod client;
pub mod codec;
pub mod error;
pub mod server;

pub use client::{
    ConnectionRegistry, ConnectionState, ReconnectPolicy, Subscription, SubscriptionConfig,
    SubscriptionError, SubscriptionSnapshot,
};
pub use codec::{Decoded, DecodedEvent, FrameDecoder, encode_frame};
pub use error::{SseError, SseResult};
pub use server::{
    HandlerResult, SessionConfig, SessionContext, SseEndpoint, StreamHandler, StreamSession,
};
