//! Client side: shared transports and reconnecting subscriptions.
//!
//! # Architecture
//!
//! ```text
//! Subscription ──acquire/release──► ConnectionRegistry ──connect──► TransportFactory
//!      ▲                               │  one transport per URL          │
//!      │ snapshots (watch)             │  one physical listener per name ▼
//!      └── SubscriptionMachine ◄─fan out── EventTransport (HttpEventSource)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hpx_sse::client::{ConnectionRegistry, ReconnectPolicy, Subscription, SubscriptionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ConnectionRegistry::http()?);
//!     let config = SubscriptionConfig::new("http://localhost:3000/api/stream")
//!         .event_name("counter")
//!         .reconnect(ReconnectPolicy::default());
//!
//!     let mut subscription: Subscription = Subscription::open(registry, config)?;
//!     loop {
//!         let snapshot = subscription.changed().await?;
//!         println!("{} {:?}", snapshot.state, snapshot.data);
//!     }
//! }
//! ```

#[cfg(feature = "http-client")]
mod http;
mod machine;
mod reconnect;
mod registry;
mod subscription;
mod transport;

#[cfg(feature = "http-client")]
pub use http::{HttpEventSource, HttpTransportFactory};
pub use machine::{
    ConnectionState, Effect, SubscriptionError, SubscriptionMachine, SubscriptionSnapshot,
};
pub use reconnect::ReconnectPolicy;
pub use registry::ConnectionRegistry;
pub use subscription::{Subscription, SubscriptionConfig};
pub use transport::{
    ERROR_EVENT, EventDispatcher, EventTransport, MessageEvent, OPEN_EVENT, TransportCallback,
    TransportEvent, TransportFactory, TransportInit,
};
