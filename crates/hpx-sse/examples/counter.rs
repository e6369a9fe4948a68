//! Counter Example
//!
//! Serves a ticking counter stream and watches it through a reconnecting
//! subscription in the same process.
//!
//! Run with: `RUST_LOG=hpx_sse=debug cargo run -p hpx-sse --example counter`

use std::{sync::Arc, time::Duration};

use hpx_sse::{
    client::{ConnectionRegistry, ReconnectPolicy, Subscription, SubscriptionConfig},
    server::{HandlerResult, SessionConfig, SessionContext, SseEndpoint},
};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Deserialize)]
struct Counter {
    count: u64,
}

async fn counter(ctx: SessionContext) -> HandlerResult {
    tracing::info!(
        last_event_id = ?ctx.last_event_id(),
        client_id = ?ctx.client_id(),
        "client connected"
    );
    let producer = tokio::spawn({
        let ctx = ctx.clone();
        async move {
            let mut count = ctx.resume().resume_from().unwrap_or(0);
            loop {
                if ctx.is_closed()
                    || ctx
                        .send(&json!({ "count": count }), Some("counter"))
                        .is_err()
                {
                    break;
                }
                count += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });
    Ok(Some(Box::new(move || producer.abort())))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SessionConfig::new().retry(Duration::from_millis(500));
    let endpoint = SseEndpoint::with_config(counter, config)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<Incoming>| {
                    let response = endpoint.serve(&req, CancellationToken::new());
                    async move { response }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::warn!(error = %err, "connection error");
                }
            });
        }
    });

    let registry = Arc::new(ConnectionRegistry::http()?);
    let config = SubscriptionConfig::new(format!("http://{addr}/api/stream?clientId=example"))
        .event_name("counter")
        .reconnect(ReconnectPolicy::default());
    let mut subscription: Subscription<Counter> = Subscription::open(registry, config)?;

    println!("Watching http://{addr}/api/stream for five updates");
    let mut updates = 0;
    while updates < 5 {
        let snapshot = subscription.changed().await?;
        if let Some(data) = &snapshot.data {
            println!(
                "[{}] count={} id={:?}",
                snapshot.state, data.count, snapshot.last_event_id
            );
            updates += 1;
        }
    }

    subscription.close();
    println!("Final state: {}", subscription.state());
    Ok(())
}
