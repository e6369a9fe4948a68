//! HTTP transport and end-to-end tests.
//!
//! Uses mock hyper servers: a static body for the transport itself, and a
//! real [`SseEndpoint`] for subscription round trips.

#![cfg(feature = "http-client")]

mod common;

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use common::init_tracing;
use hpx_sse::{
    client::{
        ConnectionRegistry, ConnectionState, ERROR_EVENT, EventTransport, HttpTransportFactory,
        OPEN_EVENT, ReconnectPolicy, Subscription, SubscriptionConfig, TransportEvent,
        TransportFactory, TransportInit,
    },
    server::{HandlerResult, SessionConfig, SessionContext, SseEndpoint, StreamHandler},
};
use http_body_util::Full;
use hyper::{
    Request, Response,
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::{
    net::TcpListener,
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Deserialize, PartialEq)]
struct Counter {
    count: u64,
}

// ---------------------------------------------------------------------------
// Mock server helpers
// ---------------------------------------------------------------------------

/// Serve `body` once per connection, recording each request's
/// `Last-Event-ID`.
async fn start_static_server(
    body: &'static str,
    content_type: &'static str,
    status: u16,
) -> (SocketAddr, Arc<Mutex<Vec<Option<String>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req: Request<Incoming>| {
                            let last_event_id = req
                                .headers()
                                .get("last-event-id")
                                .and_then(|value| value.to_str().ok())
                                .map(str::to_string);
                            recorded.lock().push(last_event_id);
                            let resp = Response::builder()
                                .status(status)
                                .header("content-type", content_type)
                                .body(Full::new(Bytes::from(body)))
                                .expect("build response");
                            async move { Ok::<_, Infallible>(resp) }
                        }),
                    )
                    .await;
            });
        }
    });

    (addr, seen)
}

/// Serve an [`SseEndpoint`] on every connection.
async fn start_endpoint_server<H: StreamHandler>(endpoint: SseEndpoint<H>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req: Request<Incoming>| {
                            let response = endpoint.serve(&req, CancellationToken::new());
                            async move { response }
                        }),
                    )
                    .await;
            });
        }
    });

    addr
}

fn record_events(
    transport: &dyn EventTransport,
    names: &[&str],
) -> UnboundedReceiver<TransportEvent> {
    let (tx, rx) = unbounded_channel();
    for name in names {
        let tx = tx.clone();
        transport.add_event_listener(
            name,
            Arc::new(move |event: &TransportEvent| {
                let _ = tx.send(event.clone());
            }),
        );
    }
    rx
}

async fn next_event(rx: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed")
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transport_open_messages_then_error() {
    init_tracing();
    let body = concat!(
        "retry: 250\n\n",
        "id: 1\nevent: counter\ndata: {\"count\":1}\n\n",
        ": keepalive\n\n",
        "data: plain\n\n",
    );
    let (addr, seen) = start_static_server(body, "text/event-stream", 200).await;

    let factory = HttpTransportFactory::new().expect("factory");
    let init = TransportInit {
        last_event_id: Some("0".to_string()),
        ..Default::default()
    };
    let transport = factory.connect(&format!("http://{addr}/stream"), &init);
    let mut rx = record_events(
        transport.as_ref(),
        &[OPEN_EVENT, "counter", "message", ERROR_EVENT],
    );

    assert_eq!(next_event(&mut rx).await, TransportEvent::Open);

    let TransportEvent::Message(message) = next_event(&mut rx).await else {
        panic!("expected counter message");
    };
    assert_eq!(message.event, "counter");
    assert_eq!(message.data, r#"{"count":1}"#);
    assert_eq!(message.last_event_id, "1");

    let TransportEvent::Message(message) = next_event(&mut rx).await else {
        panic!("expected default message");
    };
    assert_eq!(message.event, "message");
    assert_eq!(message.data, "plain");
    assert_eq!(message.last_event_id, "1");

    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Error { .. }
    ));
    assert_eq!(transport.retry_hint(), Some(Duration::from_millis(250)));
    assert!(!transport.is_open());
    assert!(transport.terminal_error().is_some());
    assert_eq!(seen.lock().as_slice(), &[Some("0".to_string())]);
}

#[tokio::test]
async fn test_transport_rejects_wrong_content_type() {
    let (addr, _seen) = start_static_server("hello", "text/plain", 200).await;

    let factory = HttpTransportFactory::new().expect("factory");
    let transport = factory.connect(&format!("http://{addr}/stream"), &TransportInit::default());
    let mut rx = record_events(transport.as_ref(), &[OPEN_EVENT, ERROR_EVENT]);

    let TransportEvent::Error { message } = next_event(&mut rx).await else {
        panic!("expected error before open");
    };
    assert!(message.contains("content type"), "{message}");
}

#[tokio::test]
async fn test_transport_rejects_error_status() {
    let (addr, _seen) = start_static_server("", "text/event-stream", 503).await;

    let factory = HttpTransportFactory::new().expect("factory");
    let transport = factory.connect(&format!("http://{addr}/stream"), &TransportInit::default());
    let mut rx = record_events(transport.as_ref(), &[OPEN_EVENT, ERROR_EVENT]);

    let TransportEvent::Error { message } = next_event(&mut rx).await else {
        panic!("expected error before open");
    };
    assert!(message.contains("503"), "{message}");
}

#[tokio::test]
async fn test_transport_close_is_silent() {
    let (addr, _seen) = start_static_server("data: 1\n\n", "text/event-stream", 200).await;

    let factory = HttpTransportFactory::new().expect("factory");
    let transport = factory.connect(&format!("http://{addr}/stream"), &TransportInit::default());
    let mut rx = record_events(transport.as_ref(), &[OPEN_EVENT, "message", ERROR_EVENT]);
    transport.close();

    let result = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(!matches!(result, Ok(Some(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_endpoint_closes_subscription() {
    let registry = Arc::new(ConnectionRegistry::http().expect("registry"));
    let url = "http://127.0.0.1:1/stream";

    for iteration in 0..100 {
        let mut subscription: Subscription =
            Subscription::open(Arc::clone(&registry), SubscriptionConfig::new(url)).expect("open");

        let snapshot = timeout(
            Duration::from_secs(5),
            subscription.wait_for(ConnectionState::Closed),
        )
        .await
        .unwrap_or_else(|_| panic!("iteration {iteration} stuck connecting"))
        .expect("subscription alive");

        assert!(
            snapshot.error.is_some_and(|err| !err.is_parse()),
            "iteration {iteration}"
        );
        assert_eq!(registry.ref_count(url), 0, "iteration {iteration}");
    }
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

async fn ticking_counter(ctx: SessionContext) -> HandlerResult {
    let producer = tokio::spawn({
        let ctx = ctx.clone();
        async move {
            let mut count = ctx.resume().resume_from().unwrap_or(0);
            while !ctx.is_closed() {
                let sent = ctx.send(&json!({ "count": count }), Some("counter"));
                if sent.is_err() {
                    break;
                }
                count += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    });
    Ok(Some(Box::new(move || producer.abort())))
}

#[tokio::test]
async fn test_subscription_receives_endpoint_events() {
    init_tracing();
    let endpoint =
        SseEndpoint::with_config(ticking_counter, SessionConfig::new()).expect("endpoint");
    let addr = start_endpoint_server(endpoint).await;

    let registry = Arc::new(ConnectionRegistry::http().expect("registry"));
    let config = SubscriptionConfig::new(format!("http://{addr}/api/stream"))
        .event_name("counter")
        .reconnect(ReconnectPolicy::default());
    let subscription: Subscription<Counter> =
        Subscription::open(Arc::clone(&registry), config).expect("open");

    let mut watcher = subscription.watch();
    let snapshot = timeout(
        Duration::from_secs(5),
        watcher.wait_for(|snapshot| {
            snapshot
                .data
                .as_ref()
                .is_some_and(|counter| counter.count >= 2)
        }),
    )
    .await
    .expect("timeout")
    .expect("subscription alive")
    .clone();

    assert_eq!(snapshot.state, ConnectionState::Open);
    assert!(snapshot.error.is_none());
    assert!(snapshot.last_event_id.is_some());

    subscription.close();
    assert_eq!(subscription.state(), ConnectionState::Closed);
    assert!(registry.is_empty());
}

async fn one_shot(ctx: SessionContext, resumes: Arc<Mutex<Vec<Option<String>>>>) -> HandlerResult {
    resumes.lock().push(ctx.last_event_id().map(str::to_string));
    ctx.send(&json!({ "count": 1 }), Some("counter"))?;
    ctx.close()?;
    Ok(None)
}

#[tokio::test]
async fn test_subscription_reconnects_with_last_event_id() {
    let resumes = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let resumes = Arc::clone(&resumes);
        move |ctx: SessionContext| one_shot(ctx, Arc::clone(&resumes))
    };
    let endpoint = SseEndpoint::with_config(handler, SessionConfig::new().keep_alive(None))
        .expect("endpoint");
    let addr = start_endpoint_server(endpoint).await;

    let registry = Arc::new(ConnectionRegistry::http().expect("registry"));
    let config = SubscriptionConfig::new(format!("http://{addr}/api/stream"))
        .event_name("counter")
        .reconnect(ReconnectPolicy::new(Duration::from_millis(50), 2));
    let subscription: Subscription<Counter> = Subscription::open(registry, config).expect("open");

    timeout(Duration::from_secs(5), async {
        while resumes.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout");
    subscription.close();

    let resumes = resumes.lock().clone();
    assert_eq!(resumes[0], None);
    assert_eq!(resumes[1].as_deref(), Some("0"));
    assert_eq!(subscription.data(), Some(Counter { count: 1 }));
}
