//! End-to-end tests against local HTTP servers.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use evstream_sdk::{ClientConfig, ConnectionState, Event, StreamingClient};
use evstream_server::BroadcastHandler;
use parking_lot::Mutex;
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::from_url(&format!("http://{addr}/events"))
        .unwrap()
        .with_reconnection_time(Duration::from_millis(20))
}

fn stream_body(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn next(client: &mut StreamingClient) -> Option<Event> {
    tokio::time::timeout(TIMEOUT, client.next_event())
        .await
        .expect("timed out waiting for an event")
}

#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<AtomicUsize>,
    last_event_ids: Arc<Mutex<Vec<Option<String>>>>,
}

impl Recorder {
    /// Record the request and return its zero-based index
    fn record(&self, headers: &HeaderMap) -> usize {
        let id = headers
            .get("last-event-id")
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        self.last_event_ids.lock().push(id);
        self.requests.fetch_add(1, Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_receives_events() {
    let router = Router::new().route(
        "/events",
        get(|| async { stream_body("data:one\n\nevent:tick\ndata:two\n\n") }),
    );
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();

    let first = next(&mut client).await.unwrap();
    assert_eq!(first.data, "one");
    assert_eq!(first.kind(), "message");

    let second = next(&mut client).await.unwrap();
    assert_eq!(second.data, "two");
    assert_eq!(second.event_type, "tick");

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_sends_stream_request_headers() {
    let seen: Arc<Mutex<Option<HeaderMap>>> = Arc::default();
    let router = Router::new()
        .route(
            "/events",
            get(
                |State(seen): State<Arc<Mutex<Option<HeaderMap>>>>, headers: HeaderMap| async move {
                    *seen.lock() = Some(headers);
                    stream_body("data:x\n\n")
                },
            ),
        )
        .with_state(Arc::clone(&seen));
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();
    next(&mut client).await.unwrap();
    client.close().await;

    let headers = seen.lock().clone().unwrap();
    assert_eq!(headers[header::ACCEPT], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert!(headers.get("last-event-id").is_none());
}

#[tokio::test]
async fn test_reconnects_with_last_event_id() {
    let recorder = Recorder::default();
    let router = Router::new()
        .route(
            "/events",
            get(|State(recorder): State<Recorder>, headers: HeaderMap| async move {
                match recorder.record(&headers) {
                    0 => stream_body("id:1\nretry:10\ndata:first\n\n"),
                    _ => stream_body("id:2\ndata:second\n\n"),
                }
            }),
        )
        .with_state(recorder.clone());
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();

    assert_eq!(next(&mut client).await.unwrap().data, "first");
    assert_eq!(next(&mut client).await.unwrap().data, "second");
    assert_eq!(client.reconnection_time(), Duration::from_millis(10));

    client.close().await;

    let ids = recorder.last_event_ids.lock().clone();
    assert_eq!(ids[0], None);
    assert_eq!(ids[1].as_deref(), Some("1"));
    assert_eq!(client.last_event_id().as_deref(), Some("2"));
}

#[tokio::test]
async fn test_empty_id_clears_resume_point() {
    let recorder = Recorder::default();
    let router = Router::new()
        .route(
            "/events",
            get(|State(recorder): State<Recorder>, headers: HeaderMap| async move {
                match recorder.record(&headers) {
                    0 => stream_body("id:7\ndata:a\n\nid\ndata:b\n\n"),
                    _ => stream_body("data:c\n\n"),
                }
            }),
        )
        .with_state(recorder.clone());
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();
    assert_eq!(next(&mut client).await.unwrap().id, "7");
    assert_eq!(next(&mut client).await.unwrap().id, "");
    assert_eq!(next(&mut client).await.unwrap().data, "c");
    client.close().await;

    let ids = recorder.last_event_ids.lock().clone();
    assert_eq!(ids[1], None);
}

#[tokio::test]
async fn test_zero_retry_keeps_reconnection_time() {
    let router = Router::new().route(
        "/events",
        get(|| async { stream_body("retry:0\ndata:x\n\n") }),
    );
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();

    let event = next(&mut client).await.unwrap();
    assert_eq!(event.retry, Some(Duration::ZERO));
    assert_eq!(client.reconnection_time(), Duration::from_millis(20));

    client.close().await;
}

#[tokio::test]
async fn test_control_characters_in_id_still_resume() {
    let recorder = Recorder::default();
    let router = Router::new()
        .route(
            "/events",
            get(|State(recorder): State<Recorder>, headers: HeaderMap| async move {
                match recorder.record(&headers) {
                    0 => stream_body("id:a\u{1}b\ndata:first\n\n"),
                    _ => stream_body("data:second\n\n"),
                }
            }),
        )
        .with_state(recorder.clone());
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();
    assert_eq!(next(&mut client).await.unwrap().id, "a\u{1}b");
    assert_eq!(next(&mut client).await.unwrap().data, "second");
    client.close().await;

    let ids = recorder.last_event_ids.lock().clone();
    assert_eq!(ids[1].as_deref(), Some("a\u{FFFD}b"));
}

#[tokio::test]
async fn test_resumes_non_ascii_id_from_handler() {
    #[derive(Clone)]
    struct Flaky {
        handler: BroadcastHandler,
        requests: Arc<AtomicUsize>,
    }

    async fn flaky(State(flaky): State<Flaky>, request: Request) -> Response {
        let (parts, _body) = request.into_parts();
        match flaky.requests.fetch_add(1, Ordering::SeqCst) {
            0 => stream_body("id:café-1\ndata:one\n\n"),
            _ => flaky.handler.respond(&parts),
        }
    }

    let handler: BroadcastHandler = BroadcastHandler::default();
    for (id, data) in [("café-1", "one"), ("café-2", "two")] {
        handler.send(Event::new(data).with_id(id));
    }

    let router = Router::new().route("/events", get(flaky)).with_state(Flaky {
        handler: handler.clone(),
        requests: Arc::default(),
    });
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr).with_buffer(4)).unwrap();

    assert_eq!(next(&mut client).await.unwrap().data, "one");
    let resumed = next(&mut client).await.unwrap();
    assert_eq!(resumed.data, "two");
    assert_eq!(resumed.id, "café-2");

    client.close().await;
    handler.close().await;
}

#[tokio::test]
async fn test_no_content_stops_client() {
    let recorder = Recorder::default();
    let router = Router::new()
        .route(
            "/events",
            get(|State(recorder): State<Recorder>, headers: HeaderMap| async move {
                match recorder.record(&headers) {
                    0 => stream_body("data:only\n\n"),
                    _ => StatusCode::NO_CONTENT.into_response(),
                }
            }),
        )
        .with_state(recorder.clone());
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();

    assert_eq!(next(&mut client).await.unwrap().data, "only");
    assert!(next(&mut client).await.is_none());
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(recorder.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retries_after_error_status() {
    let recorder = Recorder::default();
    let router = Router::new()
        .route(
            "/events",
            get(|State(recorder): State<Recorder>, headers: HeaderMap| async move {
                match recorder.record(&headers) {
                    0 => (StatusCode::INTERNAL_SERVER_ERROR, "data:ignored\n\n").into_response(),
                    _ => stream_body("data:recovered\n\n"),
                }
            }),
        )
        .with_state(recorder.clone());
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();

    assert_eq!(next(&mut client).await.unwrap().data, "recovered");
    assert!(recorder.requests.load(Ordering::SeqCst) >= 2);

    client.close().await;
}

#[tokio::test]
async fn test_close_while_delivery_is_pending() {
    let router = Router::new().route(
        "/events",
        get(|| async { stream_body("data:1\n\ndata:2\n\ndata:3\n\ndata:4\n\n") }),
    );
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr).with_buffer(1)).unwrap();

    // Let the connection task fill the buffer and block on delivery
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(TIMEOUT, client.close())
        .await
        .expect("close did not complete");
    assert!(client.next_event().await.is_none());
}

#[tokio::test]
async fn test_close_while_waiting_for_events() {
    let handler: BroadcastHandler = BroadcastHandler::default();
    let addr = spawn_server(handler.router("/events")).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();

    let waiter = tokio::time::timeout(Duration::from_millis(100), client.next_event()).await;
    assert!(waiter.is_err());

    client.close().await;
    assert!(client.next_event().await.is_none());
}

#[tokio::test]
async fn test_drop_disconnects_from_handler() {
    let handler: BroadcastHandler = BroadcastHandler::default();
    let addr = spawn_server(handler.router("/events")).await;

    let client = StreamingClient::new(config(addr)).unwrap();
    wait_for_subscribers(&handler, 1).await;

    drop(client);

    // The server notices the disconnect on its next write
    tokio::time::timeout(TIMEOUT, async {
        while handler.subscriber_count() > 0 {
            handler.send(Event::new("ping"));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber was not removed");
}

#[tokio::test]
async fn test_streams_from_broadcast_handler() {
    let handler: BroadcastHandler = BroadcastHandler::default();
    let addr = spawn_server(handler.router("/events")).await;

    let mut client = StreamingClient::new(config(addr).with_buffer(4)).unwrap();
    wait_for_subscribers(&handler, 1).await;

    handler.send(Event::new("hello").with_id("1"));
    handler.send(Event::new("world").with_id("2").with_type("greeting"));

    let first = next(&mut client).await.unwrap();
    assert_eq!(first.data, "hello");
    assert_eq!(first.id, "1");

    let second = next(&mut client).await.unwrap();
    assert_eq!(second.data, "world");
    assert_eq!(second.kind(), "greeting");

    client.close().await;
    handler.close().await;
}

#[tokio::test]
async fn test_resumes_from_handler_replay_window() {
    #[derive(Clone)]
    struct Flaky {
        handler: BroadcastHandler,
        recorder: Recorder,
    }

    // The first connection drops after delivering event 1; later
    // connections are served by the handler.
    async fn flaky(State(flaky): State<Flaky>, request: Request) -> Response {
        let (parts, _body) = request.into_parts();
        match flaky.recorder.record(&parts.headers) {
            0 => stream_body("id:1\ndata:one\n\n"),
            _ => flaky.handler.respond(&parts),
        }
    }

    let handler: BroadcastHandler = BroadcastHandler::default();
    let recorder = Recorder::default();
    handler.send(Event::new("one").with_id("1"));
    handler.send(Event::new("two").with_id("2"));
    handler.send(Event::new("three").with_id("3"));

    let router = Router::new().route("/events", get(flaky)).with_state(Flaky {
        handler: handler.clone(),
        recorder: recorder.clone(),
    });
    let addr = spawn_server(router).await;

    let mut client = StreamingClient::new(config(addr).with_buffer(4)).unwrap();

    let received: Vec<String> = [
        next(&mut client).await.unwrap(),
        next(&mut client).await.unwrap(),
        next(&mut client).await.unwrap(),
    ]
    .into_iter()
    .map(|event| event.data)
    .collect();
    assert_eq!(received, vec!["one", "two", "three"]);

    // Events sent after the resume arrive live
    handler.send(Event::new("four").with_id("4"));
    assert_eq!(next(&mut client).await.unwrap().data, "four");

    let ids = recorder.last_event_ids.lock().clone();
    assert_eq!(ids[1].as_deref(), Some("1"));

    client.close().await;
    handler.close().await;
}

#[tokio::test]
async fn test_handler_close_ends_in_retries() {
    let handler: BroadcastHandler = BroadcastHandler::default();
    let addr = spawn_server(handler.router("/events")).await;

    let mut client = StreamingClient::new(config(addr)).unwrap();
    wait_for_subscribers(&handler, 1).await;

    handler.close().await;

    // Every reconnection is now answered with 503
    tokio::time::timeout(TIMEOUT, async {
        while client.state() != ConnectionState::Retrying {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client did not start retrying");

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

async fn wait_for_subscribers(handler: &BroadcastHandler, count: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while handler.subscriber_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client did not connect");
}
