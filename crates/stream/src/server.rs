//! Broadcast handler serving event streams over axum.

use std::{borrow::Cow, convert::Infallible, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use evstream_types::{CONTENT_TYPE, Event, LAST_EVENT_ID};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    store::{HandlerError, SubscriberStore, Subscription},
    types::HandlerConfig,
};

/// Fans events out to every connected client.
///
/// Each connection gets a bounded queue. [`send`](Self::send) never waits:
/// a client whose queue is full is disconnected instead. The most recent
/// events are retained so that clients reconnecting with `Last-Event-ID`
/// receive what they missed.
///
/// # Example
///
/// ```rust,no_run
/// use evstream_server::{BroadcastHandler, HandlerConfig};
/// use evstream_types::Event;
///
/// # async fn example() -> std::io::Result<()> {
/// let handler: BroadcastHandler = BroadcastHandler::new(HandlerConfig::default());
/// let router = handler.router("/events");
///
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:4437").await?;
/// tokio::spawn(async move { axum::serve(listener, router).await });
///
/// handler.send(Event::new("hello").with_id("1"));
/// # Ok(())
/// # }
/// ```
pub struct BroadcastHandler<C = ()> {
    store: Arc<SubscriberStore>,
    config: Arc<HandlerConfig<C>>,
}

impl<C> Clone for BroadcastHandler<C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<C> Default for BroadcastHandler<C>
where
    C: Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(HandlerConfig::default())
    }
}

impl<C> BroadcastHandler<C>
where
    C: Default + Send + Sync + 'static,
{
    pub fn new(config: HandlerConfig<C>) -> Self {
        Self {
            store: SubscriberStore::new(config.options),
            config: Arc::new(config),
        }
    }

    /// Queue `event` for every connected client and retain it for replay.
    ///
    /// Returns the number of clients the event was queued for.
    pub fn send(&self, event: Event) -> usize {
        self.store.broadcast(event)
    }

    /// Register a subscriber without an HTTP connection.
    ///
    /// [`respond`](Self::respond) is built on this; it is also useful for
    /// in-process consumers.
    pub fn subscribe(&self, last_event_id: Option<&str>) -> Result<Subscription, HandlerError> {
        self.store.register(last_event_id)
    }

    /// Serve an inbound request as an event stream.
    ///
    /// The client is registered before the response is produced. After
    /// shutdown the request is answered with `503 Service Unavailable`.
    pub fn respond(&self, parts: &Parts) -> Response {
        let context = match &self.config.on_connect {
            Some(hook) => hook(parts),
            None => C::default(),
        };

        let subscription = match self.subscribe(last_event_id(&parts.headers).as_deref()) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(error = %e, "Rejecting event stream connection");
                return (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response();
            }
        };
        info!(subscriber = subscription.id(), "Client connected");

        let (body_tx, body_rx) = mpsc::channel(1);
        let connection = Connection {
            subscription,
            context,
            config: Arc::clone(&self.config),
            body: body_tx,
        };
        self.store.tracker().spawn(connection.serve());

        (
            [
                (header::CONTENT_TYPE, CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-store"),
            ],
            Body::from_stream(ReceiverStream::new(body_rx)),
        )
            .into_response()
    }

    /// Create a router serving the event stream on `GET path`.
    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(path, get(handle_stream::<C>))
            .with_state(self.clone())
    }

    /// Stop accepting clients, disconnect every connected client and wait
    /// for all connections to finish.
    pub async fn close(&self) {
        let disconnected = self.store.close();
        info!(subscribers = disconnected, "Closing broadcast handler");
        self.store.wait_idle().await;
        debug!("Broadcast handler closed");
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }

    /// Number of currently registered clients.
    pub fn subscriber_count(&self) -> usize {
        self.store.subscriber_count()
    }

    /// Events currently retained for replay, oldest first.
    pub fn replay_window(&self) -> Vec<Arc<Event>> {
        self.store.replay_window()
    }
}

/// GET - Stream events
async fn handle_stream<C>(State(handler): State<BroadcastHandler<C>>, request: Request) -> Response
where
    C: Default + Send + Sync + 'static,
{
    let (parts, _body) = request.into_parts();
    handler.respond(&parts)
}

/// Non-ASCII ids arrive as raw UTF-8 header bytes.
fn last_event_id(headers: &HeaderMap) -> Option<Cow<'_, str>> {
    headers
        .get(LAST_EVENT_ID)
        .map(|v| String::from_utf8_lossy(v.as_bytes()))
        .filter(|v| !v.is_empty())
}

/// Per-connection serve loop state.
struct Connection<C> {
    subscription: Subscription,
    context: C,
    config: Arc<HandlerConfig<C>>,
    body: mpsc::Sender<Result<Bytes, Infallible>>,
}

impl<C> Connection<C> {
    async fn serve(mut self) {
        let id = self.subscription.id();

        if let Some(init) = &self.config.on_init {
            for event in init(&self.context) {
                if !write(&self.body, &event).await {
                    return;
                }
            }
        }

        for event in self.subscription.take_replay() {
            if allows(&self.config, &self.context, &event) && !write(&self.body, &event).await {
                return;
            }
        }

        loop {
            let event = tokio::select! {
                event = self.subscription.recv() => event,
                _ = self.body.closed() => {
                    debug!(subscriber = id, "Peer went away");
                    break;
                }
            };

            let Some(event) = event else {
                debug!(subscriber = id, "Subscriber queue closed");
                break;
            };
            if allows(&self.config, &self.context, &event) && !write(&self.body, &event).await {
                debug!(subscriber = id, "Peer went away while writing");
                break;
            }
        }
    }
}

fn allows<C>(config: &HandlerConfig<C>, context: &C, event: &Event) -> bool {
    config
        .filter
        .as_ref()
        .is_none_or(|filter| filter(context, event))
}

/// Write one record to the peer. `false` once the peer is gone.
async fn write(body: &mpsc::Sender<Result<Bytes, Infallible>>, event: &Event) -> bool {
    body.send(Ok(event.to_bytes())).await.is_ok()
}
