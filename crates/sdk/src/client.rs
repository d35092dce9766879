use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use evstream_types::{CONTENT_TYPE, Event, LAST_EVENT_ID, StreamParser};
use futures::Stream;
use parking_lot::RwLock;
use reqwest::{
    Client, Request, StatusCode,
    header::{ACCEPT, CACHE_CONTROL, HeaderValue},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, Result},
    types::{ClientConfig, ConnectionState},
};

/// Streaming client - a reconnecting event stream subscriber
///
/// The client connects as soon as it is created and keeps reconnecting
/// after failures, resuming from the last event id it received. Events from
/// all connections are delivered through a single ordered sequence which
/// ends only when the client is closed or the server answers
/// `204 No Content`.
///
/// # Example
///
/// ```ignore
/// use evstream_sdk::StreamingClient;
///
/// let mut client = StreamingClient::from_url("http://localhost:4437/events")?;
///
/// while let Some(event) = client.next_event().await {
///     println!("{}: {}", event.kind(), event.data);
/// }
///
/// client.close().await;
/// ```
pub struct StreamingClient {
    /// Events relayed by the connection task
    events: mpsc::Receiver<Event>,

    /// Stops the connection task
    cancel: CancellationToken,

    /// Connection task, taken on close
    task: Option<JoinHandle<()>>,

    /// State shared with the connection task
    shared: Arc<Shared>,
}

impl StreamingClient {
    /// Create a client and start connecting in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let ClientConfig {
            request,
            client,
            cancel,
            reconnection_time,
            buffer,
        } = config;

        if request.try_clone().is_none() {
            return Err(ClientError::UncloneableRequest);
        }

        let cancel = cancel
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
        let shared = Arc::new(Shared::new(reconnection_time));

        let lifecycle = Lifecycle {
            request,
            client: client.unwrap_or_default(),
            events: event_tx,
            cancel: cancel.clone(),
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(lifecycle.run());

        Ok(Self {
            events: event_rx,
            cancel,
            task: Some(task),
            shared,
        })
    }

    /// Create a client issuing `GET url` with the default HTTP client
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(ClientConfig::from_url(url)?)
    }

    /// Wait for the next event. `None` once the client has stopped.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Stop the client and wait for the connection task to finish
    ///
    /// Events that were received but not yet consumed are discarded. Calling
    /// `close` again has no effect.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection task failed");
            }
            debug!("Streaming client closed");
        }
        self.events.close();
        while self.events.try_recv().is_ok() {}
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Id of the last event received, sent as `Last-Event-ID` on reconnect
    pub fn last_event_id(&self) -> Option<String> {
        let session = self.shared.session.read();
        (!session.last_event_id.is_empty()).then(|| session.last_event_id.clone())
    }

    /// Delay applied before the next reconnection attempt
    pub fn reconnection_time(&self) -> Duration {
        self.shared.session.read().reconnection_time
    }
}

impl Stream for StreamingClient {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        // The task notices the cancellation and exits on its own
        self.cancel.cancel();
    }
}

/// Values carried from one connection to the next
struct Session {
    last_event_id: String,
    reconnection_time: Duration,
}

struct Shared {
    state: RwLock<ConnectionState>,
    session: RwLock<Session>,
}

impl Shared {
    fn new(reconnection_time: Duration) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Connecting),
            session: RwLock::new(Session {
                last_event_id: String::new(),
                reconnection_time,
            }),
        }
    }
}

/// Why a connection attempt ended without an error
enum Stop {
    /// The server answered `204 No Content`
    Terminated,
    /// The client was closed
    Cancelled,
}

/// Background connect-and-stream loop
struct Lifecycle {
    request: Request,
    client: Client,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl Lifecycle {
    async fn run(self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            match self.connect().await {
                Ok(Stop::Terminated) => {
                    info!(url = %self.request.url(), "Server asked the client to stop reconnecting");
                    break;
                }
                Ok(Stop::Cancelled) => break,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }

                    let delay = self.shared.session.read().reconnection_time;
                    self.set_state(ConnectionState::Retrying);
                    warn!(
                        url = %self.request.url(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Connection lost, scheduling reconnection"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        debug!(url = %self.request.url(), "Connection task finished");
    }

    /// Run one connection attempt
    async fn connect(&self) -> Result<Stop> {
        let mut request = self
            .request
            .try_clone()
            .ok_or(ClientError::UncloneableRequest)?;

        let last_event_id = self.shared.session.read().last_event_id.clone();
        let headers = request.headers_mut();
        headers.insert(ACCEPT, HeaderValue::from_static(CONTENT_TYPE));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if !last_event_id.is_empty() {
            if let Some(value) = resume_header(&last_event_id) {
                headers.insert(LAST_EVENT_ID, value);
            }
        }

        debug!(url = %request.url(), last_event_id = %last_event_id, "Connecting");
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Stop::Cancelled),
            response = self.client.execute(request) => response?,
        };

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Stop::Terminated);
        }
        if !status.is_success() {
            return Err(ClientError::Status(status));
        }

        self.set_state(ConnectionState::Streaming);
        info!(url = %self.request.url(), "Connected");

        let mut parser =
            StreamParser::with_last_event_id(Box::pin(response.bytes_stream()), last_event_id);
        let result = self.relay(&mut parser).await;
        self.persist(parser.last_event_id(), parser.reconnection_time());
        result
    }

    /// Forward parsed events to the consumer until the stream ends
    async fn relay<S>(&self, parser: &mut StreamParser<S>) -> Result<Stop>
    where
        S: Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Stop::Cancelled),
                event = parser.next_event() => event?,
            };
            let Some(event) = event else {
                return Err(ClientError::ConnectionClosed);
            };
            self.persist(parser.last_event_id(), parser.reconnection_time());

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Stop::Cancelled),
                permit = self.events.reserve() => match permit {
                    Ok(permit) => permit.send(event),
                    // Consumer is gone
                    Err(_) => return Ok(Stop::Cancelled),
                },
            }
        }
    }

    fn persist(&self, last_event_id: &str, reconnection_time: Option<Duration>) {
        let mut session = self.shared.session.write();
        if session.last_event_id != last_event_id {
            session.last_event_id = last_event_id.to_string();
        }
        // Zero keeps the current delay
        if let Some(delay) = reconnection_time.filter(|delay| !delay.is_zero()) {
            session.reconnection_time = delay;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write() = state;
    }
}

/// Value of the `Last-Event-ID` header for `id`.
///
/// Control characters cannot be sent in a header. They are replaced with
/// U+FFFD, so the server still receives an id and falls back to replaying
/// its whole window.
fn resume_header(id: &str) -> Option<HeaderValue> {
    if let Ok(value) = HeaderValue::from_str(id) {
        return Some(value);
    }

    warn!(last_event_id = ?id, "Last event id contains control characters");
    let sanitized: String = id
        .chars()
        .map(|c| if c.is_control() && c != '\t' { '\u{FFFD}' } else { c })
        .collect();
    HeaderValue::from_str(&sanitized).ok()
}
