use std::{fmt, time::Duration};

use reqwest::{Client, Method, Request, Url};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};

/// Reconnection delay used until the server sends a `retry` field.
pub const DEFAULT_RECONNECTION_TIME: Duration = Duration::from_secs(3);

/// Number of events buffered between the connection task and the consumer.
pub const DEFAULT_BUFFER: usize = 1;

/// Lifecycle state of a [`StreamingClient`](crate::StreamingClient)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Establishing a connection
    Connecting,

    /// Connected and receiving events
    Streaming,

    /// Disconnected, waiting for the reconnection delay
    Retrying,

    /// Stopped for good, either closed or told by the server to stop
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Streaming => write!(f, "streaming"),
            ConnectionState::Retrying => write!(f, "retrying"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Configuration for a streaming client
#[derive(Debug)]
pub struct ClientConfig {
    /// Base request, cloned for every connection attempt
    pub request: Request,

    /// HTTP client used to send the request
    pub client: Option<Client>,

    /// External cancellation; cancelling it stops the client
    pub cancel: Option<CancellationToken>,

    /// Delay between reconnection attempts until the server overrides it
    pub reconnection_time: Duration,

    /// Events buffered ahead of the consumer
    pub buffer: usize,
}

impl ClientConfig {
    /// Create a configuration from a base request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client: None,
            cancel: None,
            reconnection_time: DEFAULT_RECONNECTION_TIME,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Create a configuration issuing `GET url`
    pub fn from_url(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        Ok(Self::new(Request::new(Method::GET, url)))
    }

    /// Use a specific HTTP client
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Stop the client when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Set the initial reconnection delay
    pub fn with_reconnection_time(mut self, delay: Duration) -> Self {
        self.reconnection_time = delay;
        self
    }

    /// Set how many events may be buffered ahead of the consumer
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}
