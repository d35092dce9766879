use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur in the streaming client
#[derive(Error, Debug)]
pub enum ClientError {
    /// The base request has a streaming body and cannot be replayed on reconnect
    #[error("Request cannot be cloned for reconnection")]
    UncloneableRequest,

    /// The endpoint URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Transport error (connection refused, reset, I/O failure mid-stream)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a status that does not open a stream
    #[error("Unexpected status: {0}")]
    Status(StatusCode),

    /// The server ended the stream without asking the client to stop
    #[error("Connection was closed by the server")]
    ConnectionClosed,
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
