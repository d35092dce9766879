//! evstream SDK
//!
//! A reconnecting client for server-sent event streams.
//!
//! [`StreamingClient`] connects in the background, parses the response body
//! into [`Event`]s and reconnects whenever the connection drops. Each
//! reconnection carries the id of the last received event in the
//! `Last-Event-ID` header so a replaying server can fill the gap, and waits
//! for the delay most recently advertised by the server through `retry`.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//!
//! use evstream_sdk::{ClientConfig, StreamingClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_url("http://localhost:4437/events")?
//!         .with_reconnection_time(Duration::from_secs(1))
//!         .with_buffer(16);
//!
//!     let mut client = StreamingClient::new(config)?;
//!
//!     while let Some(event) = client.next_event().await {
//!         println!("[{}] {}", event.kind(), event.data);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Termination
//!
//! The event sequence ends when:
//!
//! - [`StreamingClient::close`] is called or the client is dropped
//! - the cancellation token given through [`ClientConfig::with_cancellation`]
//!   is cancelled
//! - the server answers `204 No Content`
//!
//! Every other failure is retried.

pub mod client;
pub mod error;
pub mod types;

pub use client::StreamingClient;
pub use error::{ClientError, Result};
pub use evstream_types::Event;
pub use types::{ClientConfig, ConnectionState, DEFAULT_BUFFER, DEFAULT_RECONNECTION_TIME};
