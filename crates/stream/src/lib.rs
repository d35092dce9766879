//! Event Stream Broadcaster
//!
//! Serves server-sent event streams to any number of clients and delivers
//! every sent event to all of them.
//!
//! # Features
//!
//! - **Fan-out**: every [`BroadcastHandler::send`] reaches each connected client, in order
//! - **Backpressure**: clients whose bounded queue fills up are disconnected,
//!   `send` never waits on a slow client
//! - **Replay**: recently sent events are retained and replayed to clients
//!   reconnecting with `Last-Event-ID`
//! - **Hooks**: per-connection context, initial snapshot events and
//!   per-client filtering
//! - **Graceful shutdown**: [`BroadcastHandler::close`] returns once every
//!   connection has finished
//!
//! # Protocol
//!
//! ```text
//! GET /events HTTP/1.1
//! Accept: text/event-stream
//! Last-Event-ID: 41
//!
//! HTTP/1.1 200 OK
//! Content-Type: text/event-stream
//! Cache-Control: no-store
//!
//! event:update
//! id:42
//! data:{"price": 42000}
//!
//! ```
//!
//! A handler that has been closed answers `503 Service Unavailable`.

pub mod server;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use server::BroadcastHandler;
pub use store::{HandlerError, Subscription};
pub use types::{
    ConnectHook, DEFAULT_QUEUE_CAPACITY, DEFAULT_REPLAY_CAPACITY, FilterHook, HandlerConfig,
    HandlerOptions, InitHook,
};
