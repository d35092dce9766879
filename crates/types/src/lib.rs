//! Shared building blocks for server-sent event streams.
//!
//! - [`Event`] - the record exchanged between servers and clients, with its
//!   wire serialization
//! - [`scan_line`] - a pure line tokenizer for fragmented input
//! - [`StreamParser`] - turns a stream of byte chunks into events while
//!   tracking the last event id and the requested reconnection delay
//!
//! # Example
//!
//! ```rust
//! use evstream_types::{Event, StreamParser};
//! use futures::stream;
//!
//! # async fn example() {
//! let wire = Event::new("hello").with_id("1").to_bytes();
//! let chunks = stream::iter(vec![Ok::<_, std::io::Error>(wire)]);
//!
//! let mut parser = StreamParser::new(chunks);
//! let event = parser.next_event().await.unwrap().unwrap();
//! assert_eq!(event.data, "hello");
//! assert_eq!(parser.last_event_id(), "1");
//! # }
//! ```

pub mod event;
pub mod parser;
pub mod scan;

pub use event::{CONTENT_TYPE, DEFAULT_EVENT_TYPE, Event, LAST_EVENT_ID};
pub use parser::{EventBuilder, StreamParser};
pub use scan::{Scan, scan_line};
