//! Incremental event stream parser.
//!
//! [`EventBuilder`] interprets lines according to the field rules of the
//! event stream format and is independent of any I/O. [`StreamParser`] feeds
//! it from an asynchronous byte stream.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};

use crate::{
    event::{DEFAULT_EVENT_TYPE, Event},
    scan::{Scan, scan_line},
};

const BOM: &[u8] = "\u{FEFF}".as_bytes();

/// Assembles lines into events and keeps the session-scoped sticky fields.
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    event_type: Option<String>,
    data: Vec<String>,
    retry: Option<Duration>,
    last_event_id: String,
    reconnection_time: Option<Duration>,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session that already knows the id of the last event.
    pub fn with_last_event_id(last_event_id: impl Into<String>) -> Self {
        Self {
            last_event_id: last_event_id.into(),
            ..Default::default()
        }
    }

    /// Id of the last event seen, carried across records.
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Reconnection delay requested by the last valid `retry` field.
    pub fn reconnection_time(&self) -> Option<Duration> {
        self.reconnection_time
    }

    /// Interpret a single line without its terminator.
    ///
    /// Returns an event when `line` is the blank line closing a record that
    /// carried at least one `data` field.
    pub fn feed(&mut self, line: &[u8]) -> Option<Event> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line[0] == b':' {
            return None;
        }

        let (name, value) = match memchr::memchr(b':', line) {
            Some(colon) => {
                let value = &line[colon + 1..];
                let value = match value {
                    [b' ', rest @ ..] => rest,
                    _ => value,
                };
                (&line[..colon], value)
            }
            None => (line, &[][..]),
        };

        match name {
            b"event" => {
                self.event_type = Some(decode(value));
            }
            b"data" => {
                self.data.push(decode(value));
            }
            b"id" => {
                if memchr::memchr(0, value).is_none() {
                    self.last_event_id = decode(value);
                }
            }
            b"retry" => {
                if let Some(millis) = parse_retry(value) {
                    let retry = Duration::from_millis(millis);
                    self.retry = Some(retry);
                    self.reconnection_time = Some(retry);
                }
            }
            _ => {}
        }
        None
    }

    /// Drop the record being assembled, keeping the sticky fields.
    pub fn reset(&mut self) {
        self.event_type = None;
        self.data.clear();
        self.retry = None;
    }

    fn dispatch(&mut self) -> Option<Event> {
        let event_type = self.event_type.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(Event {
            event_type: event_type.unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
            id: self.last_event_id.clone(),
            retry,
        })
    }
}

fn decode(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

fn parse_retry(value: &[u8]) -> Option<u64> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// Reads events from a stream of byte chunks.
///
/// The parser keeps the session state of one connection: the id of the last
/// event and the reconnection delay requested by the server.
pub struct StreamParser<S> {
    source: S,
    buffer: BytesMut,
    builder: EventBuilder,
    at_eof: bool,
    bom_checked: bool,
}

impl<S, B, E> StreamParser<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    pub fn new(source: S) -> Self {
        Self::with_builder(source, EventBuilder::new())
    }

    /// Create a parser resuming a session whose last event id is known.
    pub fn with_last_event_id(source: S, last_event_id: impl Into<String>) -> Self {
        Self::with_builder(source, EventBuilder::with_last_event_id(last_event_id))
    }

    fn with_builder(source: S, builder: EventBuilder) -> Self {
        Self {
            source,
            buffer: BytesMut::new(),
            builder,
            at_eof: false,
            bom_checked: false,
        }
    }

    /// Id of the last event seen in this session.
    pub fn last_event_id(&self) -> &str {
        self.builder.last_event_id()
    }

    /// Reconnection delay requested by the server, if any.
    pub fn reconnection_time(&self) -> Option<Duration> {
        self.builder.reconnection_time()
    }

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` once the source is exhausted. A record left open at
    /// the end of the source is discarded. Errors of the source are returned
    /// unchanged.
    pub async fn next_event(&mut self) -> Result<Option<Event>, E> {
        loop {
            if !self.bom_checked && !self.skip_bom() {
                self.fill().await?;
                continue;
            }

            match scan_line(&self.buffer, self.at_eof) {
                Scan::Token { advance, line } => {
                    let len = line.len();
                    let line = self.buffer.split_to(len);
                    self.buffer.advance(advance - len);
                    if let Some(event) = self.builder.feed(&line) {
                        return Ok(Some(event));
                    }
                }
                Scan::Incomplete => self.fill().await?,
                Scan::Exhausted => {
                    self.builder.reset();
                    return Ok(None);
                }
            }
        }
    }

    /// Strip a leading byte order mark. Returns `false` while the buffer is
    /// too short to decide.
    fn skip_bom(&mut self) -> bool {
        let len = self.buffer.len().min(BOM.len());
        if self.buffer[..len] != BOM[..len] {
            self.bom_checked = true;
        } else if len == BOM.len() {
            self.buffer.advance(len);
            self.bom_checked = true;
        } else if self.at_eof {
            self.bom_checked = true;
        }
        self.bom_checked
    }

    async fn fill(&mut self) -> Result<(), E> {
        match self.source.next().await {
            Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
            Some(Err(e)) => return Err(e),
            None => self.at_eof = true,
        }
        Ok(())
    }
}
