//! The event record exchanged between the parser, the client and the
//! broadcaster, and its wire serialization.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Type reported for events that did not carry an `event` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Media type of an event stream response.
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Request header carrying the id of the last event a client received.
pub const LAST_EVENT_ID: &str = "Last-Event-ID";

pub(crate) const FIELD_EVENT: &str = "event";
pub(crate) const FIELD_DATA: &str = "data";
pub(crate) const FIELD_ID: &str = "id";
pub(crate) const FIELD_RETRY: &str = "retry";

/// A single event of an event stream.
///
/// Field values are written verbatim by [`Event::to_bytes`]. They must not
/// contain `\r` or `\n`; embedded line breaks are not escaped and would split
/// the record on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event type. Empty means [`DEFAULT_EVENT_TYPE`].
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub event_type: String,

    /// Payload. Multiple `data` lines are joined with `\n`.
    #[serde(default)]
    pub data: String,

    /// Event id. Empty means no id was provided.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Reconnection delay advertised to the peer.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_retry",
        deserialize_with = "deserialize_retry"
    )]
    pub retry: Option<Duration>,
}

impl Event {
    /// Create an event carrying the given payload.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Set the event type
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Set the event id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the reconnection delay advertised to the receiving client
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Effective event type, falling back to [`DEFAULT_EVENT_TYPE`].
    pub fn kind(&self) -> &str {
        if self.event_type.is_empty() {
            DEFAULT_EVENT_TYPE
        } else {
            &self.event_type
        }
    }

    /// Serialize the event into its wire representation.
    ///
    /// Fields are written in the order `event`, `id`, `retry`, `data`. Empty
    /// type and id and a missing or zero retry are omitted; the `data` line is
    /// always present so that readers dispatch the record.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Append the wire representation of the event to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        if !self.event_type.is_empty() {
            put_field(buf, FIELD_EVENT, &self.event_type);
        }
        if !self.id.is_empty() {
            put_field(buf, FIELD_ID, &self.id);
        }
        if let Some(retry) = self.retry.filter(|retry| !retry.is_zero()) {
            put_field(buf, FIELD_RETRY, &retry.as_millis().to_string());
        }
        put_field(buf, FIELD_DATA, &self.data);
        buf.put_u8(b'\n');
    }

    fn encoded_len(&self) -> usize {
        // Field names, colons and terminators, plus a little room for retry.
        32 + self.event_type.len() + self.id.len() + self.data.len()
    }
}

fn put_field(buf: &mut BytesMut, name: &str, value: &str) {
    buf.reserve(name.len() + value.len() + 2);
    buf.put_slice(name.as_bytes());
    buf.put_u8(b':');
    buf.put_slice(value.as_bytes());
    buf.put_u8(b'\n');
}

fn serialize_retry<S>(retry: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match retry {
        Some(retry) => serializer.serialize_u64(retry.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

fn deserialize_retry<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}
