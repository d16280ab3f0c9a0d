//! Core types for the relay.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Event type used when a publish does not name one.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Per-channel event identifier. Strictly increasing within a channel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EventId(pub u64);

impl EventId {
    /// Resume point that replays everything retained.
    pub const ZERO: EventId = EventId(0);

    pub fn next(self) -> Self {
        EventId(self.0 + 1)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(EventId)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// Whether this timestamp is older than `max_age` relative to `now`.
    pub fn expired(self, now: Timestamp, max_age: Duration) -> bool {
        now.0.saturating_sub(self.0) > max_age.as_micros() as i64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A recorded event. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Identifier assigned by the store.
    pub id: EventId,

    /// Application-defined type ("message" unless the publisher named one).
    pub event_type: String,

    /// Opaque payload.
    pub payload: Vec<u8>,

    /// When the event was appended.
    pub timestamp: Timestamp,
}

impl Event {
    /// Payload as UTF-8, if it is valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// The argument to a publish: either a bare payload that takes the default
/// type, or an explicit type/payload pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Data(Vec<u8>),
    Typed { event_type: String, payload: Vec<u8> },
}

impl Message {
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Message::Data(payload.into())
    }

    pub fn typed(event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Message::Typed {
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    /// Interpret a JSON value the way dynamic callers hand messages over.
    ///
    /// An object with exactly one key is a `type => payload` pair; anything
    /// else is a bare payload. String values are used verbatim, everything
    /// else is serialized as JSON.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if let serde_json::Value::Object(map) = value {
            if map.len() == 1 {
                if let Some((event_type, payload)) = map.iter().next() {
                    return Ok(Message::Typed {
                        event_type: event_type.clone(),
                        payload: json_payload(payload)?,
                    });
                }
            }
        }
        Ok(Message::Data(json_payload(value)?))
    }

    /// Split into `(type, payload)`, filling in `default_type` for bare data.
    pub fn resolve(self, default_type: &str) -> (String, Vec<u8>) {
        match self {
            Message::Data(payload) => (default_type.to_string(), payload),
            Message::Typed {
                event_type,
                payload,
            } => (event_type, payload),
        }
    }
}

fn json_payload(value: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone().into_bytes()),
        other => serde_json::to_vec(other),
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Data(s.as_bytes().to_vec())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Data(s.into_bytes())
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Message::Data(payload)
    }
}

/// An event handed to a session, tagged with the channel it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub channel: Arc<str>,
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id_ordering() {
        assert!(EventId(2) > EventId(1));
        assert_eq!(EventId(4).next(), EventId(5));
        assert_eq!("17".parse::<EventId>().unwrap(), EventId(17));
        assert!("abc".parse::<EventId>().is_err());
    }

    #[test]
    fn test_message_resolve_default_type() {
        let (event_type, payload) = Message::from("hello").resolve(DEFAULT_EVENT_TYPE);
        assert_eq!(event_type, "message");
        assert_eq!(payload, b"hello");

        let (event_type, payload) = Message::typed("notice", "hi").resolve(DEFAULT_EVENT_TYPE);
        assert_eq!(event_type, "notice");
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn test_message_from_json_single_key() {
        let msg = Message::from_json(&json!({"notice": "hi"})).unwrap();
        assert_eq!(msg, Message::typed("notice", "hi"));

        let msg = Message::from_json(&json!({"update": {"count": 3}})).unwrap();
        assert_eq!(msg, Message::typed("update", br#"{"count":3}"#.to_vec()));
    }

    #[test]
    fn test_message_from_json_bare_payload() {
        let msg = Message::from_json(&json!("plain")).unwrap();
        assert_eq!(msg, Message::data("plain"));

        // Two keys is not a type/payload pair.
        let msg = Message::from_json(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(msg, Message::data(br#"{"a":1,"b":2}"#.to_vec()));
    }

    #[test]
    fn test_timestamp_expired() {
        let now = Timestamp(10_000_000);
        assert!(Timestamp(0).expired(now, Duration::from_secs(5)));
        assert!(!Timestamp(8_000_000).expired(now, Duration::from_secs(5)));
    }
}
