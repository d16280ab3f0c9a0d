//! Record-only publishing for application tests.
//!
//! A [`Recorder`] captures `(channel, type, payload)` instead of touching
//! history or live listeners. Use it directly as a [`Publisher`], or switch a
//! whole [`Relay`](crate::Relay) into test mode with
//! [`Relay::enable_test_mode`](crate::Relay::enable_test_mode).
//!
//! Recorded events persist until [`Recorder::reset`] is called; reset between
//! test cases.

use crate::error::Result;
use crate::relay::Publisher;
use crate::types::{Message, DEFAULT_EVENT_TYPE};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// One captured publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedEvent {
    pub channel: String,
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl PublishedEvent {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Predicate over event types deciding what a recorder keeps.
#[derive(Clone)]
pub struct TypeFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl TypeFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Keep only the listed types.
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: HashSet<String> = types.into_iter().map(Into::into).collect();
        Self::new(move |t| types.contains(t))
    }

    pub fn matches(&self, event_type: &str) -> bool {
        (self.0)(event_type)
    }
}

impl fmt::Debug for TypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TypeFilter(..)")
    }
}

/// Captures publishes in order.
#[derive(Debug)]
pub struct Recorder {
    filter: Option<TypeFilter>,
    default_type: String,
    published: Mutex<Vec<PublishedEvent>>,
}

impl Recorder {
    pub fn new(filter: Option<TypeFilter>) -> Self {
        Self::with_default_type(filter, DEFAULT_EVENT_TYPE)
    }

    pub fn with_default_type(filter: Option<TypeFilter>, default_type: impl Into<String>) -> Self {
        Self {
            filter,
            default_type: default_type.into(),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Capture a publish. Returns whether the filter kept it.
    pub fn record(&self, channel: &str, message: Message) -> bool {
        let (event_type, payload) = message.resolve(&self.default_type);
        if let Some(filter) = &self.filter {
            if !filter.matches(&event_type) {
                return false;
            }
        }
        self.published.lock().push(PublishedEvent {
            channel: channel.to_string(),
            event_type,
            payload,
        });
        true
    }

    /// Everything captured since the last reset, in publish order.
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.published.lock().clone()
    }

    pub fn reset(&self) {
        self.published.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Publisher for Recorder {
    fn publish(&self, channel: &str, message: Message) -> Result<()> {
        self.record(channel, message);
        Ok(())
    }
}
