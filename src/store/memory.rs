//! In-process event history.

use super::window::ChannelWindow;
use super::EventStore;
use crate::channels::ChannelMap;
use crate::config::RetentionPolicy;
use crate::error::Result;
use crate::types::{Event, EventId};
use parking_lot::RwLock;
use tracing::trace;

/// Event history held in memory, one locked window per channel.
pub struct MemoryStore {
    channels: ChannelMap<RwLock<ChannelWindow>>,
    policy: RetentionPolicy,
}

impl MemoryStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            channels: ChannelMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl EventStore for MemoryStore {
    fn append(&self, channel: &str, event_type: &str, payload: Vec<u8>) -> Result<Event> {
        let window = self
            .channels
            .get_or_insert_with(channel, || RwLock::new(ChannelWindow::new()));
        let mut window = window.write();

        let event = window.prepare(event_type, payload);
        let evicted = window.push(event.clone(), &self.policy);
        if evicted > 0 {
            trace!(channel, evicted, "MemoryStore::append: evicted old events");
        }
        Ok(event)
    }

    fn read_since(&self, channel: &str, last_id: EventId) -> Result<Vec<Event>> {
        Ok(match self.channels.get(channel) {
            Some(window) => window.read().since(last_id, &self.policy),
            None => Vec::new(),
        })
    }

    fn latest_id(&self, channel: &str) -> Result<Option<EventId>> {
        Ok(self
            .channels
            .get(channel)
            .and_then(|window| window.read().latest()))
    }

    fn oldest_id(&self, channel: &str) -> Result<Option<EventId>> {
        Ok(self
            .channels
            .get(channel)
            .and_then(|window| window.read().oldest(&self.policy)))
    }

    fn channels(&self) -> Vec<String> {
        self.channels.names()
    }
}
