//! Retained history for one channel.

use crate::config::RetentionPolicy;
use crate::types::{Event, EventId, Timestamp};
use std::collections::VecDeque;

/// The retained tail of a channel's history plus its id counter.
#[derive(Debug)]
pub(crate) struct ChannelWindow {
    /// Id the next append receives.
    next_id: EventId,
    /// Retained events, oldest first, ids strictly increasing.
    entries: VecDeque<Event>,
}

impl ChannelWindow {
    pub fn new() -> Self {
        Self {
            next_id: EventId(1),
            entries: VecDeque::new(),
        }
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Never hand out ids below `floor`, e.g. after everything on disk was
    /// compacted away.
    pub fn raise_next_id(&mut self, floor: EventId) {
        self.next_id = self.next_id.max(floor);
    }

    /// Build the event the next append would store, without committing it.
    pub fn prepare(&self, event_type: &str, payload: Vec<u8>) -> Event {
        Event {
            id: self.next_id,
            event_type: event_type.to_string(),
            payload,
            timestamp: Timestamp::now(),
        }
    }

    /// Commit an event and apply retention. Returns how many entries were
    /// evicted.
    ///
    /// Callers guarantee `event.id >= next_id`; recovery may skip ids.
    pub fn push(&mut self, event: Event, policy: &RetentionPolicy) -> usize {
        self.next_id = event.id.next();
        let now = event.timestamp;
        self.entries.push_back(event);
        self.evict(policy, now)
    }

    /// Drop entries beyond the retention bounds.
    pub fn evict(&mut self, policy: &RetentionPolicy, now: Timestamp) -> usize {
        let mut evicted = 0;
        if let Some(max) = policy.max_entries {
            while self.entries.len() > max {
                self.entries.pop_front();
                evicted += 1;
            }
        }
        if let Some(max_age) = policy.max_age {
            while self
                .entries
                .front()
                .map_or(false, |e| e.timestamp.expired(now, max_age))
            {
                self.entries.pop_front();
                evicted += 1;
            }
        }
        evicted
    }

    /// Retained, unexpired events with id strictly greater than `last_id`.
    pub fn since(&self, last_id: EventId, policy: &RetentionPolicy) -> Vec<Event> {
        let start = self.entries.partition_point(|e| e.id <= last_id);
        let now = Timestamp::now();
        self.entries
            .range(start..)
            .filter(|e| match policy.max_age {
                Some(max_age) => !e.timestamp.expired(now, max_age),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Last id ever assigned, even if that event has been evicted.
    pub fn latest(&self) -> Option<EventId> {
        if self.next_id.0 > 1 {
            Some(EventId(self.next_id.0 - 1))
        } else {
            None
        }
    }

    /// Oldest id a read would still return.
    pub fn oldest(&self, policy: &RetentionPolicy) -> Option<EventId> {
        let now = Timestamp::now();
        self.entries
            .iter()
            .find(|e| match policy.max_age {
                Some(max_age) => !e.timestamp.expired(now, max_age),
                None => true,
            })
            .map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn push(window: &mut ChannelWindow, payload: &str, policy: &RetentionPolicy) -> EventId {
        let event = window.prepare("message", payload.as_bytes().to_vec());
        let id = event.id;
        window.push(event, policy);
        id
    }

    #[test]
    fn test_ids_start_at_one() {
        let mut window = ChannelWindow::new();
        let policy = RetentionPolicy::default();
        assert_eq!(window.latest(), None);
        assert_eq!(push(&mut window, "a", &policy), EventId(1));
        assert_eq!(push(&mut window, "b", &policy), EventId(2));
        assert_eq!(window.latest(), Some(EventId(2)));
    }

    #[test]
    fn test_count_eviction_keeps_latest_id() {
        let mut window = ChannelWindow::new();
        let policy = RetentionPolicy::entries(2);
        for p in ["a", "b", "c", "d"] {
            push(&mut window, p, &policy);
        }
        assert_eq!(window.len(), 2);
        assert_eq!(window.oldest(&policy), Some(EventId(3)));
        assert_eq!(window.latest(), Some(EventId(4)));
    }

    #[test]
    fn test_floor_survives_empty_window() {
        let mut window = ChannelWindow::new();
        window.raise_next_id(EventId(41));
        assert_eq!(window.latest(), Some(EventId(40)));
        assert_eq!(push(&mut window, "a", &RetentionPolicy::default()), EventId(41));

        // A lower floor never moves the counter back
        window.raise_next_id(EventId(5));
        assert_eq!(window.next_id(), EventId(42));
    }

    #[test]
    fn test_since_is_exclusive() {
        let mut window = ChannelWindow::new();
        let policy = RetentionPolicy::default();
        for p in ["a", "b", "c"] {
            push(&mut window, p, &policy);
        }
        let ids: Vec<_> = window
            .since(EventId(1), &policy)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![EventId(2), EventId(3)]);
        assert!(window.since(EventId(3), &policy).is_empty());
    }

    #[test]
    fn test_age_eviction() {
        let policy = RetentionPolicy::max_age(Duration::from_secs(1));
        let mut window = ChannelWindow::new();

        let mut old = window.prepare("message", b"old".to_vec());
        old.timestamp = Timestamp(Timestamp::now().0 - 5_000_000);
        window.push(old, &RetentionPolicy::default());

        // Expired entries are hidden from reads before they are evicted.
        assert!(window.since(EventId::ZERO, &policy).is_empty());
        assert_eq!(window.oldest(&policy), None);
        assert_eq!(window.oldest(&RetentionPolicy::default()), Some(EventId(1)));

        let evicted = window.push(window.prepare("message", b"new".to_vec()), &policy);
        assert_eq!(evicted, 1);
        assert_eq!(window.oldest(&policy), Some(EventId(2)));
    }
}
