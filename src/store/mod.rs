//! Event history per channel.
//!
//! Two backends share the same retained-window logic:
//! - [`MemoryStore`]: process-local, lost on restart
//! - [`LogStore`]: one append-only log file per channel, rebuilt on open

mod log;
mod memory;
mod window;

pub use log::LogStore;
pub use memory::MemoryStore;

use crate::config::{RelayConfig, RetentionPolicy, StoreBackend};
use crate::error::Result;
use crate::types::{Event, EventId};
use std::sync::Arc;

/// Ordered, bounded, per-channel event history.
///
/// Implementations must serialize appends per channel and must never expose a
/// partially written entry to readers.
pub trait EventStore: Send + Sync {
    /// Assign the next id on `channel`, store the event and apply retention.
    fn append(&self, channel: &str, event_type: &str, payload: Vec<u8>) -> Result<Event>;

    /// Retained events with id strictly greater than `last_id`, oldest first.
    ///
    /// If `last_id` predates the retained window this returns everything
    /// retained; compare against [`EventStore::oldest_id`] to detect the gap.
    fn read_since(&self, channel: &str, last_id: EventId) -> Result<Vec<Event>>;

    /// Last id assigned on `channel`, if any.
    fn latest_id(&self, channel: &str) -> Result<Option<EventId>>;

    /// Oldest retained id on `channel`, if any.
    fn oldest_id(&self, channel: &str) -> Result<Option<EventId>>;

    /// Channels with history.
    fn channels(&self) -> Vec<String>;

    /// Flush pending writes.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the store a config asks for.
pub fn open_store(config: &RelayConfig) -> Result<Arc<dyn EventStore>> {
    let store: Arc<dyn EventStore> = match &config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.retention.clone())),
        StoreBackend::Log { path, sync_every } => Arc::new(LogStore::open_with_sync_interval(
            path,
            config.retention.clone(),
            *sync_every,
        )?),
    };
    Ok(store)
}

/// Whether a replay from `last_id` may have missed events that were evicted.
pub fn replay_gap(store: &dyn EventStore, channel: &str, last_id: EventId) -> Result<bool> {
    Ok(match store.oldest_id(channel)? {
        // oldest >= 1, so this cannot overflow for any client-supplied id
        Some(oldest) => oldest.0 - 1 > last_id.0,
        None => store.latest_id(channel)?.map_or(false, |latest| latest > last_id),
    })
}

pub(crate) fn retention_summary(policy: &RetentionPolicy) -> String {
    match (policy.max_entries, policy.max_age) {
        (Some(n), Some(age)) => format!("{} entries / {:?}", n, age),
        (Some(n), None) => format!("{} entries", n),
        (None, Some(age)) => format!("{:?}", age),
        (None, None) => "unbounded".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_gap() {
        let store = MemoryStore::new(RetentionPolicy::entries(2));
        assert!(!replay_gap(&store, "c", EventId::ZERO).unwrap());

        for p in ["a", "b", "c", "d"] {
            store.append("c", "message", p.as_bytes().to_vec()).unwrap();
        }
        // Retained: 3, 4
        assert!(replay_gap(&store, "c", EventId(1)).unwrap());
        assert!(!replay_gap(&store, "c", EventId(2)).unwrap());
        assert!(!replay_gap(&store, "c", EventId(4)).unwrap());
    }

    #[test]
    fn test_replay_gap_with_huge_last_id() {
        let store = MemoryStore::new(RetentionPolicy::entries(2));
        assert!(!replay_gap(&store, "c", EventId(u64::MAX)).unwrap());

        store.append("c", "message", b"a".to_vec()).unwrap();
        assert!(!replay_gap(&store, "c", EventId(u64::MAX)).unwrap());
    }

    #[test]
    fn test_replay_gap_sees_expired_events() {
        use std::time::Duration;

        let store = MemoryStore::new(RetentionPolicy::max_age(Duration::from_millis(30)));
        store.append("c", "message", b"old".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        // Event 1 expired without a later append evicting it
        assert_eq!(store.oldest_id("c").unwrap(), None);
        assert!(store.read_since("c", EventId::ZERO).unwrap().is_empty());
        assert!(replay_gap(&store, "c", EventId::ZERO).unwrap());
        assert!(!replay_gap(&store, "c", EventId(1)).unwrap());
    }
}
