//! Per-channel state table.
//!
//! The table lock is only held long enough to find or insert a channel's
//! entry; all real work happens on the entry's own lock, so a busy channel
//! never stalls another.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct ChannelMap<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> ChannelMap<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, channel: &str) -> Option<Arc<T>> {
        self.entries.read().get(channel).cloned()
    }

    pub fn get_or_insert_with<F>(&self, channel: &str, init: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(entry) = self.get(channel) {
            return entry;
        }
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(init())),
        )
    }

    pub fn insert(&self, channel: String, value: T) {
        self.entries.write().insert(channel, Arc::new(value));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn values(&self) -> Vec<Arc<T>> {
        self.entries.read().values().cloned().collect()
    }
}

impl<T> Default for ChannelMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_get_or_insert_is_shared() {
        let map: ChannelMap<Mutex<u32>> = ChannelMap::new();
        *map.get_or_insert_with("a", || Mutex::new(0)).lock() += 1;
        *map.get_or_insert_with("a", || Mutex::new(100)).lock() += 1;

        assert_eq!(*map.get("a").unwrap().lock(), 2);
        assert!(map.get("b").is_none());
        assert_eq!(map.names(), vec!["a".to_string()]);
    }
}
