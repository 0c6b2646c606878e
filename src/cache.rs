//! # Entity Cache
//!
//! Read-through cache of container and resource rows keyed by internal id. Entries are
//! never re-validated: every mutation invalidates the entry before it reaches the
//! gateway, and readers that must not see stale data pass `use_cache = false`.

use crate::config::CacheConfig;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

/// TTL-bounded entity cache
#[derive(Debug)]
pub struct EntityCache<T> {
    entries: DashMap<i64, CacheEntry<T>>,
    ttl: Duration,
    enabled: bool,
}

impl<T: Clone> EntityCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            enabled: true,
        }
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::ZERO,
            enabled: false,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(Duration::from_secs(config.ttl_seconds))
        } else {
            Self::disabled()
        }
    }

    pub fn get(&self, id: i64) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let expired = {
            let entry = self.entries.get(&id)?;
            if entry.inserted_at.elapsed() <= self.ttl {
                return Some(entry.value.clone());
            }
            true
        };
        if expired {
            self.entries.remove(&id);
        }
        None
    }

    pub fn insert(&self, id: i64, value: T) {
        if self.enabled {
            self.entries.insert(
                id,
                CacheEntry {
                    value,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub fn invalidate(&self, id: i64) {
        self.entries.remove(&id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_invalidate() {
        let cache = EntityCache::new(Duration::from_secs(60));
        cache.insert(1, "row".to_string());
        assert_eq!(cache.get(1).as_deref(), Some("row"));

        cache.invalidate(1);
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = EntityCache::new(Duration::ZERO);
        cache.insert(1, 42u32);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = EntityCache::disabled();
        cache.insert(1, 42u32);
        assert!(cache.get(1).is_none());
    }
}
