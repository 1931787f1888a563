use std::time::{Duration, Instant};

use dashmap::DashMap;

use traceline_common::EntityKind;

/// Default entry lifetime: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Expiring in-process cache for hot entity and state lookups.
///
/// Keys follow the `{type}:{id}` convention. Entries are evicted lazily on
/// read. The cache is advisory: callers must treat a miss as "ask the
/// durable store", never as "does not exist".
pub struct HotCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl HotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cache key for an entity record.
    pub fn entity_key(kind: EntityKind, id: &str) -> String {
        format!("{}:{}", kind.as_str(), id)
    }

    /// Cache key for an entity's current lifecycle state.
    pub fn state_key(kind: EntityKind, id: &str) -> String {
        format!("state:{}:{}", kind.as_str(), id)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value: value.into(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of entries currently held, including not-yet-evicted expired
    /// ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_value() {
        let cache = HotCache::default();
        cache.put("mission:m_1", "{\"id\":\"m_1\"}");
        assert_eq!(cache.get("mission:m_1").as_deref(), Some("{\"id\":\"m_1\"}"));
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = HotCache::new(Duration::from_millis(10));
        cache.put("job:j_1", "x");
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("job:j_1"), None);
        assert!(cache.is_empty(), "expired entry must be removed on read");
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = HotCache::default();
        cache.put("attempt:a_1", "x");
        cache.invalidate("attempt:a_1");
        assert_eq!(cache.get("attempt:a_1"), None);
    }

    #[test]
    fn keys_follow_type_id_convention() {
        assert_eq!(HotCache::entity_key(EntityKind::Mission, "m_9"), "mission:m_9");
        assert_eq!(
            HotCache::state_key(EntityKind::Attempt, "a_9"),
            "state:attempt:a_9"
        );
    }
}
