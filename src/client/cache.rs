use parking_lot::Mutex;
use std::{borrow::Borrow, collections::HashMap, hash::Hash, time::Duration, time::Instant};

/// Thread-safe map whose entries expire a fixed time after insertion.
///
/// An entry is valid while `now - inserted_at <= ttl`. Expired entries are evicted when read, or
/// all at once by [`TtlCache::purge_expired`].
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.get_at(key, Instant::now())
    }

    /// Insert a value, returning the previous one if it had not expired.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.insert_at(key, value, Instant::now())
    }

    /// Evict every expired entry. Returns the number evicted.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (inserted, _)| self.is_fresh(*inserted, now));

        before - entries.len()
    }

    /// Number of entries, including expired entries not evicted yet.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn get_at<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut entries = self.entries.lock();
        let (inserted, value) = entries.get(key)?;
        if self.is_fresh(*inserted, now) {
            return Some(value.clone());
        }

        entries.remove(key);

        None
    }

    fn insert_at(&self, key: K, value: V, now: Instant) -> Option<V> {
        self.entries
            .lock()
            .insert(key, (now, value))
            .and_then(|(inserted, value)| self.is_fresh(inserted, now).then_some(value))
    }

    fn is_fresh(&self, inserted: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted) <= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_ttl_expiry() {
        let _ = tracing_log::LogTracer::init();

        let cache = TtlCache::new(Duration::from_secs(60));
        let start = Instant::now();

        cache.insert_at("a".to_string(), 1, start);
        assert_eq!(cache.get_at("a", start + Duration::from_secs(60)), Some(1));
        assert_eq!(cache.len(), 1);

        // Read after expiry evicts.
        assert_eq!(cache.get_at("a", start + Duration::from_secs(61)), None);
        assert!(cache.is_empty());
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    #[traced_test]
    fn test_ttl_insert_and_purge() {
        let _ = tracing_log::LogTracer::init();

        let cache = TtlCache::new(Duration::ZERO);
        let long_ago = Instant::now() - Duration::from_secs(1);

        cache.insert_at("stale", 1, long_ago);
        assert_eq!(cache.insert("fresh", 2), None);
        assert_eq!(cache.len(), 2);

        // Only the entry inserted in the past is certain to have expired.
        assert!(cache.purge_expired() >= 1);
        assert_eq!(cache.get_at("stale", Instant::now()), None);

        let cache = TtlCache::new(Duration::from_secs(3600));
        cache.insert("a", 1);
        assert_eq!(cache.insert("a", 2), Some(1));
        assert_eq!(cache.get("a"), Some(2));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.ttl(), Duration::from_secs(3600));
    }
}
