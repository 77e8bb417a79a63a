//! Bounded cookie -> identity cache
//!
//! Verifying a cookie costs a signature check plus a database lookup (or, for
//! the single-user server, an HTTP round trip to the hub). Results are cached
//! here with both a size bound and a TTL, and every entry records which user
//! it belongs to so logout and user deletion can drop it explicitly. An entry
//! may also carry its own deadline so it never outlives the cookie it caches.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    owner: String,
    value: V,
    expires_at: Instant,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

pub struct CookieCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_entries: usize,
    ttl: Duration,
}

impl<V: Clone> CookieCache<V> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Look up a cookie value, dropping the entry if it has expired
    pub fn get(&self, cookie: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(cookie) {
            Some(entry) if Instant::now() < entry.expires_at => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(cookie);
            inner.order.retain(|k| k != cookie);
        }
        None
    }

    pub fn insert(&self, cookie: impl Into<String>, owner: impl Into<String>, value: V) {
        self.insert_entry(cookie.into(), owner.into(), value, Instant::now() + self.ttl);
    }

    /// Insert an entry that expires at `deadline` or after the TTL, whichever
    /// comes first
    pub fn insert_until(
        &self,
        cookie: impl Into<String>,
        owner: impl Into<String>,
        value: V,
        deadline: Instant,
    ) {
        let expires_at = deadline.min(Instant::now() + self.ttl);
        self.insert_entry(cookie.into(), owner.into(), value, expires_at);
    }

    fn insert_entry(&self, cookie: String, owner: String, value: V, expires_at: Instant) {
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(&cookie) {
            inner.order.retain(|k| k != &cookie);
        }

        while inner.entries.len() >= self.max_entries {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.entries.insert(
            cookie.clone(),
            CacheEntry {
                owner,
                value,
                expires_at,
            },
        );
        inner.order.push_back(cookie);
    }

    pub fn invalidate(&self, cookie: &str) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(cookie).is_some() {
            inner.order.retain(|k| k != cookie);
        }
    }

    /// Drop every cached cookie that resolved to `owner`
    pub fn invalidate_user(&self, owner: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.owner != owner);
        let CacheInner { entries, order } = &mut *inner;
        order.retain(|k| entries.contains_key(k));
        before - entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = CookieCache::new(10, Duration::from_secs(60));
        cache.insert("cookie-a", "alice", "alice".to_string());

        assert_eq!(cache.get("cookie-a").as_deref(), Some("alice"));
        assert!(cache.get("cookie-b").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bounded_evicts_oldest() {
        let cache = CookieCache::new(2, Duration::from_secs(60));
        cache.insert("c1", "u1", 1);
        cache.insert("c2", "u2", 2);
        cache.insert("c3", "u3", 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("c1").is_none());
        assert_eq!(cache.get("c2"), Some(2));
        assert_eq!(cache.get("c3"), Some(3));
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let cache = CookieCache::new(2, Duration::from_secs(60));
        cache.insert("c1", "u1", 1);
        cache.insert("c2", "u2", 2);
        cache.insert("c1", "u1", 10);
        cache.insert("c3", "u3", 3);

        assert_eq!(cache.get("c1"), Some(10));
        assert!(cache.get("c2").is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = CookieCache::new(10, Duration::from_millis(20));
        cache.insert("c1", "u1", 1);
        assert_eq!(cache.get("c1"), Some(1));

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("c1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_deadline_caps_ttl() {
        let cache = CookieCache::new(10, Duration::from_secs(60));
        cache.insert_until("c1", "u1", 1, Instant::now() + Duration::from_millis(20));
        cache.insert_until("c2", "u2", 2, Instant::now() + Duration::from_secs(3600));
        assert_eq!(cache.get("c1"), Some(1));

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("c1").is_none());
        assert_eq!(cache.get("c2"), Some(2));
    }

    #[test]
    fn test_invalidate() {
        let cache = CookieCache::new(10, Duration::from_secs(60));
        cache.insert("c1", "u1", 1);
        cache.invalidate("c1");
        cache.invalidate("missing");
        assert!(cache.get("c1").is_none());
    }

    #[test]
    fn test_invalidate_user() {
        let cache = CookieCache::new(10, Duration::from_secs(60));
        cache.insert("c1", "river", 1);
        cache.insert("c2", "river", 2);
        cache.insert("c3", "lake", 3);

        assert_eq!(cache.invalidate_user("river"), 2);
        assert!(cache.get("c1").is_none());
        assert!(cache.get("c2").is_none());
        assert_eq!(cache.get("c3"), Some(3));

        cache.clear();
        assert!(cache.is_empty());
    }
}
