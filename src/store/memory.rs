//! Process-local store with Redis-like semantics.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DistributedStore, StoreResult};
use crate::clock::Clock;

enum Value {
    Window(BTreeSet<(i64, String)>),
    Hash(HashMap<String, i64>),
}

struct Entry {
    value: Value,
    expires_at: i64,
}

/// A [`DistributedStore`] living in this process.
///
/// Useful for single-instance deployments and for exercising the distributed
/// code path without a server. Keys expire lazily against the injected clock.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_micros();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ttl_deadline(now: i64, ttl_secs: u64) -> i64 {
    let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
    now.saturating_add(ttl.saturating_mul(1_000_000))
}

/// Drop `key` if it has expired.
fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: i64) {
    if entries.get(key).is_some_and(|e| e.expires_at <= now) {
        entries.remove(key);
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn window_hit(
        &self,
        key: &str,
        window_start: i64,
        member: &str,
        now: i64,
        ttl_secs: u64,
    ) -> StoreResult<u64> {
        let clock_now = self.clock.now_micros();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, clock_now);

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Window(BTreeSet::new()),
            expires_at: 0,
        });
        if !matches!(entry.value, Value::Window(_)) {
            entry.value = Value::Window(BTreeSet::new());
        }

        let count = match &mut entry.value {
            Value::Window(members) => {
                // Keep only scores strictly after window_start.
                *members = members.split_off(&(window_start.saturating_add(1), String::new()));
                let count = members.len() as u64;
                members.insert((now, member.to_string()));
                count
            }
            Value::Hash(_) => 0,
        };
        entry.expires_at = ttl_deadline(clock_now, ttl_secs);

        Ok(count)
    }

    async fn window_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock();
        if let Some(Entry {
            value: Value::Window(members),
            ..
        }) = entries.get_mut(key)
        {
            members.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn window_oldest(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = self.clock.now_micros();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, now);

        Ok(match entries.get(key) {
            Some(Entry {
                value: Value::Window(members),
                ..
            }) => members.first().map(|(score, _)| *score),
            _ => None,
        })
    }

    async fn hash_incr(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl_secs: u64,
    ) -> StoreResult<()> {
        let now = self.clock.now_micros();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: 0,
        });
        if !matches!(entry.value, Value::Hash(_)) {
            entry.value = Value::Hash(HashMap::new());
        }
        if let Value::Hash(hash) = &mut entry.value {
            for (field, delta) in fields {
                *hash.entry((*field).to_string()).or_insert(0) += delta;
            }
        }
        entry.expires_at = ttl_deadline(now, ttl_secs);

        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        let now = self.clock.now_micros();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, now);

        Ok(match entries.get(key) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => hash.clone(),
            _ => HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    const SEC: i64 = 1_000_000;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_window_hit_counts_before_adding() {
        let (store, _clock) = store();

        assert_eq!(store.window_hit("w", 0, "a", 10 * SEC, 60).await.unwrap(), 0);
        assert_eq!(store.window_hit("w", 0, "b", 11 * SEC, 60).await.unwrap(), 1);
        assert_eq!(store.window_hit("w", 0, "c", 12 * SEC, 60).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_window_hit_evicts_at_or_before_start() {
        let (store, _clock) = store();

        store.window_hit("w", 0, "a", 10 * SEC, 60).await.unwrap();
        store.window_hit("w", 0, "b", 20 * SEC, 60).await.unwrap();

        // "a" sits exactly on the boundary and is evicted.
        let count = store.window_hit("w", 10 * SEC, "c", 70 * SEC, 60).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.window_oldest("w").await.unwrap(), Some(20 * SEC));
    }

    #[tokio::test]
    async fn test_window_remove_and_oldest() {
        let (store, _clock) = store();

        store.window_hit("w", 0, "a", 5 * SEC, 60).await.unwrap();
        store.window_hit("w", 0, "b", 6 * SEC, 60).await.unwrap();
        store.window_remove("w", "a").await.unwrap();

        assert_eq!(store.window_oldest("w").await.unwrap(), Some(6 * SEC));
        assert_eq!(store.window_oldest("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_incr_accumulates() {
        let (store, _clock) = store();

        store.hash_incr("h", &[("in", 5), ("out", 7)], 60).await.unwrap();
        store.hash_incr("h", &[("in", 1)], 60).await.unwrap();

        let hash = store.hash_get_all("h").await.unwrap();
        assert_eq!(hash.get("in"), Some(&6));
        assert_eq!(hash.get("out"), Some(&7));
        assert!(store.hash_get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_expire_after_ttl() {
        let (store, clock) = store();

        store.hash_incr("h", &[("in", 1)], 10).await.unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::seconds(10));

        assert!(store.is_empty());
        assert!(store.hash_get_all("h").await.unwrap().is_empty());
    }
}
