//! Parsed-Instance LRU Cache (PC): bounded cache mapping a resource public
//! id to an exclusively-held parsed value, with at-most-one-builder-per-key
//! semantics and recency-based eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

struct Inner<V> {
    entries: HashMap<String, Arc<AsyncMutex<V>>>,
    /// Front = least recently used, back = most recently used.
    order: VecDeque<String>,
    building: HashMap<String, Arc<Notify>>,
}

/// A bounded cache of parsed instances. `V` is typically a parsed DICOM
/// object; the cache itself is agnostic to what it holds.
pub struct ParsedCache<V> {
    capacity: usize,
    inner: StdMutex<Inner<V>>,
}

impl<V> ParsedCache<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            inner: StdMutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                building: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(inner: &mut Inner<V>, key: &str) {
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        }
        inner.order.push_back(key.to_string());
    }

    /// Return the entry for `key`, moving it to the most-recent end. If
    /// absent, `provider` is invoked to build it; if another caller is
    /// already building the same key, this call waits for that build to
    /// finish and reuses its result rather than building twice. If the
    /// cache is full, the least-recently-used entry is evicted before the
    /// new one is inserted.
    ///
    /// The returned guard holds the entry's own lock for its scope,
    /// granting exclusive use; dropping it returns the entry to the cache
    /// without destroying it.
    pub async fn access<F, Fut>(&self, key: &str, provider: F) -> OwnedMutexGuard<V>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = V>,
    {
        loop {
            enum Step<V> {
                Hit(Arc<AsyncMutex<V>>),
                Wait(Arc<Notify>),
                Build,
            }

            let step = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.entries.get(key) {
                    let entry = entry.clone();
                    Self::touch(&mut inner, key);
                    Step::Hit(entry)
                } else if let Some(notify) = inner.building.get(key) {
                    Step::Wait(notify.clone())
                } else {
                    inner
                        .building
                        .insert(key.to_string(), Arc::new(Notify::new()));
                    Step::Build
                }
            };

            match step {
                Step::Hit(entry) => return entry.lock_owned().await,
                Step::Wait(notify) => {
                    notify.notified().await;
                    continue;
                }
                Step::Build => {
                    let value = provider().await;
                    let entry = Arc::new(AsyncMutex::new(value));
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if inner.entries.len() >= self.capacity {
                            if let Some(oldest) = inner.order.pop_front() {
                                inner.entries.remove(&oldest);
                            }
                        }
                        inner.entries.insert(key.to_string(), entry.clone());
                        inner.order.push_back(key.to_string());
                        if let Some(notify) = inner.building.remove(key) {
                            notify.notify_waiters();
                        }
                    }
                    return entry.lock_owned().await;
                }
            }
        }
    }

    /// Drop every entry, oldest first. Used at shutdown; not part of the
    /// normal eviction path.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(key) = inner.order.pop_front() {
            inner.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Tracked {
        id: u32,
        log: Arc<StdMutex<Vec<u32>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.lock().unwrap().push(self.id);
        }
    }

    #[tokio::test]
    async fn lru_eviction_matches_reference_sequence() {
        let cache: ParsedCache<Tracked> = ParsedCache::new(3);
        let log = Arc::new(StdMutex::new(Vec::new()));

        for id in [42u32, 43, 45, 42, 43, 47, 44, 42] {
            let log = log.clone();
            let guard = cache
                .access(&id.to_string(), || async move { Tracked { id, log } })
                .await;
            drop(guard);
        }
        cache.clear();

        assert_eq!(
            *log.lock().unwrap(),
            vec![45, 42, 43, 47, 44, 42]
        );
    }

    #[tokio::test]
    async fn concurrent_access_to_same_key_builds_once() {
        let cache: Arc<ParsedCache<u32>> = Arc::new(ParsedCache::new(4));
        let build_count = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let build_count = build_count.clone();
            handles.push(tokio::spawn(async move {
                let guard = cache
                    .access("shared", || {
                        let build_count = build_count.clone();
                        async move {
                            build_count.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            7u32
                        }
                    })
                    .await;
                assert_eq!(*guard, 7);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hit_promotes_key_to_most_recent() {
        let cache: ParsedCache<u32> = ParsedCache::new(2);
        cache.access("a", || async { 1 }).await;
        cache.access("b", || async { 2 }).await;
        cache.access("a", || async { 1 }).await; // promote a
        cache.access("c", || async { 3 }).await; // should evict b, not a
        assert_eq!(cache.len(), 2);
        let guard = cache.access("a", || async { unreachable!() }).await;
        assert_eq!(*guard, 1);
    }
}
