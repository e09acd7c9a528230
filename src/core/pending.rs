//! Tracked in-flight work.
//!
//! A `PendingSet` records keyed units of work from start to settle. The
//! returned guard removes its key on drop, so an entry is released whether
//! the work succeeds, fails or is cancelled.

use std::hash::Hash;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;

pub struct PendingSet<K> {
    entries: Mutex<FxHashMap<K, String>>,
    /// Number of entries, published after every change
    count: watch::Sender<usize>,
}

impl<K: Eq + Hash + Clone> PendingSet<K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            count: watch::Sender::new(0),
        }
    }

    /// Track `key`. Returns `None` if the key is already in flight.
    pub fn try_insert(&self, key: K, label: impl Into<String>) -> Option<PendingGuard<'_, K>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return None;
        }
        entries.insert(key.clone(), label.into());
        self.count.send_replace(entries.len());
        Some(PendingGuard { set: self, key })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of everything currently in flight (unordered).
    pub fn labels(&self) -> Vec<String> {
        self.entries.lock().values().cloned().collect()
    }

    /// Resolve once every tracked entry has settled.
    pub async fn wait_empty(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn remove(&self, key: &K) {
        let mut entries = self.entries.lock();
        entries.remove(key);
        self.count.send_replace(entries.len());
    }
}

impl<K: Eq + Hash + Clone> Default for PendingSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its key when dropped.
pub struct PendingGuard<'a, K: Eq + Hash + Clone> {
    set: &'a PendingSet<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for PendingGuard<'_, K> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_duplicate_key_rejected() {
        let set = PendingSet::new();
        let guard = set.try_insert("a", "save");
        assert!(guard.is_some());
        assert!(set.try_insert("a", "save").is_none());
        assert_eq!(set.len(), 1);

        drop(guard);
        assert!(set.is_empty());
        assert!(set.try_insert("a", "save").is_some());
    }

    #[tokio::test]
    async fn test_wait_empty_returns_immediately_when_idle() {
        let set: PendingSet<u64> = PendingSet::new();
        set.wait_empty().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_empty_waits_for_settle() {
        let set: Arc<PendingSet<u64>> = Arc::new(PendingSet::new());

        let worker = {
            let set = Arc::clone(&set);
            tokio::spawn(async move {
                let _guard = set.try_insert(1, "work");
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(set.contains(&1));

        set.wait_empty().await;
        assert!(set.is_empty());
        worker.await.unwrap();
    }
}
