//! Eviction subsystem (C6): TTL single-shot timers plus size-bounded
//! LRU-by-bytes over file content.
//!
//! Grounded on `cachelito-core/src/global_cache.rs`'s
//! `handle_entry_limit_eviction` (LRU-by-count eviction loop) and
//! `utils.rs`'s `move_key_to_end`/`remove_key_from_global_cache`
//! helpers, generalized from entry-count to byte-size accounting.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::record::ContentRef;

/// Per-record TTL timer bookkeeping. One timer per `(scope, key)`;
/// re-arming (on `set`/`update`) cancels any prior timer first.
#[derive(Default)]
pub struct TtlScheduler {
    timers: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

impl TtlScheduler {
    /// Arms a timer that calls `on_fire` after `delay`. Any existing
    /// timer for the same record is cancelled first.
    pub fn arm<F>(&self, scope: &str, key: &str, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel(scope, key);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire.await;
        });
        self.timers.lock().insert((scope.to_string(), key.to_string()), handle);
    }

    /// Cancels a record's timer, if any (on explicit `remove`/`clear`/`update`).
    pub fn cancel(&self, scope: &str, key: &str) {
        if let Some(handle) = self.timers.lock().remove(&(scope.to_string(), key.to_string())) {
            handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

/// File-content byte cache with size-bounded LRU eviction (I4).
///
/// Recency is tracked with a plain `VecDeque`; the back is most
/// recently used. Ties break by insertion order, matching the front
/// of the queue being both oldest-inserted and least-recently-used
/// for never-touched entries.
pub struct ContentStore {
    bytes: DashMap<ContentRef, Bytes>,
    recency: Mutex<VecDeque<ContentRef>>,
    total_size: AtomicU64,
    next_ref: AtomicU64,
}

impl Default for ContentStore {
    fn default() -> Self {
        Self {
            bytes: DashMap::new(),
            recency: Mutex::new(VecDeque::new()),
            total_size: AtomicU64::new(0),
            next_ref: AtomicU64::new(1),
        }
    }
}

impl ContentStore {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    pub fn get(&self, content_ref: ContentRef) -> Option<Bytes> {
        self.bytes.get(&content_ref).map(|b| b.clone())
    }

    pub fn touch(&self, content_ref: ContentRef) {
        let mut recency = self.recency.lock();
        if let Some(pos) = recency.iter().position(|r| *r == content_ref) {
            recency.remove(pos);
        }
        recency.push_back(content_ref);
    }

    /// Admits `data`, evicting least-recently-used entries (oldest
    /// `lastAccessedAt`, ties by insertion order — i.e. front of the
    /// recency queue) until `max_total_size` is respected. Returns
    /// `None` (admission refused, caller streams from disk instead)
    /// if `data` alone exceeds `max_total_size`, or the evicted
    /// `ContentRef`s otherwise.
    pub fn admit(&self, data: Bytes, max_total_size: Option<u64>) -> Option<(ContentRef, Vec<ContentRef>)> {
        let size = data.len() as u64;
        if let Some(max) = max_total_size {
            if size > max {
                return None;
            }
        }
        let content_ref = ContentRef(self.next_ref.fetch_add(1, Ordering::SeqCst));
        let mut evicted = Vec::new();
        self.bytes.insert(content_ref, data);
        self.total_size.fetch_add(size, Ordering::SeqCst);
        {
            let mut recency = self.recency.lock();
            recency.push_back(content_ref);
            if let Some(max) = max_total_size {
                while self.total_size.load(Ordering::SeqCst) > max {
                    let Some(victim) = recency.pop_front() else { break };
                    if victim == content_ref {
                        // Shouldn't happen (we just checked size <= max
                        // above), but never evict what we just admitted.
                        recency.push_back(victim);
                        break;
                    }
                    if let Some((_, bytes)) = self.bytes.remove(&victim) {
                        self.total_size.fetch_sub(bytes.len() as u64, Ordering::SeqCst);
                        evicted.push(victim);
                    }
                }
            }
        }
        Some((content_ref, evicted))
    }

    pub fn remove(&self, content_ref: ContentRef) {
        if let Some((_, bytes)) = self.bytes.remove(&content_ref) {
            self.total_size.fetch_sub(bytes.len() as u64, Ordering::SeqCst);
        }
        self.recency.lock().retain(|r| *r != content_ref);
    }

    pub fn clear(&self) {
        self.bytes.clear();
        self.recency.lock().clear();
        self.total_size.store(0, Ordering::SeqCst);
    }
}

pub type SharedContentStore = Arc<ContentStore>;
