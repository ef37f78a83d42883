//! Lock Session Manager (C8): per-record FIFO mutual exclusion with a
//! configurable read-blocking policy and acquire timeout.
//!
//! No direct teacher analogue (cachelito has no lock sessions); the
//! waiter-queue-plus-`Notify` shape is the standard Rust pattern for
//! fair mutual exclusion over a resource set, and the "handle that
//! must still release when dropped" idiom follows `spec.md` §9.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant as TokioInstant;

use crate::error::SessionError;

pub type SessionId = u64;
pub type RecordId = (String, String); // (scope, key)

struct Gate {
    held_by: Option<SessionId>,
    block_read: bool,
    write_waiters: VecDeque<(SessionId, Arc<Notify>)>,
    read_waiters: VecDeque<Arc<Notify>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            held_by: None,
            block_read: true,
            write_waiters: VecDeque::new(),
            read_waiters: VecDeque::new(),
        }
    }
}

/// Default acquire timeout from `spec.md` §4.7.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LockManager {
    gates: Mutex<HashMap<RecordId, Gate>>,
    next_session: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self { gates: Mutex::new(HashMap::new()), next_session: AtomicU64::new(1) }
    }
}

impl LockManager {
    fn new_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns `Err(Locked)` immediately (non-owner write path), or
    /// `Ok(())` if free or owned by `session_id`.
    pub fn check_write(&self, session_id: Option<SessionId>, record: &RecordId) -> Result<(), SessionError> {
        let gates = self.gates.lock();
        match gates.get(record) {
            None => Ok(()),
            Some(gate) => match gate.held_by {
                None => Ok(()),
                Some(owner) if Some(owner) == session_id => Ok(()),
                Some(_) => Err(SessionError::Locked),
            },
        }
    }

    /// Blocks (if `blockRead` is set on the holder and the caller
    /// isn't the owner) until the record is free, then returns.
    pub async fn wait_for_read(&self, session_id: Option<SessionId>, record: &RecordId) {
        loop {
            let notify = {
                let mut gates = self.gates.lock();
                let Some(gate) = gates.get_mut(record) else { return };
                match gate.held_by {
                    None => return,
                    Some(owner) if Some(owner) == session_id => return,
                    Some(_) if !gate.block_read => return,
                    Some(_) => {
                        let notify = Arc::new(Notify::new());
                        gate.read_waiters.push_back(notify.clone());
                        notify
                    }
                }
            };
            notify.notified().await;
        }
    }

    /// Atomically acquires every record in `records` (all-or-nothing)
    /// within `timeout`, FIFO per record. On timeout, no records are
    /// held and the caller's queue position is released.
    pub async fn acquire(
        &self,
        records: &[RecordId],
        block_read: bool,
        timeout: Duration,
    ) -> Result<SessionId, SessionError> {
        let session_id = self.new_session_id();
        let deadline = TokioInstant::now() + timeout;

        loop {
            let wait_notify = {
                let mut gates = self.gates.lock();
                let all_free = records.iter().all(|r| {
                    gates.get(r).map(|g| g.held_by.is_none() || g.held_by == Some(session_id)).unwrap_or(true)
                });
                if all_free {
                    for r in records {
                        let gate = gates.entry(r.clone()).or_default();
                        gate.held_by = Some(session_id);
                        gate.block_read = block_read;
                        gate.write_waiters.retain(|(id, _)| *id != session_id);
                    }
                    return Ok(session_id);
                }
                // Register as a waiter on the first contended record
                // only — once it frees and we retry, we'll either
                // succeed outright or queue behind the next blocker.
                let mut notify = None;
                for r in records {
                    let gate = gates.entry(r.clone()).or_default();
                    let busy = gate.held_by.is_some() && gate.held_by != Some(session_id);
                    if busy && !gate.write_waiters.iter().any(|(id, _)| *id == session_id) {
                        let n = Arc::new(Notify::new());
                        gate.write_waiters.push_back((session_id, n.clone()));
                        notify = Some(n);
                        break;
                    }
                }
                notify
            };

            let Some(notify) = wait_notify else {
                // Nothing to wait on yet a record was busy (race);
                // yield briefly and retry.
                tokio::task::yield_now().await;
                continue;
            };

            tokio::select! {
                _ = notify.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    self.abandon(session_id, records);
                    return Err(SessionError::AcquireTimeout);
                }
            }
        }
    }

    fn abandon(&self, session_id: SessionId, records: &[RecordId]) {
        let mut gates = self.gates.lock();
        for r in records {
            if let Some(gate) = gates.get_mut(r) {
                gate.write_waiters.retain(|(id, _)| *id != session_id);
            }
        }
    }

    /// Releases every held record, waking the next writer (FIFO) or,
    /// if none, every blocked reader.
    pub fn release(&self, session_id: SessionId, records: &[RecordId]) {
        let mut gates = self.gates.lock();
        for r in records {
            let Some(gate) = gates.get_mut(r) else { continue };
            if gate.held_by != Some(session_id) {
                continue;
            }
            gate.held_by = None;
            if let Some((_, notify)) = gate.write_waiters.pop_front() {
                notify.notify_one();
            } else {
                while let Some(notify) = gate.read_waiters.pop_front() {
                    notify.notify_one();
                }
            }
        }
    }
}

/// RAII guard for a held lock session. Releases on drop if not
/// already released explicitly, logging a warning — the "handle that
/// must still release when dropped" pattern from `spec.md` §9.
pub struct LockSessionGuard {
    pub session_id: SessionId,
    pub records: Vec<RecordId>,
    manager: Arc<LockManager>,
    released: bool,
}

impl LockSessionGuard {
    pub fn new(session_id: SessionId, records: Vec<RecordId>, manager: Arc<LockManager>) -> Self {
        Self { session_id, records, manager, released: false }
    }

    pub fn owns(&self, record: &RecordId) -> bool {
        self.records.contains(record)
    }

    pub fn release(mut self) {
        self.manager.release(self.session_id, &self.records);
        self.released = true;
    }
}

impl Drop for LockSessionGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(session_id = self.session_id, "lock session dropped without explicit release");
            self.manager.release(self.session_id, &self.records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn rec(key: &str) -> RecordId {
        ("global".to_string(), key.to_string())
    }

    // (P5) while S1 holds R, no other session may write any r in R.
    #[tokio::test]
    async fn held_write_lock_excludes_other_sessions() {
        let locks = LockManager::default();
        let records = [rec("ahmad")];
        let s1 = locks.acquire(&records, false, Duration::from_secs(1)).await.unwrap();

        assert_eq!(locks.check_write(None, &rec("ahmad")), Err(SessionError::Locked));
        assert_eq!(locks.check_write(Some(s1), &rec("ahmad")), Ok(()));

        locks.release(s1, &records);
        assert_eq!(locks.check_write(None, &rec("ahmad")), Ok(()));
    }

    #[tokio::test]
    async fn acquire_times_out_when_contended() {
        let locks = LockManager::default();
        let records = [rec("suzy")];
        let _s1 = locks.acquire(&records, false, Duration::from_secs(5)).await.unwrap();

        let err = locks.acquire(&records, false, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, SessionError::AcquireTimeout);
    }

    // (P6) blockRead:true delays a concurrent external read until release.
    #[tokio::test]
    async fn block_read_delays_concurrent_reader_until_release() {
        let locks = Arc::new(LockManager::default());
        let records = [rec("suzy")];
        let s1 = locks.acquire(&records, true, Duration::from_secs(5)).await.unwrap();

        let reader_locks = locks.clone();
        let reached = Arc::new(AtomicBool::new(false));
        let reached_writer = reached.clone();
        let reader = tokio::spawn(async move {
            reader_locks.wait_for_read(None, &rec("suzy")).await;
            reached_writer.store(true, Ordering::SeqCst);
        });

        tokio::task::yield_now().await;
        assert!(!reached.load(Ordering::SeqCst));

        locks.release(s1, &records);
        reader.await.unwrap();
        assert!(reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let locks = Arc::new(LockManager::default());
        let records = vec![rec("temp")];
        let session = locks.acquire(&records, false, Duration::from_secs(1)).await.unwrap();
        {
            let _guard = LockSessionGuard::new(session, records.clone(), locks.clone());
        }
        assert_eq!(locks.check_write(None, &rec("temp")), Ok(()));
    }
}
