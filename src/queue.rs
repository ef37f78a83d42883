//! Priority task queue (C1): ordered background work feeding eviction
//! and warmup preloads.
//!
//! Grounded on `cachelito-core`'s `order: Mutex<VecDeque<String>>`
//! FIFO-within-a-bucket idiom (`global_cache.rs`), generalized from one
//! bucket to four priority bands, and on
//! `other_examples/842f8196_hivellm-task-queue__src-cache.rs.rs` for
//! the bounded-concurrency worker shape.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::QueueError;

/// Lower value runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

type BoxFut = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A unit of queued work. `action` is the task body; callers observe
/// completion through whatever channel they closed over when building
/// `action` (an `onResolve`/`onReject`/`onDone` triple in spirit).
pub struct TaskSpec {
    pub id: String,
    pub kind: String,
    pub priority: Priority,
    pub action: BoxFut,
}

struct Bucket {
    tasks: VecDeque<TaskSpec>,
}

/// Four-band priority queue with bounded concurrency.
pub struct TaskQueue {
    buckets: Mutex<[Bucket; 4]>,
    known_ids: Arc<Mutex<HashSet<String>>>,
    running: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
    work_notify: Arc<Notify>,
    concurrency: Arc<Semaphore>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Arc<Self> {
        let queue = Arc::new(Self {
            buckets: Mutex::new([
                Bucket { tasks: VecDeque::new() },
                Bucket { tasks: VecDeque::new() },
                Bucket { tasks: VecDeque::new() },
                Bucket { tasks: VecDeque::new() },
            ]),
            known_ids: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(AtomicUsize::new(0)),
            idle_notify: Arc::new(Notify::new()),
            work_notify: Arc::new(Notify::new()),
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
        });
        let worker = queue.clone();
        tokio::spawn(async move { worker.run().await });
        queue
    }

    /// Enqueues a task. Fails on a duplicate id or an empty id/kind.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<(), QueueError> {
        if spec.id.is_empty() {
            return Err(QueueError::InvalidTask("missing id".into()));
        }
        if spec.kind.is_empty() {
            return Err(QueueError::InvalidTask("missing type".into()));
        }
        {
            let mut ids = self.known_ids.lock();
            if !ids.insert(spec.id.clone()) {
                return Err(QueueError::DuplicateId(spec.id));
            }
        }
        let band = spec.priority as usize;
        self.buckets.lock()[band].tasks.push_back(spec);
        self.work_notify.notify_one();
        Ok(())
    }

    /// Discards a task that has not started yet. No-op if it already
    /// started or never existed. `onResolve` is never invoked for a
    /// cancelled task, per `spec.md` §5.
    pub fn cancel(&self, id: &str) -> bool {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            if let Some(pos) = bucket.tasks.iter().position(|t| t.id == id) {
                bucket.tasks.remove(pos);
                self.known_ids.lock().remove(id);
                return true;
            }
        }
        false
    }

    fn pop_next(&self) -> Option<TaskSpec> {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            if let Some(task) = bucket.tasks.pop_front() {
                return Some(task);
            }
        }
        None
    }

    fn is_idle(&self) -> bool {
        self.running.load(Ordering::SeqCst) == 0
            && self.buckets.lock().iter().all(|b| b.tasks.is_empty())
    }

    async fn run(self: Arc<Self>) {
        loop {
            let task = self.pop_next();
            let Some(task) = task else {
                if self.is_idle() {
                    self.idle_notify.notify_waiters();
                }
                self.work_notify.notified().await;
                continue;
            };
            self.running.fetch_add(1, Ordering::SeqCst);
            let permit = self.concurrency.clone().acquire_owned().await.ok();
            let known_ids = self.known_ids.clone();
            let running = self.running.clone();
            let work_notify = self.work_notify.clone();
            let idle_notify = self.idle_notify.clone();
            let id = task.id.clone();
            let is_idle_check = self.clone();
            tokio::spawn(async move {
                task.action.await;
                known_ids.lock().remove(&id);
                drop(permit);
                running.fetch_sub(1, Ordering::SeqCst);
                work_notify.notify_one();
                if is_idle_check.is_idle() {
                    idle_notify.notify_waiters();
                }
            });
        }
    }

    /// Resolves once no tasks are queued or running.
    pub async fn wait_for_idle(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            self.idle_notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn spec(id: &str, priority: Priority, order: Arc<StdMutex<Vec<String>>>) -> TaskSpec {
        let id_owned = id.to_string();
        TaskSpec {
            id: id_owned.clone(),
            kind: "test".to_string(),
            priority,
            action: Box::pin(async move {
                order.lock().unwrap().push(id_owned);
            }),
        }
    }

    // (P8) execution order equals sort-by-priority-then-insertion.
    #[tokio::test]
    async fn runs_in_priority_then_insertion_order() {
        let queue = TaskQueue::new(1);
        let order = Arc::new(StdMutex::new(Vec::new()));

        queue.enqueue(spec("low-a", Priority::P3, order.clone())).unwrap();
        queue.enqueue(spec("low-b", Priority::P3, order.clone())).unwrap();
        queue.enqueue(spec("high", Priority::P0, order.clone())).unwrap();
        queue.enqueue(spec("mid", Priority::P1, order.clone())).unwrap();

        queue.wait_for_idle().await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low-a", "low-b"]);
    }

    #[tokio::test]
    async fn rejects_duplicate_task_ids() {
        let queue = TaskQueue::new(1);
        let order = Arc::new(StdMutex::new(Vec::new()));
        queue.enqueue(spec("dup", Priority::P0, order.clone())).unwrap();
        let err = queue.enqueue(spec("dup", Priority::P0, order)).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn cancel_drops_a_not_yet_started_task() {
        let queue = TaskQueue::new(0);
        let order = Arc::new(StdMutex::new(Vec::new()));
        queue.enqueue(spec("blocker", Priority::P3, order.clone())).unwrap();
        assert!(queue.cancel("blocker"));
        assert!(!queue.cancel("blocker"));
    }
}
