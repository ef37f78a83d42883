//! File Lifecycle Tracker (C7): consumes external watcher events and
//! reflects them onto the file manager's record state.
//!
//! The watcher itself is out of scope (`spec.md` §1); only its
//! contract is defined here, as an `async_trait` event source —
//! grounded on the same `async_trait` shape used for [`crate::engine::Engine`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::files::FileManager;
use crate::lock::{LockManager, DEFAULT_TIMEOUT};

#[derive(Clone, Debug)]
pub enum WatchEvent {
    Update(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
    Delete(PathBuf),
}

/// External collaborator contract: something that hands the tracker a
/// stream of filesystem events. Not implemented here.
#[async_trait]
pub trait FileWatcher: Send + Sync {
    async fn next_event(&self) -> Option<WatchEvent>;
}

/// Serializes lifecycle events per path through the lock manager so
/// concurrent events on the same path cannot tear the manager's view
/// of a record (`spec.md` §4.5).
pub struct FileLifecycleTracker {
    files: Arc<FileManager>,
    locks: Arc<LockManager>,
}

impl FileLifecycleTracker {
    pub fn new(files: Arc<FileManager>, locks: Arc<LockManager>) -> Self {
        Self { files, locks }
    }

    /// Runs until the watcher's event stream ends.
    pub async fn run(&self, watcher: Arc<dyn FileWatcher>) {
        while let Some(event) = watcher.next_event().await {
            self.handle(event).await;
        }
    }

    pub async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Update(path) => {
                let record_id = (crate::record::DEFAULT_SCOPE.to_string(), crate::record::key_for_path(&path));
                self.with_serialized(&[record_id], || self.files.on_watch_update(&path)).await;
            }
            WatchEvent::Rename { from, to } => {
                let from_id = (crate::record::DEFAULT_SCOPE.to_string(), crate::record::key_for_path(&from));
                let to_id = (crate::record::DEFAULT_SCOPE.to_string(), crate::record::key_for_path(&to));
                let records = [from_id, to_id];
                if let Ok(session) = self.locks.acquire(&records, false, Duration::from_secs(1)).await {
                    self.files.on_watch_rename(&from, &to);
                    self.locks.release(session, &records);
                }
            }
            WatchEvent::Delete(path) => {
                let record_id = (crate::record::DEFAULT_SCOPE.to_string(), crate::record::key_for_path(&path));
                let records = [record_id];
                if let Ok(session) = self.locks.acquire(&records, false, Duration::from_secs(1)).await {
                    self.files.on_watch_delete(&path).await;
                    self.locks.release(session, &records);
                }
            }
        }
    }

    async fn with_serialized<F, Fut>(&self, records: &[(String, String)], f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if let Ok(session) = self.locks.acquire(records, false, DEFAULT_TIMEOUT).await {
            f().await;
            self.locks.release(session, records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::events::EventBus;
    use crate::files::{FileConfig, FileSetOptions, ReadStatus};
    use crate::queue::TaskQueue;
    use crate::record::key_for_path;
    use std::io::Write;

    fn tracker_with_files() -> (Arc<FileManager>, FileLifecycleTracker) {
        let client_id: Arc<str> = Arc::from("test-client");
        let locks = Arc::new(LockManager::default());
        let files = Arc::new(FileManager::new(
            client_id.clone(),
            FileConfig::default(),
            Arc::new(EngineRegistry::new(client_id)),
            locks.clone(),
            TaskQueue::new(1),
            Arc::new(EventBus::default()),
        ));
        let tracker = FileLifecycleTracker::new(files.clone(), locks);
        (files, tracker)
    }

    // Scenario 4: rename transparency — the record moves to the new path's
    // key and a read against the new key still hits.
    #[tokio::test]
    async fn rename_rekeys_and_preserves_cached_content() {
        let dir = tempfile::tempdir().unwrap();
        let orig = dir.path().join("orig.txt");
        std::fs::File::create(&orig).unwrap().write_all(b"initial content").unwrap();

        let (files, tracker) = tracker_with_files();
        files.set(&orig, FileSetOptions { preload: true, ..Default::default() }).await.unwrap();
        files.queue.wait_for_idle().await;

        let renamed = dir.path().join("renamed.txt");
        std::fs::rename(&orig, &renamed).unwrap();
        tracker.handle(WatchEvent::Rename { from: orig.clone(), to: renamed.clone() }).await;

        assert!(files.inspect(&key_for_path(&orig), None).is_none());
        assert!(files.inspect(&key_for_path(&renamed), None).is_some());

        let result = files.read(&key_for_path(&renamed), None).await.unwrap().unwrap();
        assert_eq!(result.status, ReadStatus::Hit);
        assert_eq!(&result.content[..], b"initial content");
    }

    #[tokio::test]
    async fn delete_event_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::File::create(&path).unwrap().write_all(b"x").unwrap();

        let (files, tracker) = tracker_with_files();
        files.set(&path, FileSetOptions::default()).await.unwrap();
        tracker.handle(WatchEvent::Delete(path.clone())).await;

        assert!(files.inspect(&key_for_path(&path), None).is_none());
    }
}
