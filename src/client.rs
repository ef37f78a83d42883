//! Client Facade (C10): bundles the engine registry, both managers,
//! the persistence pipeline, the event bus, and the task queue behind
//! one instance-scoped handle.
//!
//! Grounded on `cachelito-core/src/invalidation.rs`'s
//! `InvalidationRegistry::global()` singleton idiom, generalized from
//! "one global registry" to "the default client is one pre-built
//! instance of the same aggregate `create_client()` produces" — the
//! composition-over-inheritance pattern from `spec.md` §9.

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::task::JoinHandle;

use crate::engine::EngineRegistry;
use crate::events::EventBus;
use crate::files::{FileConfig, FileManager};
use crate::kvs::{KvsConfig, KvsManager};
use crate::lock::LockManager;
use crate::persistence::PersistenceManager;
use crate::queue::TaskQueue;
use crate::tracker::{FileLifecycleTracker, FileWatcher};

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub encryption_key: Option<[u8; 32]>,
    pub backup_root: PathBuf,
    pub kvs: KvsConfig,
    pub files: FileConfig,
    /// Background task queue concurrency. 1 = strictly cooperative,
    /// matching `spec.md` §4.6's default single-runner queue.
    pub task_concurrency: usize,
}

fn generate_client_id() -> Arc<str> {
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric).take(16).collect();
    Arc::from(format!("client-{suffix}"))
}

/// An isolated Cachify instance. Clients share only process-level
/// externalities (the filesystem watcher); everything else — engines,
/// records, locks, queue — is per-instance.
pub struct Client {
    pub client_id: Arc<str>,
    pub engines: Arc<EngineRegistry>,
    pub kvs: Arc<KvsManager>,
    pub files: Arc<FileManager>,
    pub persistence: Arc<PersistenceManager>,
    pub events: Arc<EventBus>,
    pub queue: Arc<TaskQueue>,
    pub locks: Arc<LockManager>,
    pub tracker: Arc<FileLifecycleTracker>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let client_id = generate_client_id();
        let locks = Arc::new(LockManager::default());
        let queue = TaskQueue::new(config.task_concurrency.max(1));
        let events = Arc::new(EventBus::default());
        let engines = Arc::new(EngineRegistry::new(client_id.clone()));

        let kvs = Arc::new(KvsManager::new(
            client_id.clone(),
            config.kvs,
            engines.clone(),
            locks.clone(),
            events.clone(),
        ));
        let files = Arc::new(FileManager::new(
            client_id.clone(),
            config.files,
            engines.clone(),
            locks.clone(),
            queue.clone(),
            events.clone(),
        ));
        let persistence = Arc::new(PersistenceManager::new(
            config.encryption_key,
            kvs.clone(),
            files.clone(),
            queue.clone(),
        ));
        if !config.backup_root.as_os_str().is_empty() {
            persistence.register(
                "local",
                Arc::new(crate::persistence::LocalFsDestination::new(config.backup_root)),
            );
        }
        let tracker = Arc::new(FileLifecycleTracker::new(files.clone(), locks.clone()));

        Arc::new(Self { client_id, engines, kvs, files, persistence, events, queue, locks, tracker })
    }

    /// Clears every KVS and file record across the default engine set.
    pub async fn clear(&self) {
        let _ = self.kvs.clear(None).await;
        let _ = self.files.clear(None).await;
    }

    /// Spawns the file lifecycle tracker (C7) over `watcher`, consuming
    /// its event stream until the watcher closes (`spec.md` §4.5).
    pub fn track(&self, watcher: Arc<dyn FileWatcher>) -> JoinHandle<()> {
        let tracker = self.tracker.clone();
        tokio::spawn(async move { tracker.run(watcher).await })
    }
}

/// Yields a fresh, fully isolated client instance (`spec.md` §4.9).
pub fn create_client(config: ClientConfig) -> Arc<Client> {
    Client::new(config)
}

static DEFAULT_CLIENT: Lazy<Arc<Client>> = Lazy::new(|| Client::new(ClientConfig::default()));

/// The process-wide default client: one pre-constructed `Client`
/// instance, lazily built on first access.
pub fn default_client() -> Arc<Client> {
    DEFAULT_CLIENT.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::WatchEvent;

    struct ClosedWatcher;

    #[async_trait::async_trait]
    impl FileWatcher for ClosedWatcher {
        async fn next_event(&self) -> Option<WatchEvent> {
            None
        }
    }

    #[tokio::test]
    async fn client_bundles_a_tracker_and_can_spawn_it() {
        let client = Client::new(ClientConfig::default());
        let handle = client.track(Arc::new(ClosedWatcher));
        handle.await.unwrap();
    }
}
