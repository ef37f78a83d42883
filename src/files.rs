//! File Cache Manager (C5): same surface as the KVS manager plus a
//! resident content store, size caps, preload, and disk revalidation.
//!
//! Grounded on the same `cachelito-core` read/write shape as
//! [`crate::kvs`], generalized with the arena-plus-index content store
//! from [`crate::eviction::ContentStore`] and the warmup-preload task
//! shape from `other_examples/842f8196_hivellm-task-queue__src-cache.rs.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::engine::{EngineKey, EngineRegistry};
use crate::error::{CachifyError, EngineError, Result};
use crate::events::{Event, EventBus};
use crate::eviction::{ContentStore, SharedContentStore, TtlScheduler};
use crate::lock::{LockManager, LockSessionGuard, RecordId, SessionId};
use crate::queue::{Priority, TaskQueue, TaskSpec};
use crate::record::{key_for_path, FileFields, FileRecord, Flavor, RecordMeta, Ttl, TtlPolicy, DEFAULT_SCOPE};

#[derive(Clone, Debug)]
pub struct TtlConfig {
    pub enabled: bool,
    pub value_ms: u64,
    pub policy: TtlPolicy,
}

#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    pub default_engines: Vec<String>,
    pub ttl: Option<TtlConfig>,
    pub max_file_size: Option<u64>,
    pub max_total_size: Option<u64>,
    pub eviction_max_records: Option<usize>,
}

impl FileConfig {
    pub fn engines_or_default(&self) -> Vec<String> {
        if self.default_engines.is_empty() {
            vec!["memory".to_string()]
        } else {
            self.default_engines.clone()
        }
    }
}

#[derive(Default)]
pub struct FileSetOptions {
    pub scope: Option<String>,
    pub store_in: Option<Vec<String>>,
    pub ttl: Option<Ttl>,
    pub preload: bool,
    pub session: Option<SessionId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    Hit,
    Miss,
}

#[derive(Clone, Debug)]
pub struct FileReadResult {
    pub status: ReadStatus,
    pub content: Bytes,
}

/// A `Path::canonicalize`-equivalent used on disk-read. Restore-mode
/// insertion and tests may not have a real file on disk; callers there
/// should not reach the on-disk loader.
#[async_trait::async_trait]
pub trait DiskReader: Send + Sync {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
    async fn metadata(&self, path: &Path) -> std::io::Result<(SystemTime, u64)>;
}

pub struct StdDiskReader;

#[async_trait::async_trait]
impl DiskReader for StdDiskReader {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn metadata(&self, path: &Path) -> std::io::Result<(SystemTime, u64)> {
        let meta = tokio::fs::metadata(path).await?;
        Ok((meta.modified()?, meta.len()))
    }
}

pub struct FileManager {
    client_id: Arc<str>,
    config: Mutex<FileConfig>,
    registry: Arc<EngineRegistry>,
    records: Mutex<HashMap<(String, String), FileRecord>>,
    content: SharedContentStore,
    ttl: Arc<TtlScheduler>,
    locks: Arc<LockManager>,
    pub(crate) queue: Arc<TaskQueue>,
    events: Arc<EventBus>,
    disk: Arc<dyn DiskReader>,
}

impl FileManager {
    pub fn new(
        client_id: Arc<str>,
        config: FileConfig,
        registry: Arc<EngineRegistry>,
        locks: Arc<LockManager>,
        queue: Arc<TaskQueue>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            client_id,
            config: Mutex::new(config),
            registry,
            records: Mutex::new(HashMap::new()),
            content: Arc::new(ContentStore::default()),
            ttl: Arc::new(TtlScheduler::default()),
            locks,
            queue,
            events,
            disk: Arc::new(StdDiskReader),
        }
    }

    fn record_id(scope: &str, key: &str) -> RecordId {
        (scope.to_string(), key.to_string())
    }

    fn validate_scope(scope: &str) -> Result<()> {
        if scope.is_empty() {
            return Err(CachifyError::Validation("scope must not be empty".into()));
        }
        Ok(())
    }

    pub async fn set(self: &Arc<Self>, path: impl AsRef<Path>, opts: FileSetOptions) -> Result<()> {
        let path = path.as_ref();
        let scope = opts.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        Self::validate_scope(&scope)?;
        let key = key_for_path(path);

        self.locks
            .check_write(opts.session, &Self::record_id(&scope, &key))
            .map_err(CachifyError::Session)?;

        let (mtime, size_on_disk) = self
            .disk
            .metadata(path)
            .await
            .map_err(|e| CachifyError::Validation(format!("cannot stat {}: {e}", path.display())))?;

        let engines = opts.store_in.unwrap_or_else(|| self.config.lock().engines_or_default());
        if engines.is_empty() {
            return Err(CachifyError::Validation("storeIn must not be empty".into()));
        }

        let mut written = Vec::with_capacity(engines.len());
        for name in &engines {
            let engine = self
                .registry
                .get(name)
                .ok_or_else(|| CachifyError::Engine(EngineError::Unavailable(name.clone())))?;
            let ctx = EngineKey {
                client_id: self.client_id.clone(),
                flavor: Flavor::Files,
                scope: scope.clone(),
                key: key.clone(),
            };
            // Only metadata is persisted on the engine; content lives
            // solely in the in-process content store (I3).
            let payload = bincode::serialize(&size_on_disk).unwrap_or_default();
            match engine.set(&ctx, payload).await {
                Ok(()) => written.push(engine),
                Err(err) => {
                    for engine in &written {
                        let ctx = EngineKey {
                            client_id: self.client_id.clone(),
                            flavor: Flavor::Files,
                            scope: scope.clone(),
                            key: key.clone(),
                        };
                        let _ = engine.remove(&ctx).await;
                    }
                    return Err(CachifyError::Engine(err));
                }
            }
        }

        let ttl = opts.ttl.or_else(|| {
            self.config.lock().ttl.clone().and_then(|cfg| {
                cfg.enabled.then_some(Ttl { value_ms: cfg.value_ms, policy: cfg.policy })
            })
        });

        let meta = RecordMeta::new(key.clone(), scope.clone(), engines, ttl, size_on_disk);
        let file = FileFields {
            path: path.to_path_buf(),
            name: path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
            mtime,
            size_on_disk,
            content_ref: None,
        };
        self.records.lock().insert((scope.clone(), key.clone()), FileRecord { meta, file });

        if let Some(ttl) = ttl {
            self.arm_ttl(&scope, &key, ttl);
        }

        if opts.preload {
            self.schedule_preload(scope.clone(), key.clone(), path.to_path_buf());
        }

        self.events.publish(Event::Set { flavor: Flavor::Files, scope, key });
        Ok(())
    }

    fn arm_ttl(self: &Arc<Self>, scope: &str, key: &str, ttl: Ttl) {
        let manager = self.clone();
        let scope_owned = scope.to_string();
        let key_owned = key.to_string();
        let policy = ttl.policy;
        self.ttl.arm(scope, key, Duration::from_millis(ttl.value_ms), async move {
            match policy {
                TtlPolicy::Evict => {
                    let _ = manager.remove_as(&key_owned, Some(&scope_owned), None).await;
                }
                TtlPolicy::Keep => {
                    manager.evict_content_only(&scope_owned, &key_owned);
                }
            }
            manager.events.publish(Event::Evict {
                flavor: Flavor::Files,
                scope: scope_owned,
                key: key_owned,
            });
        });
    }

    fn evict_content_only(&self, scope: &str, key: &str) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&(scope.to_string(), key.to_string())) {
            if let Some(content_ref) = record.file.content_ref.take() {
                self.content.remove(content_ref);
            }
        }
    }

    fn schedule_preload(self: &Arc<Self>, scope: String, key: String, path: PathBuf) {
        let manager = self.clone();
        let task_id = format!("preload:{scope}:{key}");
        let action = Box::pin(async move {
            if let Err(err) = manager.load_from_disk(&scope, &key, &path).await {
                tracing::warn!(%key, %err, "preload failed");
            }
        });
        let _ = self.queue.enqueue(TaskSpec {
            id: task_id,
            kind: "preload".to_string(),
            priority: Priority::P3,
            action,
        });
    }

    async fn load_from_disk(&self, scope: &str, key: &str, path: &Path) -> Result<Bytes> {
        let bytes = self
            .disk
            .read(path)
            .await
            .map_err(|e| CachifyError::Validation(format!("read {}: {e}", path.display())))?;
        let data = Bytes::from(bytes);
        let max_file = self.config.lock().max_file_size;
        if let Some(max) = max_file {
            if data.len() as u64 > max {
                // Capacity: admit record metadata only, no error (§7).
                return Ok(data);
            }
        }
        let max_total = self.config.lock().max_total_size;
        if let Some((content_ref, evicted)) = self.content.admit(data.clone(), max_total) {
            let mut records = self.records.lock();
            if let Some(record) = records.get_mut(&(scope.to_string(), key.to_string())) {
                record.file.content_ref = Some(content_ref);
            }
            for victim in evicted {
                if let Some(entry) = records.values_mut().find(|r| r.file.content_ref == Some(victim)) {
                    entry.file.content_ref = None;
                }
            }
        }
        Ok(data)
    }

    /// Reinserts a file record from captured backup metadata, bypassing
    /// the live `disk.metadata` stat `set` performs (`spec.md` §4.8
    /// restore-mode path). The record starts with `isCached:false`;
    /// content is reloaded lazily on the next [`Self::read`], same as
    /// any other cold record.
    pub(crate) async fn restore_record(
        self: &Arc<Self>,
        scope: String,
        key: String,
        path: PathBuf,
        name: String,
        mtime: SystemTime,
        size_on_disk: u64,
        store_in: Option<Vec<String>>,
    ) -> Result<()> {
        Self::validate_scope(&scope)?;

        let engines = store_in.unwrap_or_else(|| self.config.lock().engines_or_default());
        if engines.is_empty() {
            return Err(CachifyError::Validation("storeIn must not be empty".into()));
        }

        let mut written = Vec::with_capacity(engines.len());
        for name in &engines {
            let engine = self
                .registry
                .get(name)
                .ok_or_else(|| CachifyError::Engine(EngineError::Unavailable(name.clone())))?;
            let ctx = EngineKey {
                client_id: self.client_id.clone(),
                flavor: Flavor::Files,
                scope: scope.clone(),
                key: key.clone(),
            };
            let payload = bincode::serialize(&size_on_disk).unwrap_or_default();
            match engine.set(&ctx, payload).await {
                Ok(()) => written.push(engine),
                Err(err) => {
                    for engine in &written {
                        let ctx = EngineKey {
                            client_id: self.client_id.clone(),
                            flavor: Flavor::Files,
                            scope: scope.clone(),
                            key: key.clone(),
                        };
                        let _ = engine.remove(&ctx).await;
                    }
                    return Err(CachifyError::Engine(err));
                }
            }
        }

        let meta = RecordMeta::new(key.clone(), scope.clone(), engines, None, size_on_disk);
        let file = FileFields { path, name, mtime, size_on_disk, content_ref: None };
        self.records.lock().insert((scope.clone(), key.clone()), FileRecord { meta, file });

        self.events.publish(Event::Set { flavor: Flavor::Files, scope, key });
        Ok(())
    }

    /// Read protocol from `spec.md` §4.3: hit if content resident,
    /// else load from disk and admit.
    pub async fn read(self: &Arc<Self>, key: &str, scope: Option<&str>) -> Result<Option<FileReadResult>> {
        self.read_as(key, scope, None).await
    }

    pub async fn read_as(
        self: &Arc<Self>,
        key: &str,
        scope: Option<&str>,
        session: Option<SessionId>,
    ) -> Result<Option<FileReadResult>> {
        let scope = scope.unwrap_or(DEFAULT_SCOPE).to_string();
        let record_id = Self::record_id(&scope, key);
        self.locks.wait_for_read(session, &record_id).await;

        let (path, content_ref) = {
            let records = self.records.lock();
            match records.get(&(scope.clone(), key.to_string())) {
                Some(record) => (record.file.path.clone(), record.file.content_ref),
                None => return Ok(None),
            }
        };

        if let Some(content_ref) = content_ref {
            if let Some(bytes) = self.content.get(content_ref) {
                self.content.touch(content_ref);
                if let Some(meta) = self.records.lock().get_mut(&(scope, key.to_string())) {
                    meta.meta.touch();
                }
                return Ok(Some(FileReadResult { status: ReadStatus::Hit, content: bytes }));
            }
        }

        let data = self.load_from_disk(&scope, key, &path).await?;
        if let Some(meta) = self.records.lock().get_mut(&(scope, key.to_string())) {
            meta.meta.touch();
        }
        Ok(Some(FileReadResult { status: ReadStatus::Miss, content: data }))
    }

    pub async fn remove(&self, key: &str, scope: Option<&str>) -> Result<bool> {
        self.remove_as(key, scope, None).await
    }

    pub async fn remove_as(&self, key: &str, scope: Option<&str>, session: Option<SessionId>) -> Result<bool> {
        let scope = scope.unwrap_or(DEFAULT_SCOPE).to_string();
        self.locks
            .check_write(session, &Self::record_id(&scope, key))
            .map_err(CachifyError::Session)?;

        let removed = {
            let mut records = self.records.lock();
            records.remove(&(scope.clone(), key.to_string()))
        };
        let Some(record) = removed else { return Ok(false) };

        self.ttl.cancel(&scope, key);
        if let Some(content_ref) = record.file.content_ref {
            self.content.remove(content_ref);
        }

        let mut existed = false;
        for name in &record.meta.engines {
            if let Some(engine) = self.registry.get(name) {
                let ctx = EngineKey {
                    client_id: self.client_id.clone(),
                    flavor: Flavor::Files,
                    scope: scope.clone(),
                    key: key.to_string(),
                };
                if let Ok(true) = engine.remove(&ctx).await {
                    existed = true;
                }
            }
        }
        self.events.publish(Event::Remove { flavor: Flavor::Files, scope, key: key.to_string() });
        Ok(existed)
    }

    pub fn has(&self, key: &str, scope: Option<&str>) -> bool {
        let scope = scope.unwrap_or(DEFAULT_SCOPE).to_string();
        self.records.lock().contains_key(&(scope, key.to_string()))
    }

    pub fn size(&self) -> usize {
        self.records.lock().len()
    }

    pub fn content_store_size(&self) -> usize {
        self.content.len()
    }

    /// Returns the full record, including `isCached`/`contentRef`.
    pub fn inspect(&self, key: &str, scope: Option<&str>) -> Option<FileRecord> {
        let scope = scope.unwrap_or(DEFAULT_SCOPE).to_string();
        self.records.lock().get(&(scope, key.to_string())).cloned()
    }

    /// Lists every `(scope, key)` currently tracked, for snapshot
    /// enumeration by the persistence pipeline.
    pub fn keys(&self, scope: Option<&str>) -> Vec<(String, String)> {
        self.records
            .lock()
            .keys()
            .filter(|(s, _)| scope.map(|wanted| s == wanted).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn clear(&self, scope: Option<&str>) -> Result<()> {
        let keys: Vec<(String, String)> = {
            let records = self.records.lock();
            records
                .keys()
                .filter(|(s, _)| scope.map(|wanted| s == wanted).unwrap_or(true))
                .cloned()
                .collect()
        };
        for (scope, key) in keys {
            let _ = self.remove(&key, Some(&scope)).await;
        }
        Ok(())
    }

    pub async fn create_lock_session(
        self: &Arc<Self>,
        records: &[(String, String)],
        block_read: bool,
        timeout: Duration,
    ) -> Result<LockSessionGuard> {
        let record_ids: Vec<RecordId> = records.to_vec();
        let session_id = self
            .locks
            .acquire(&record_ids, block_read, timeout)
            .await
            .map_err(CachifyError::Session)?;
        Ok(LockSessionGuard::new(session_id, record_ids, self.locks.clone()))
    }

    // --- lifecycle tracker integration (C7) ---

    /// Reloads resident content in place, or invalidates stale
    /// metadata so the next read reloads (§4.5 `update`).
    pub(crate) async fn on_watch_update(self: &Arc<Self>, path: &Path) {
        let key = key_for_path(path);
        let scope = DEFAULT_SCOPE.to_string();
        let was_cached = {
            let records = self.records.lock();
            records
                .get(&(scope.clone(), key.clone()))
                .map(|r| r.file.content_ref.is_some())
        };
        let Some(was_cached) = was_cached else { return };
        if was_cached {
            let _ = self.load_from_disk(&scope, &key, path).await;
        } else if let Ok((mtime, size_on_disk)) = self.disk.metadata(path).await {
            if let Some(record) = self.records.lock().get_mut(&(scope, key)) {
                record.file.mtime = mtime;
                record.file.size_on_disk = size_on_disk;
            }
        }
        self.events.publish(Event::Update { flavor: Flavor::Files, scope: DEFAULT_SCOPE.to_string(), key: key_for_path(path) });
    }

    /// Rekeys a record from `old_path` to `new_path`, last-writer-wins
    /// if a record already exists under the new key (§4.5 `rename`).
    pub(crate) fn on_watch_rename(&self, old_path: &Path, new_path: &Path) {
        let scope = DEFAULT_SCOPE.to_string();
        let old_key = key_for_path(old_path);
        let new_key = key_for_path(new_path);

        let mut records = self.records.lock();
        let Some(mut record) = records.remove(&(scope.clone(), old_key)) else { return };
        record.file.path = new_path.to_path_buf();
        record.file.name = new_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        record.meta.key = new_key.clone();
        if let Some(superseded) = records.insert((scope, new_key), record) {
            if let Some(content_ref) = superseded.file.content_ref {
                self.content.remove(content_ref);
            }
        }
    }

    /// Full removal across all engines (§4.5 `delete`).
    pub(crate) async fn on_watch_delete(&self, path: &Path) {
        let key = key_for_path(path);
        let _ = self.remove(&key, Some(DEFAULT_SCOPE)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::io::Write;

    fn manager(config: FileConfig) -> Arc<FileManager> {
        Arc::new(FileManager::new(
            Arc::from("test-client"),
            config,
            Arc::new(EngineRegistry::new(Arc::from("test-client"))),
            Arc::new(LockManager::default()),
            TaskQueue::new(1),
            Arc::new(EventBus::default()),
        ))
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![b'x'; size]).unwrap();
        path
    }

    // Scenario 1: LRU eviction. B (2MB) evicts A (1MB) under a 2.5MB cap.
    #[tokio::test]
    async fn lru_eviction_keeps_only_what_fits() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(FileConfig {
            max_file_size: Some(2 * 1024 * 1024),
            max_total_size: Some(2 * 1024 * 1024 + 512 * 1024),
            ..Default::default()
        });

        let a = write_file(&dir, "a.bin", 1024 * 1024);
        let b = write_file(&dir, "b.bin", 2 * 1024 * 1024);

        files.set(&a, FileSetOptions { preload: true, ..Default::default() }).await.unwrap();
        files.set(&b, FileSetOptions { preload: true, ..Default::default() }).await.unwrap();
        files.queue.wait_for_idle().await;

        let key_a = key_for_path(&a);
        let key_b = key_for_path(&b);
        assert!(!files.inspect(&key_a, None).unwrap().file.is_cached());
        assert!(files.inspect(&key_b, None).unwrap().file.is_cached());
    }

    // (P4) content-store size never exceeds the record count.
    #[tokio::test]
    async fn content_store_size_bounded_by_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(FileConfig::default());
        let a = write_file(&dir, "a.bin", 16);
        files.set(&a, FileSetOptions { preload: true, ..Default::default() }).await.unwrap();
        files.queue.wait_for_idle().await;
        assert!(files.content_store_size() <= files.size());
    }

    // Scenario 2: TTL evict removes the whole record.
    #[tokio::test]
    async fn ttl_evict_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(FileConfig {
            ttl: Some(TtlConfig { enabled: true, value_ms: 50, policy: TtlPolicy::Evict }),
            ..Default::default()
        });
        let f = write_file(&dir, "f.bin", 16);
        files.set(&f, FileSetOptions { preload: true, ..Default::default() }).await.unwrap();
        files.queue.wait_for_idle().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(files.inspect(&key_for_path(&f), None).is_none());
    }

    // Scenario 3: TTL keep drops content but keeps metadata; next read misses then re-hits.
    #[tokio::test]
    async fn ttl_keep_drops_content_only() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(FileConfig {
            ttl: Some(TtlConfig { enabled: true, value_ms: 50, policy: TtlPolicy::Keep }),
            ..Default::default()
        });
        let f = write_file(&dir, "f.bin", 16);
        files.set(&f, FileSetOptions { preload: true, ..Default::default() }).await.unwrap();
        files.queue.wait_for_idle().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let key = key_for_path(&f);
        let record = files.inspect(&key, None).expect("record survives a keep TTL");
        assert!(!record.file.is_cached());

        let result = files.read(&key, None).await.unwrap().unwrap();
        assert_eq!(result.status, ReadStatus::Miss);
    }

    #[tokio::test]
    async fn read_populates_content_store_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(FileConfig::default());
        let f = write_file(&dir, "f.bin", 16);
        files.set(&f, FileSetOptions::default()).await.unwrap();

        let key = key_for_path(&f);
        let miss = files.read(&key, None).await.unwrap().unwrap();
        assert_eq!(miss.status, ReadStatus::Miss);
        let hit = files.read(&key, None).await.unwrap().unwrap();
        assert_eq!(hit.status, ReadStatus::Hit);
        assert_eq!(hit.content, miss.content);
    }
}
