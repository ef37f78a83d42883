//! KVS Manager (C4): CRUD over key-value records, fan-out writes,
//! fastest-read-wins.
//!
//! Grounded on `cachelito-core/src/global_cache.rs`'s `get`/`insert`
//! shape (read-then-touch, write-then-evict), generalized from one
//! in-process map to a fan-out over the engine registry, and on
//! `other_examples/b5af6de3_..._file_cache.rs.rs`'s layered
//! memory-then-remote read fallback for the multi-engine race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::{EngineKey, EngineRegistry};
use crate::error::{CachifyError, EngineError, Result};
use crate::eviction::TtlScheduler;
use crate::events::{Event, EventBus};
use crate::lock::{LockManager, LockSessionGuard, RecordId, SessionId};
use crate::record::{Flavor, RecordMeta, Ttl, TtlPolicy, DEFAULT_SCOPE};

#[derive(Clone, Debug)]
pub struct TtlConfig {
    pub enabled: bool,
    pub value_ms: u64,
    pub policy: TtlPolicy,
}

#[derive(Clone, Debug, Default)]
pub struct KvsConfig {
    pub default_engines: Vec<String>,
    pub ttl: Option<TtlConfig>,
}

impl KvsConfig {
    pub fn engines_or_default(&self) -> Vec<String> {
        if self.default_engines.is_empty() {
            vec!["memory".to_string()]
        } else {
            self.default_engines.clone()
        }
    }
}

#[derive(Default)]
pub struct SetOptions {
    pub scope: Option<String>,
    pub store_in: Option<Vec<String>>,
    pub ttl: Option<Ttl>,
    /// Set when called through a [`LockSessionGuard`] the caller owns;
    /// lets an owning session's write bypass its own lock (I5/§4.7).
    pub session: Option<SessionId>,
}

pub struct KvsManager {
    client_id: Arc<str>,
    config: Mutex<KvsConfig>,
    registry: Arc<EngineRegistry>,
    records: Mutex<HashMap<(String, String), RecordMeta>>,
    ttl: Arc<TtlScheduler>,
    locks: Arc<LockManager>,
    events: Arc<EventBus>,
}

impl KvsManager {
    pub fn new(
        client_id: Arc<str>,
        config: KvsConfig,
        registry: Arc<EngineRegistry>,
        locks: Arc<LockManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            client_id,
            config: Mutex::new(config),
            registry,
            records: Mutex::new(HashMap::new()),
            ttl: Arc::new(TtlScheduler::default()),
            locks,
            events,
        }
    }

    fn validate(key: &str, scope: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CachifyError::Validation("key must not be empty".into()));
        }
        if scope.is_empty() {
            return Err(CachifyError::Validation("scope must not be empty".into()));
        }
        Ok(())
    }

    fn record_id(scope: &str, key: &str) -> RecordId {
        (scope.to_string(), key.to_string())
    }

    pub async fn set<T: Serialize>(self: &Arc<Self>, key: &str, value: &T, opts: SetOptions) -> Result<()> {
        let payload = bincode::serialize(value)
            .map_err(|e| CachifyError::Serialization(e.to_string()))?;
        self.set_raw(key, payload, opts).await
    }

    /// Fan-out write of an already-serialized payload, bypassing the
    /// caller-type encoding step. Used by [`Self::set`] and by the
    /// persistence pipeline's restore path, which re-inserts the exact
    /// bytes a backup captured rather than re-encoding them.
    pub async fn set_raw(self: &Arc<Self>, key: &str, payload: Vec<u8>, opts: SetOptions) -> Result<()> {
        let scope = opts.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        Self::validate(key, &scope)?;
        self.locks
            .check_write(opts.session, &Self::record_id(&scope, key))
            .map_err(CachifyError::Session)?;

        let size = payload.len() as u64;

        let engines = opts.store_in.unwrap_or_else(|| self.config.lock().engines_or_default());
        if engines.is_empty() {
            return Err(CachifyError::Validation("storeIn must not be empty".into()));
        }

        let ttl = opts.ttl.or_else(|| {
            self.config.lock().ttl.clone().and_then(|cfg| {
                cfg.enabled.then_some(Ttl { value_ms: cfg.value_ms, policy: cfg.policy })
            })
        });
        if let Some(ttl) = &ttl {
            if ttl.policy != TtlPolicy::Evict {
                return Err(CachifyError::Validation(
                    "KVS records only support TtlPolicy::Evict".into(),
                ));
            }
        }

        let mut written = Vec::with_capacity(engines.len());
        for name in &engines {
            let engine = self
                .registry
                .get(name)
                .ok_or_else(|| CachifyError::Engine(EngineError::Unavailable(name.clone())))?;
            let ctx = EngineKey {
                client_id: self.client_id.clone(),
                flavor: Flavor::Kvs,
                scope: scope.clone(),
                key: key.to_string(),
            };
            match engine.set(&ctx, payload.clone()).await {
                Ok(()) => written.push((name.clone(), engine)),
                Err(err) => {
                    for (_, engine) in &written {
                        let ctx = EngineKey {
                            client_id: self.client_id.clone(),
                            flavor: Flavor::Kvs,
                            scope: scope.clone(),
                            key: key.to_string(),
                        };
                        let _ = engine.remove(&ctx).await;
                    }
                    return Err(CachifyError::Engine(err));
                }
            }
        }

        let meta = RecordMeta::new(key.to_string(), scope.clone(), engines, ttl, size);
        self.records.lock().insert((scope.clone(), key.to_string()), meta);

        if let Some(ttl) = ttl {
            self.arm_ttl(&scope, key, ttl);
        }

        self.events.publish(Event::Set { flavor: Flavor::Kvs, scope, key: key.to_string() });
        Ok(())
    }

    /// `set_raw` rejects `TtlPolicy::Keep` before this is ever reached,
    /// so the armed timer always evicts the whole record.
    fn arm_ttl(self: &Arc<Self>, scope: &str, key: &str, ttl: Ttl) {
        let manager = self.clone();
        let scope_owned = scope.to_string();
        let key_owned = key.to_string();
        self.ttl.arm(scope, key, Duration::from_millis(ttl.value_ms), async move {
            let _ = manager.remove(&key_owned, Some(&scope_owned)).await;
            manager.events.publish(Event::Evict {
                flavor: Flavor::Kvs,
                scope: scope_owned,
                key: key_owned,
            });
        });
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &str, scope: Option<&str>) -> Result<Option<T>> {
        self.read_as(key, scope, None).await
    }

    pub async fn read_as<T: DeserializeOwned>(
        &self,
        key: &str,
        scope: Option<&str>,
        session: Option<SessionId>,
    ) -> Result<Option<T>> {
        match self.read_raw(key, scope, session).await? {
            Some(bytes) => {
                let value: T = bincode::deserialize(&bytes)
                    .map_err(|e| CachifyError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Fastest-reader-wins fan-out returning the raw serialized bytes,
    /// without decoding into a caller type. Used directly by the
    /// persistence pipeline when snapshotting KVS records.
    pub async fn read_raw(
        &self,
        key: &str,
        scope: Option<&str>,
        session: Option<SessionId>,
    ) -> Result<Option<Vec<u8>>> {
        let scope = scope.unwrap_or(DEFAULT_SCOPE).to_string();
        Self::validate(key, &scope)?;

        let record_id = Self::record_id(&scope, key);
        self.locks.wait_for_read(session, &record_id).await;

        let engines: Vec<String> = {
            let records = self.records.lock();
            match records.get(&(scope.clone(), key.to_string())) {
                Some(meta) => meta.engines.clone(),
                None => self.config.lock().engines_or_default(),
            }
        };
        if engines.is_empty() {
            return Ok(None);
        }

        let mut futs = FuturesUnordered::new();
        for name in &engines {
            let Some(engine) = self.registry.get(name) else { continue };
            let ctx = EngineKey {
                client_id: self.client_id.clone(),
                flavor: Flavor::Kvs,
                scope: scope.clone(),
                key: key.to_string(),
            };
            futs.push(async move { engine.read(&ctx).await });
        }

        let attempted = futs.len();
        let mut failed = 0usize;
        while let Some(result) = futs.next().await {
            match result {
                Ok(Some(bytes)) => {
                    if let Some(meta) =
                        self.records.lock().get_mut(&(scope.clone(), key.to_string()))
                    {
                        meta.touch();
                    }
                    return Ok(Some(bytes));
                }
                Ok(None) => continue,
                Err(_) => failed += 1,
            }
        }

        if failed > 0 {
            return Err(CachifyError::Read { attempted, failed });
        }
        Ok(None)
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

    pub async fn remove(&self, key: &str, scope: Option<&str>) -> Result<bool> {
        self.remove_as(key, scope, None).await
    }

    pub async fn remove_as(&self, key: &str, scope: Option<&str>, session: Option<SessionId>) -> Result<bool> {
        let scope = scope.unwrap_or(DEFAULT_SCOPE).to_string();
        Self::validate(key, &scope)?;
        self.locks
            .check_write(session, &Self::record_id(&scope, key))
            .map_err(CachifyError::Session)?;

        let engines = {
            let mut records = self.records.lock();
            records.remove(&(scope.clone(), key.to_string())).map(|m| m.engines)
        };
        let Some(engines) = engines else { return Ok(false) };

        self.ttl.cancel(&scope, key);

        let mut existed = false;
        for name in &engines {
            if let Some(engine) = self.registry.get(name) {
                let ctx = EngineKey {
                    client_id: self.client_id.clone(),
                    flavor: Flavor::Kvs,
                    scope: scope.clone(),
                    key: key.to_string(),
                };
                if let Ok(true) = engine.remove(&ctx).await {
                    existed = true;
                }
            }
        }
        self.events.publish(Event::Remove { flavor: Flavor::Kvs, scope, key: key.to_string() });
        Ok(existed)
    }

    pub fn has(&self, key: &str, scope: Option<&str>) -> bool {
        let scope = scope.unwrap_or(DEFAULT_SCOPE).to_string();
        self.records.lock().contains_key(&(scope, key.to_string()))
    }

    pub fn size(&self) -> usize {
        self.records.lock().len()
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

    /// Acquires exclusive write access (and optionally blocks reads)
    /// over `records` as an atomic set. See `spec.md` §4.7.
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::events::EventBus;

    fn manager() -> Arc<KvsManager> {
        Arc::new(KvsManager::new(
            Arc::from("test-client"),
            KvsConfig::default(),
            Arc::new(EngineRegistry::new(Arc::from("test-client"))),
            Arc::new(LockManager::default()),
            Arc::new(EventBus::default()),
        ))
    }

    // (P1) set then read returns the stored value.
    #[tokio::test]
    async fn set_then_read_returns_value() {
        let kvs = manager();
        kvs.set("user:1", &"ahmad".to_string(), SetOptions::default()).await.unwrap();
        let value: Option<String> = kvs.read("user:1", None).await.unwrap();
        assert_eq!(value.as_deref(), Some("ahmad"));
    }

    // (P2) remove then read yields absent.
    #[tokio::test]
    async fn remove_then_read_is_absent() {
        let kvs = manager();
        kvs.set("user:1", &"ahmad".to_string(), SetOptions::default()).await.unwrap();
        assert!(kvs.remove("user:1", None).await.unwrap());
        let value: Option<String> = kvs.read("user:1", None).await.unwrap();
        assert_eq!(value, None);
        assert!(!kvs.remove("user:1", None).await.unwrap());
    }

    #[tokio::test]
    async fn read_raw_bypasses_double_encoding() {
        let kvs = manager();
        let payload = bincode::serialize(&"ahmad".to_string()).unwrap();
        kvs.set_raw("user:1", payload.clone(), SetOptions::default()).await.unwrap();
        let raw = kvs.read_raw("user:1", None, None).await.unwrap().unwrap();
        assert_eq!(raw, payload);
    }

    #[tokio::test]
    async fn write_fails_while_locked_by_another_session() {
        let kvs = manager();
        kvs.set("user:1", &"ahmad".to_string(), SetOptions::default()).await.unwrap();
        let guard = kvs
            .create_lock_session(&[("global".to_string(), "user:1".to_string())], false, Duration::from_secs(1))
            .await
            .unwrap();

        let err = kvs.set("user:1", &"suzy".to_string(), SetOptions::default()).await.unwrap_err();
        assert!(matches!(err, CachifyError::Session(SessionError::Locked)));

        let opts = SetOptions { session: Some(guard.session_id), ..Default::default() };
        kvs.set("user:1", &"suzy".to_string(), opts).await.unwrap();
        guard.release();
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let kvs = manager();
        let err = kvs.set("", &1i32, SetOptions::default()).await.unwrap_err();
        assert!(matches!(err, CachifyError::Validation(_)));
    }

    #[tokio::test]
    async fn keep_ttl_policy_is_rejected_for_kvs_records() {
        let kvs = manager();
        let opts = SetOptions {
            ttl: Some(Ttl { value_ms: 1_000, policy: TtlPolicy::Keep }),
            ..Default::default()
        };
        let err = kvs.set("user:1", &"ahmad".to_string(), opts).await.unwrap_err();
        assert!(matches!(err, CachifyError::Validation(_)));
        assert!(!kvs.has("user:1", None));
    }
}
