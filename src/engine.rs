//! Engine registry (C2).
//!
//! An engine is a named storage capability implementing
//! `set`/`read`/`remove`/`clear`. `MemoryEngine` is the always-on
//! process-local backend; `RemoteEngine` adapts an external
//! Redis-style client; `CustomEngine` wraps user callbacks. Grounded
//! on `cachelito-core`'s `DashMap`-backed `AsyncGlobalCache` for the
//! concurrent-map storage choice and on
//! `other_examples/e0774502_Goatherd0072-mirror-cache__src-cache.rs.rs`'s
//! `CachePolicy` async trait for the trait-object backend shape.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::EngineError;
use crate::record::Flavor;

/// Identifies a record for an engine operation.
#[derive(Clone, Debug)]
pub struct EngineKey {
    pub client_id: Arc<str>,
    pub flavor: Flavor,
    pub scope: String,
    pub key: String,
}

impl EngineKey {
    /// `cachify:<clientId>:<flavor>:<scope>:<key>`, the remote key
    /// schema from `spec.md` §6.
    pub fn remote_key(&self) -> String {
        format!(
            "cachify:{}:{}:{}:{}",
            self.client_id,
            self.flavor.as_str(),
            self.scope,
            self.key
        )
    }
}

/// A named storage backend. All operations fail with `EngineError`;
/// `read` returning `Ok(None)` means "no value", not an error.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;
    async fn set(&self, ctx: &EngineKey, value: Vec<u8>) -> Result<(), EngineError>;
    async fn read(&self, ctx: &EngineKey) -> Result<Option<Vec<u8>>, EngineError>;
    /// Returns whether the key existed prior to removal.
    async fn remove(&self, ctx: &EngineKey) -> Result<bool, EngineError>;
    async fn clear(&self, scope: Option<&str>, flavor: Option<Flavor>) -> Result<(), EngineError>;
}

/// Process-local in-memory engine. Always registered under `"memory"`.
pub struct MemoryEngine {
    store: DashMap<(Flavor, String, String), Vec<u8>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self { store: DashMap::new() }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn set(&self, ctx: &EngineKey, value: Vec<u8>) -> Result<(), EngineError> {
        self.store
            .insert((ctx.flavor, ctx.scope.clone(), ctx.key.clone()), value);
        Ok(())
    }

    async fn read(&self, ctx: &EngineKey) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self
            .store
            .get(&(ctx.flavor, ctx.scope.clone(), ctx.key.clone()))
            .map(|v| v.clone()))
    }

    async fn remove(&self, ctx: &EngineKey) -> Result<bool, EngineError> {
        Ok(self
            .store
            .remove(&(ctx.flavor, ctx.scope.clone(), ctx.key.clone()))
            .is_some())
    }

    async fn clear(&self, scope: Option<&str>, flavor: Option<Flavor>) -> Result<(), EngineError> {
        self.store.retain(|(f, s, _), _| {
            let flavor_match = flavor.map(|wanted| *f == wanted).unwrap_or(true);
            let scope_match = scope.map(|wanted| s == wanted).unwrap_or(true);
            !(flavor_match && scope_match)
        });
        Ok(())
    }
}

/// External collaborator contract for a Redis-style remote store.
/// Cachify does not implement a concrete client; callers supply one
/// via [`EngineRegistry::use_redis`].
#[async_trait]
pub trait RemoteStoreClient: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), EngineError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;
    async fn del(&self, key: &str) -> Result<bool, EngineError>;
    /// Removes every key matching `prefix*`.
    async fn clear_prefix(&self, prefix: &str) -> Result<(), EngineError>;
}

/// Adapts a [`RemoteStoreClient`] into an [`Engine`], namespacing keys
/// per `spec.md` §4.1 / §6.
pub struct RemoteEngine {
    name: String,
    client_id: Arc<str>,
    client: Arc<dyn RemoteStoreClient>,
}

impl RemoteEngine {
    pub fn new(name: impl Into<String>, client_id: Arc<str>, client: Arc<dyn RemoteStoreClient>) -> Self {
        Self { name: name.into(), client_id, client }
    }
}

#[async_trait]
impl Engine for RemoteEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, ctx: &EngineKey, value: Vec<u8>) -> Result<(), EngineError> {
        self.client.set(&ctx.remote_key(), value).await
    }

    async fn read(&self, ctx: &EngineKey) -> Result<Option<Vec<u8>>, EngineError> {
        self.client.get(&ctx.remote_key()).await
    }

    async fn remove(&self, ctx: &EngineKey) -> Result<bool, EngineError> {
        self.client.del(&ctx.remote_key()).await
    }

    async fn clear(&self, scope: Option<&str>, flavor: Option<Flavor>) -> Result<(), EngineError> {
        let prefix = match (flavor, scope) {
            (Some(f), Some(s)) => format!("cachify:{}:{}:{}:", self.client_id, f.as_str(), s),
            (Some(f), None) => format!("cachify:{}:{}:", self.client_id, f.as_str()),
            _ => format!("cachify:{}:", self.client_id),
        };
        self.client.clear_prefix(&prefix).await
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed-callback handlers for a user-defined engine.
pub struct EngineHandlers {
    pub set: Arc<dyn Fn(EngineKey, Vec<u8>) -> BoxFut<'static, Result<(), EngineError>> + Send + Sync>,
    pub read: Arc<dyn Fn(EngineKey) -> BoxFut<'static, Result<Option<Vec<u8>>, EngineError>> + Send + Sync>,
    pub remove: Arc<dyn Fn(EngineKey) -> BoxFut<'static, Result<bool, EngineError>> + Send + Sync>,
    pub clear: Arc<
        dyn Fn(Option<String>, Option<Flavor>) -> BoxFut<'static, Result<(), EngineError>> + Send + Sync,
    >,
}

pub struct CustomEngine {
    name: String,
    handlers: EngineHandlers,
}

impl CustomEngine {
    pub fn new(name: impl Into<String>, handlers: EngineHandlers) -> Self {
        Self { name: name.into(), handlers }
    }
}

#[async_trait]
impl Engine for CustomEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, ctx: &EngineKey, value: Vec<u8>) -> Result<(), EngineError> {
        (self.handlers.set)(ctx.clone(), value).await
    }

    async fn read(&self, ctx: &EngineKey) -> Result<Option<Vec<u8>>, EngineError> {
        (self.handlers.read)(ctx.clone()).await
    }

    async fn remove(&self, ctx: &EngineKey) -> Result<bool, EngineError> {
        (self.handlers.remove)(ctx.clone()).await
    }

    async fn clear(&self, scope: Option<&str>, flavor: Option<Flavor>) -> Result<(), EngineError> {
        (self.handlers.clear)(scope.map(String::from), flavor).await
    }
}

/// Named lookup table of engines, one per [`crate::client::Client`].
pub struct EngineRegistry {
    client_id: Arc<str>,
    engines: DashMap<String, Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new(client_id: Arc<str>) -> Self {
        let registry = Self { client_id, engines: DashMap::new() };
        registry
            .engines
            .insert("memory".to_string(), Arc::new(MemoryEngine::default()) as Arc<dyn Engine>);
        registry
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Engine>> {
        self.engines.get(name).map(|e| e.clone())
    }

    pub fn use_redis(&self, name: impl Into<String>, client: Arc<dyn RemoteStoreClient>) {
        let name = name.into();
        self.engines.insert(
            name.clone(),
            Arc::new(RemoteEngine::new(name, self.client_id.clone(), client)) as Arc<dyn Engine>,
        );
    }

    pub fn define_engine(&self, name: impl Into<String>, handlers: EngineHandlers) {
        let name = name.into();
        self.engines.insert(name.clone(), Arc::new(CustomEngine::new(name, handlers)) as Arc<dyn Engine>);
    }

    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all(&self) -> HashMap<String, Arc<dyn Engine>> {
        self.engines.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(flavor: Flavor, scope: &str, key: &str) -> EngineKey {
        EngineKey { client_id: Arc::from("c1"), flavor, scope: scope.to_string(), key: key.to_string() }
    }

    #[tokio::test]
    async fn memory_engine_set_read_remove_roundtrip() {
        let engine = MemoryEngine::default();
        let key = ctx(Flavor::Kvs, "global", "a");
        assert_eq!(engine.read(&key).await.unwrap(), None);

        engine.set(&key, b"hello".to_vec()).await.unwrap();
        assert_eq!(engine.read(&key).await.unwrap(), Some(b"hello".to_vec()));

        assert!(engine.remove(&key).await.unwrap());
        assert_eq!(engine.read(&key).await.unwrap(), None);
        assert!(!engine.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn clear_respects_scope_and_flavor_filters() {
        let engine = MemoryEngine::default();
        engine.set(&ctx(Flavor::Kvs, "a", "k1"), b"1".to_vec()).await.unwrap();
        engine.set(&ctx(Flavor::Kvs, "b", "k2"), b"2".to_vec()).await.unwrap();
        engine.set(&ctx(Flavor::Files, "a", "k3"), b"3".to_vec()).await.unwrap();

        engine.clear(Some("a"), None).await.unwrap();
        assert_eq!(engine.read(&ctx(Flavor::Kvs, "a", "k1")).await.unwrap(), None);
        assert_eq!(engine.read(&ctx(Flavor::Files, "a", "k3")).await.unwrap(), None);
        assert!(engine.read(&ctx(Flavor::Kvs, "b", "k2")).await.unwrap().is_some());

        engine.clear(None, None).await.unwrap();
        assert_eq!(engine.read(&ctx(Flavor::Kvs, "b", "k2")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn registry_always_has_a_memory_engine() {
        let registry = EngineRegistry::new(Arc::from("c1"));
        assert!(registry.get("memory").is_some());
        assert_eq!(registry.names(), vec!["memory".to_string()]);
    }
}
