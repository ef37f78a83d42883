//! Cachify is an in-process caching engine with two record flavors —
//! a key-value store and a file cache — layered over pluggable
//! storage engines, with TTL and size-bounded LRU eviction, file
//! lifecycle tracking, per-record lock sessions, and a streaming
//! encrypted backup pipeline.
//!
//! ```no_run
//! use cachify::client::{default_client};
//! # async fn example() -> cachify::error::Result<()> {
//! let client = default_client();
//! client.kvs.set("user:1", &"ahmad", Default::default()).await?;
//! let value: Option<String> = client.kvs.read("user:1", None).await?;
//! assert_eq!(value.as_deref(), Some("ahmad"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod events;
pub mod eviction;
pub mod files;
pub mod kvs;
pub mod lock;
pub mod persistence;
pub mod queue;
pub mod record;
pub mod tracker;

pub use client::{create_client, default_client, Client, ClientConfig};
pub use error::{CachifyError, EngineError, Result, SessionError};

/// Initializes a `tracing` subscriber from `CACHIFY_DEBUG`
/// (`true`/`false`) if one is not already installed. Purely a
/// diagnostics convenience for embedders who don't configure their
/// own subscriber; never required for correctness.
pub fn init_tracing_from_env() {
    use tracing_subscriber::EnvFilter;

    let debug = std::env::var("CACHIFY_DEBUG").map(|v| v == "true").unwrap_or(false);
    let filter = if debug {
        EnvFilter::new("cachify=debug")
    } else {
        EnvFilter::new("cachify=warn")
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
