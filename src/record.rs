//! Record model shared by both cache flavors (C3).
//!
//! Mirrors `cachelito_core::CacheEntry`'s timestamp/frequency
//! bookkeeping, generalized from "one value, one cache" to "one
//! record, many engines".

use std::path::PathBuf;
use std::time::{Instant, SystemTime};

/// The record family. Namespacing only — `kvs` and `files` records
/// never share a key space even under the same scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flavor {
    Kvs,
    Files,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Kvs => "kvs",
            Flavor::Files => "files",
        }
    }
}

/// What happens to a record when its TTL fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlPolicy {
    /// Remove the whole record across all engines.
    Evict,
    /// Files only: drop cached content, keep the metadata record.
    Keep,
}

#[derive(Clone, Copy, Debug)]
pub struct Ttl {
    pub value_ms: u64,
    pub policy: TtlPolicy,
}

/// Opaque handle into the file content store. Breaks the
/// manager/record/content-store reference cycle named in `spec.md`
/// §9: records hold a plain index, the content store owns the bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentRef(pub u64);

/// Default scope name used when the caller does not specify one.
pub const DEFAULT_SCOPE: &str = "global";

/// Metadata shared by KVS and file records. (I1, I2, I5)
#[derive(Clone, Debug)]
pub struct RecordMeta {
    pub key: String,
    pub scope: String,
    pub engines: Vec<String>,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub ttl: Option<Ttl>,
    pub size: u64,
}

impl RecordMeta {
    pub fn new(key: String, scope: String, engines: Vec<String>, ttl: Option<Ttl>, size: u64) -> Self {
        let now = Instant::now();
        Self {
            key,
            scope,
            engines,
            created_at: now,
            last_accessed_at: now,
            ttl,
            size,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Instant::now();
    }
}

/// File-only fields layered on top of [`RecordMeta`]. (I3, I4)
#[derive(Clone, Debug)]
pub struct FileFields {
    pub path: PathBuf,
    pub name: String,
    pub mtime: SystemTime,
    pub size_on_disk: u64,
    /// `None` iff the content is not currently resident (I3).
    pub content_ref: Option<ContentRef>,
}

impl FileFields {
    pub fn is_cached(&self) -> bool {
        self.content_ref.is_some()
    }
}

/// A complete file record as returned by `inspect`.
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub meta: RecordMeta,
    pub file: FileFields,
}

/// Derives a file record's identity key from its canonical path.
/// `key == base64(canonical_path)`; `key` and `filePath` are
/// interchangeable inputs per `spec.md` §4.3.
pub fn key_for_path(path: &std::path::Path) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(path.to_string_lossy().as_bytes())
}
