//! Error taxonomy for Cachify.
//!
//! Every fallible public operation returns a [`CachifyError`]. The
//! variants mirror the error kinds in the specification: validation
//! failures never mutate state, engine/transport failures are
//! surfaced after best-effort compensation, and session errors are
//! recoverable by the caller (retry, wait, or pick a different key
//! set).

use thiserror::Error;

/// Errors returned by engine implementations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine's underlying transport failed (network, I/O, etc).
    #[error("engine transport error: {0}")]
    Transport(String),
    /// The engine does not have a value for this key. Not treated as
    /// an error by callers — managers translate this into `Ok(None)`.
    #[error("missing")]
    Missing,
    /// The named engine is not registered.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the lock session manager.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("record not owned by this session")]
    NotOwned,
    #[error("record is locked by another session")]
    Locked,
    #[error("lock acquisition timed out")]
    AcquireTimeout,
    #[error("session already holds this record")]
    AlreadyHeld,
}

/// Errors returned by the priority task queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task id already queued: {0}")]
    DuplicateId(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

/// The top-level error type returned by KVS/file manager operations.
#[derive(Debug, Error)]
pub enum CachifyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("read failed: {failed} of {attempted} engines reported a transport error")]
    Read { attempted: usize, failed: usize },
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("restore frame error: {0}")]
    Restore(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CachifyError>;
