//! The error taxonomy of the durable write pipeline.
//!
//! Admission and key-state errors are returned synchronously to the caller.
//! Durability outcomes (`SyncWriteAmbiguous`, `SyncWriteTimedOut`) are never
//! returned from a call that created a Prepare -- they are delivered later
//! through the parked cookie. They still live in this enum because the
//! DurabilityMonitor and the cookie notification path share it.

use thiserror::Error;

/// Every error the core can produce, grouped by the subsystem that raises it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EpError {
    // --- Admission ---
    #[error("not my vbucket")]
    NotMyVBucket,
    #[error("no such bucket")]
    NoBucket,
    #[error("access denied")]
    AccessDenied,
    #[error("durability impossible for the current topology")]
    DurabilityImpossible,
    #[error("durability level invalid for this bucket type")]
    DurabilityInvalidLevel,
    #[error("request too large")]
    E2Big,
    #[error("invalid argument")]
    EInval,

    // --- Concurrency ---
    #[error("a sync write is already in progress for this key")]
    SyncWriteInProgress,
    #[error("a sync write is pending for this key")]
    SyncWritePending,
    #[error("a sync write re-commit is already in progress for this key")]
    SyncWriteReCommitInProgress,
    #[error("temporary failure, retry the request")]
    TemporaryFailure,
    #[error("would block")]
    WouldBlock,

    // --- Key-state ---
    #[error("key not found")]
    KeyNotFound,
    #[error("key already exists")]
    KeyExists,
    #[error("key is locked")]
    Locked,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("not stored")]
    NotStored,

    // --- Durability outcomes (delivered asynchronously) ---
    #[error("sync write ambiguous")]
    SyncWriteAmbiguous,
    #[error("sync write timed out")]
    SyncWriteTimedOut,
    #[error("request cancelled")]
    Cancelled,

    // --- Resource ---
    #[error("out of memory")]
    NoMemory,
    #[error("server busy")]
    Busy,
    #[error("temporary failure (watermark exceeded)")]
    Etmpfail,

    // --- Collections ---
    #[error("unknown collection")]
    UnknownCollection,
    #[error("unknown scope")]
    UnknownScope,

    // --- Integrity ---
    #[error("invalid xattr payload")]
    XattrEInval,

    // --- Storage (KVStore facade failures surfaced to the core) ---
    #[error("storage error: {0}")]
    Storage(String),

    // --- Not supported (DCP commands that combine with out-of-order
    // execution in a way this core does not attempt to give meaning to) ---
    #[error("operation not supported in this combination")]
    NotSupported,
}

pub type EpResult<T> = Result<T, EpError>;
