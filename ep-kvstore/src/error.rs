use ep_types::EpError;
use thiserror::Error;

/// KVStore-internal failures, kept separate from [`EpError`] so storage
/// detail (a RocksDB status code, a corrupt record) doesn't leak into the
/// VBucket API -- callers convert with `From` at the boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("vbucket {0} not open")]
    VBucketNotOpen(ep_types::VBucketId),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<StorageError> for EpError {
    fn from(e: StorageError) -> Self {
        EpError::Storage(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
