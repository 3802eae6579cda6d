//! Keys live in one of two key spaces per vBucket (committed, prepared).
//! A key additionally carries a variable-length collection id prefix, so
//! the same raw bytes in two collections are different keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a collection within a vBucket's keyspace. `0` is the default
/// (unnamed) collection every bucket has implicitly.
pub type CollectionId = u32;

/// A fully-qualified key: a collection id plus the caller-supplied bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    collection: CollectionId,
    bytes: Vec<u8>,
}

impl Key {
    pub fn new(collection: CollectionId, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            collection,
            bytes: bytes.into(),
        }
    }

    /// Convenience constructor for the default collection, used pervasively
    /// in tests and in examples that don't exercise collections.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(0, bytes)
    }

    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.collection,
            String::from_utf8_lossy(&self.bytes)
        )
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::from_bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::from_bytes(s.into_bytes())
    }
}

/// Which key space an operation addresses. The same `Key` may have at most
/// one live entry in each space at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    Committed,
    Prepared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_different_collection_are_different_keys() {
        let a = Key::new(0, b"k".to_vec());
        let b = Key::new(1, b"k".to_vec());
        assert_ne!(a, b);
    }

    #[test]
    fn display_is_human_readable() {
        let k = Key::from_bytes(b"hello".to_vec());
        assert_eq!(format!("{k}"), "0:hello");
    }
}
