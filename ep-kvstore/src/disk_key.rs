//! On-disk key encoding: `disk_key = [prepared_flag_byte || raw_key]` so
//! the committed and prepared key spaces coexist without a
//! second column family. We additionally fold the collection id into the
//! encoding (the data model's `Key` already carries it) and the vbucket id,
//! so a single RocksDB column family can hold every vbucket's records while
//! still supporting efficient per-vbucket range scans (a vbid prefix sorts
//! together).

use ep_types::{CollectionId, Key, KeySpace, VBucketId};

const PREPARED_FLAG: u8 = 1;
const COMMITTED_FLAG: u8 = 0;

/// The fully-encoded RocksDB key for one record: `vbid || keyspace_flag ||
/// collection || raw key bytes`. Big-endian integers throughout so
/// lexicographic byte order matches numeric order (needed for range scans).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiskKey(Vec<u8>);

impl DiskKey {
    pub fn encode(vbid: VBucketId, space: KeySpace, key: &Key) -> Self {
        let mut buf = Vec::with_capacity(2 + 1 + 4 + key.bytes().len());
        buf.extend_from_slice(&vbid.to_be_bytes());
        buf.push(match space {
            KeySpace::Committed => COMMITTED_FLAG,
            KeySpace::Prepared => PREPARED_FLAG,
        });
        buf.extend_from_slice(&key.collection().to_be_bytes());
        buf.extend_from_slice(key.bytes());
        DiskKey(buf)
    }

    /// Prefix covering every record belonging to `vbid`, for range scans and
    /// for `compact`/`rollback` to iterate one vbucket's records.
    pub fn vbucket_prefix(vbid: VBucketId) -> Vec<u8> {
        vbid.to_be_bytes().to_vec()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn decode(bytes: &[u8]) -> Option<(VBucketId, KeySpace, CollectionId, Vec<u8>)> {
        if bytes.len() < 7 {
            return None;
        }
        let vbid = u16::from_be_bytes([bytes[0], bytes[1]]);
        let space = match bytes[2] {
            COMMITTED_FLAG => KeySpace::Committed,
            PREPARED_FLAG => KeySpace::Prepared,
            _ => return None,
        };
        let collection = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        let key_bytes = bytes[7..].to_vec();
        Some((vbid, space, collection, key_bytes))
    }
}

/// Key for the `by_seqno` index: `vbid || seqno` (big-endian), pointing at a
/// [`DiskKey`] so compaction, rollback and backfill scans can walk records in
/// seqno order within a vbucket.
pub fn seqno_index_key(vbid: VBucketId, seqno: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.extend_from_slice(&vbid.to_be_bytes());
    buf.extend_from_slice(&seqno.to_be_bytes());
    buf
}

pub fn seqno_index_prefix(vbid: VBucketId) -> Vec<u8> {
    vbid.to_be_bytes().to_vec()
}
