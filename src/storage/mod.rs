//! Durable buffer for captured events and checkpoint records.
//!
//! The pipeline only needs a handful of bucket-scoped operations: keyed
//! overwrite for the checkpoint, sequenced append for row events, point
//! reads and deletes for downstream drain. Every method is a single store
//! transaction.

pub mod memory;
pub mod redb_store;

pub use memory::MemoryBuffer;
pub use redb_store::RedbBuffer;

use crate::Result;

/// A bucket-namespaced key-value store.
///
/// Implementations must be safe to share between tasks; each task confines
/// itself to its own buckets so no locking is required on the caller's side.
pub trait DurableBuffer: Send + Sync {
    /// Creates every named bucket that does not exist yet.
    fn create_buckets_if_absent(&self, buckets: &[&str]) -> Result<()>;

    /// Writes `value` under `key`, replacing any previous value.
    fn put_keyed(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Appends `value` under the bucket's next sequence number and returns it.
    fn put_sequenced(&self, bucket: &str, value: &[u8]) -> Result<u64>;

    /// Appends all `values` in one transaction, in order.
    ///
    /// Either every value is stored or none is.
    fn put_sequenced_batch(&self, bucket: &str, values: &[Vec<u8>]) -> Result<Vec<u64>>;

    fn get_keyed(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete_keyed(&self, bucket: &str, key: &[u8]) -> Result<()>;

    /// Number of entries currently in the bucket.
    fn size(&self, bucket: &str) -> Result<usize>;

    /// Up to `limit` entries from the start of the bucket, in key order.
    fn scan(&self, bucket: &str, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Encodes a sequence number so that byte order matches numeric order.
pub fn sequence_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

/// Decodes a key produced by [`sequence_key`]. Returns `None` for keys of any
/// other length.
pub fn parse_sequence_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
