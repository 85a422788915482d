//! In-memory durable buffer for tests and tooling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{sequence_key, DurableBuffer};
use crate::{Error, Result};

#[derive(Default)]
struct Bucket {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    last_sequence: u64,
}

/// A [`DurableBuffer`] that keeps everything in a process-local map.
///
/// Semantics match [`RedbBuffer`](super::RedbBuffer): buckets must be created
/// before use and sequence numbers are never reused.
#[derive(Default)]
pub struct MemoryBuffer {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bucket<T>(&self, bucket: &str, f: impl FnOnce(&mut Bucket) -> T) -> Result<T> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))?;
        Ok(f(entry))
    }
}

impl DurableBuffer for MemoryBuffer {
    fn create_buckets_if_absent(&self, buckets: &[&str]) -> Result<()> {
        let mut map = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for bucket in buckets {
            map.entry(bucket.to_string()).or_default();
        }
        Ok(())
    }

    fn put_keyed(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_bucket(bucket, |b| {
            b.entries.insert(key.to_vec(), value.to_vec());
        })
    }

    fn put_sequenced(&self, bucket: &str, value: &[u8]) -> Result<u64> {
        self.with_bucket(bucket, |b| {
            b.last_sequence += 1;
            b.entries
                .insert(sequence_key(b.last_sequence).to_vec(), value.to_vec());
            b.last_sequence
        })
    }

    fn put_sequenced_batch(&self, bucket: &str, values: &[Vec<u8>]) -> Result<Vec<u64>> {
        self.with_bucket(bucket, |b| {
            values
                .iter()
                .map(|value| {
                    b.last_sequence += 1;
                    b.entries
                        .insert(sequence_key(b.last_sequence).to_vec(), value.clone());
                    b.last_sequence
                })
                .collect()
        })
    }

    fn get_keyed(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_bucket(bucket, |b| b.entries.get(key).cloned())
    }

    fn delete_keyed(&self, bucket: &str, key: &[u8]) -> Result<()> {
        self.with_bucket(bucket, |b| {
            b.entries.remove(key);
        })
    }

    fn size(&self, bucket: &str) -> Result<usize> {
        self.with_bucket(bucket, |b| b.entries.len())
    }

    fn scan(&self, bucket: &str, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_bucket(bucket, |b| {
            b.entries
                .iter()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_buffer_matches_store_semantics() {
        let buffer = MemoryBuffer::new();
        assert!(matches!(buffer.size("rows"), Err(Error::BucketNotFound(_))));

        buffer.create_buckets_if_absent(&["rows", "rows"]).unwrap();
        assert_eq!(
            buffer
                .put_sequenced_batch("rows", &[b"a".to_vec(), b"b".to_vec()])
                .unwrap(),
            vec![1, 2]
        );

        buffer.delete_keyed("rows", &sequence_key(2)).unwrap();
        assert_eq!(buffer.put_sequenced("rows", b"c").unwrap(), 3);
        assert_eq!(buffer.size("rows").unwrap(), 2);
    }
}
