//! redb-backed durable buffer.
//!
//! Each bucket is a redb table with byte keys and byte values. Sequence
//! counters live in a separate table so a sequence number is never handed
//! out twice, even after the entry it named has been deleted.

use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError, TableHandle,
    WriteTransaction,
};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{sequence_key, DurableBuffer};
use crate::{Error, Result};

/// Per-bucket sequence counters (key: bucket name, value: last assigned).
const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("__sequences");

fn bucket_table(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// File-backed [`DurableBuffer`].
///
/// Cloning is cheap; clones share the same database handle.
#[derive(Clone)]
pub struct RedbBuffer {
    db: Arc<Database>,
}

impl RedbBuffer {
    /// Opens (or creates) the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(Error::storage)?;

        let write_txn = db.begin_write().map_err(Error::storage)?;
        {
            write_txn.open_table(SEQUENCES_TABLE).map_err(Error::storage)?;
        }
        write_txn.commit().map_err(Error::storage)?;

        info!(path = %path.display(), "Opened redb buffer");

        Ok(Self { db: Arc::new(db) })
    }

    /// Write transactions create tables on open; check first so a typo in a
    /// bucket name surfaces as an error instead of a new bucket.
    fn ensure_bucket(&self, txn: &WriteTransaction, bucket: &str) -> Result<()> {
        let exists = txn
            .list_tables()
            .map_err(Error::storage)?
            .any(|handle| handle.name() == bucket);
        if exists {
            Ok(())
        } else {
            Err(Error::BucketNotFound(bucket.to_string()))
        }
    }

    /// Appends `values` and returns the range of sequence numbers assigned.
    fn append_in(
        &self,
        txn: &WriteTransaction,
        bucket: &str,
        values: &[&[u8]],
    ) -> Result<RangeInclusive<u64>> {
        let mut sequences = txn.open_table(SEQUENCES_TABLE).map_err(Error::storage)?;
        let mut table = txn.open_table(bucket_table(bucket)).map_err(Error::storage)?;

        let mut last = sequences
            .get(bucket)
            .map_err(Error::storage)?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let first = last + 1;

        for value in values {
            last += 1;
            table
                .insert(sequence_key(last).as_slice(), *value)
                .map_err(Error::storage)?;
        }
        sequences.insert(bucket, last).map_err(Error::storage)?;

        Ok(first..=last)
    }
}

fn missing_bucket(bucket: &str) -> impl FnOnce(TableError) -> Error + '_ {
    move |err| match err {
        TableError::TableDoesNotExist(_) => Error::BucketNotFound(bucket.to_string()),
        other => Error::storage(other),
    }
}

impl DurableBuffer for RedbBuffer {
    fn create_buckets_if_absent(&self, buckets: &[&str]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(Error::storage)?;
        for bucket in buckets {
            write_txn.open_table(bucket_table(bucket)).map_err(Error::storage)?;
        }
        write_txn.commit().map_err(Error::storage)?;

        debug!(?buckets, "Buckets ready");
        Ok(())
    }

    fn put_keyed(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(Error::storage)?;
        self.ensure_bucket(&write_txn, bucket)?;
        {
            let mut table = write_txn.open_table(bucket_table(bucket)).map_err(Error::storage)?;
            table.insert(key, value).map_err(Error::storage)?;
        }
        write_txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    fn put_sequenced(&self, bucket: &str, value: &[u8]) -> Result<u64> {
        let write_txn = self.db.begin_write().map_err(Error::storage)?;
        self.ensure_bucket(&write_txn, bucket)?;
        let assigned = self.append_in(&write_txn, bucket, &[value])?;
        write_txn.commit().map_err(Error::storage)?;
        Ok(*assigned.end())
    }

    fn put_sequenced_batch(&self, bucket: &str, values: &[Vec<u8>]) -> Result<Vec<u64>> {
        let values: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();

        let write_txn = self.db.begin_write().map_err(Error::storage)?;
        self.ensure_bucket(&write_txn, bucket)?;
        let assigned = self.append_in(&write_txn, bucket, &values)?;
        write_txn.commit().map_err(Error::storage)?;
        Ok(assigned.collect())
    }

    fn get_keyed(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(Error::storage)?;
        let table = read_txn
            .open_table(bucket_table(bucket))
            .map_err(missing_bucket(bucket))?;
        let value = table
            .get(key)
            .map_err(Error::storage)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn delete_keyed(&self, bucket: &str, key: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(Error::storage)?;
        self.ensure_bucket(&write_txn, bucket)?;
        {
            let mut table = write_txn.open_table(bucket_table(bucket)).map_err(Error::storage)?;
            table.remove(key).map_err(Error::storage)?;
        }
        write_txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    fn size(&self, bucket: &str) -> Result<usize> {
        let read_txn = self.db.begin_read().map_err(Error::storage)?;
        let table = read_txn
            .open_table(bucket_table(bucket))
            .map_err(missing_bucket(bucket))?;
        let len = table.len().map_err(Error::storage)?;
        Ok(len as usize)
    }

    fn scan(&self, bucket: &str, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read().map_err(Error::storage)?;
        let table = read_txn
            .open_table(bucket_table(bucket))
            .map_err(missing_bucket(bucket))?;

        let mut entries = Vec::new();
        for item in table.iter().map_err(Error::storage)?.take(limit) {
            let (key, value) = item.map_err(Error::storage)?;
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }
}
