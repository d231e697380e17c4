//! Typed façade over the key-value store.
//!
//! Durable state lives in two buckets, both keyed by the big-endian
//! inumber: `inode` holds JSON [`InodeRecord`]s, `content` holds raw
//! blobs (file bytes or a serialized entry list). The gateway owns the
//! database handle for the process lifetime and scopes one store
//! transaction per call.

use std::path::Path;
use std::sync::Arc;

use jammdb::DB;
use thiserror::Error;

use crate::models::InodeRecord;

const INODE_BUCKET: &str = "inode";
const CONTENT_BUCKET: &str = "content";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("inode {0} not found")]
    NotFound(u64),
    #[error("store backend failure for inode {inumber}")]
    Backend {
        inumber: u64,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Db(#[from] jammdb::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(inumber: u64, source: impl Into<BackendError>) -> Self {
        StoreError::Backend {
            inumber,
            source: source.into(),
        }
    }
}

#[derive(Clone)]
pub struct StoreGateway {
    db: Arc<DB>,
}

impl StoreGateway {
    /// Open the store file and make sure both buckets exist.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = DB::open(path).map_err(|e| StoreError::backend(0, e))?;
        let tx = db.tx(true).map_err(|e| StoreError::backend(0, e))?;
        tx.get_or_create_bucket(INODE_BUCKET)
            .map_err(|e| StoreError::backend(0, e))?;
        tx.get_or_create_bucket(CONTENT_BUCKET)
            .map_err(|e| StoreError::backend(0, e))?;
        tx.commit().map_err(|e| StoreError::backend(0, e))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Fetch an inode record by inumber.
    pub fn get_inode(&self, inumber: u64) -> StoreResult<InodeRecord> {
        let tx = self
            .db
            .tx(false)
            .map_err(|e| StoreError::backend(inumber, e))?;
        let bucket = tx
            .get_bucket(INODE_BUCKET)
            .map_err(|e| StoreError::backend(inumber, e))?;
        let kv = bucket
            .get_kv(inumber.to_be_bytes())
            .ok_or(StoreError::NotFound(inumber))?;
        serde_json::from_slice(kv.value()).map_err(|e| StoreError::backend(inumber, e))
    }

    /// Write an inode record, replacing any previous row.
    pub fn upsert_inode(&self, rec: &InodeRecord) -> StoreResult<()> {
        let value =
            serde_json::to_vec(rec).map_err(|e| StoreError::backend(rec.inumber, e))?;
        let tx = self
            .db
            .tx(true)
            .map_err(|e| StoreError::backend(rec.inumber, e))?;
        let bucket = tx
            .get_bucket(INODE_BUCKET)
            .map_err(|e| StoreError::backend(rec.inumber, e))?;
        bucket
            .put(rec.inumber.to_be_bytes(), value)
            .map_err(|e| StoreError::backend(rec.inumber, e))?;
        tx.commit().map_err(|e| StoreError::backend(rec.inumber, e))
    }

    /// Remove an inode row and its blob row. Missing rows are ignored so
    /// the call is idempotent.
    pub fn delete_inode(&self, inumber: u64) -> StoreResult<()> {
        let tx = self
            .db
            .tx(true)
            .map_err(|e| StoreError::backend(inumber, e))?;
        for name in [INODE_BUCKET, CONTENT_BUCKET] {
            let bucket = tx
                .get_bucket(name)
                .map_err(|e| StoreError::backend(inumber, e))?;
            match bucket.delete(inumber.to_be_bytes()) {
                Ok(_) => {}
                Err(jammdb::Error::KeyValueMissing) => {}
                Err(e) => return Err(StoreError::backend(inumber, e)),
            }
        }
        tx.commit().map_err(|e| StoreError::backend(inumber, e))
    }

    /// Fetch a blob by inumber. An absent row reads as empty bytes, which
    /// is what new files look like before their first write.
    pub fn get_blob(&self, inumber: u64) -> StoreResult<Vec<u8>> {
        let tx = self
            .db
            .tx(false)
            .map_err(|e| StoreError::backend(inumber, e))?;
        let bucket = tx
            .get_bucket(CONTENT_BUCKET)
            .map_err(|e| StoreError::backend(inumber, e))?;
        Ok(bucket
            .get_kv(inumber.to_be_bytes())
            .map(|kv| kv.value().to_vec())
            .unwrap_or_default())
    }

    /// Write a blob, replacing any previous row.
    pub fn upsert_blob(&self, inumber: u64, bytes: &[u8]) -> StoreResult<()> {
        let tx = self
            .db
            .tx(true)
            .map_err(|e| StoreError::backend(inumber, e))?;
        let bucket = tx
            .get_bucket(CONTENT_BUCKET)
            .map_err(|e| StoreError::backend(inumber, e))?;
        bucket
            .put(inumber.to_be_bytes(), bytes.to_vec())
            .map_err(|e| StoreError::backend(inumber, e))?;
        tx.commit().map_err(|e| StoreError::backend(inumber, e))
    }

    /// Next free inumber: one past the highest present, or 1 on an empty
    /// store. Allocation never hands out the same number twice while the
    /// holder exists.
    pub fn next_inumber(&self) -> StoreResult<u64> {
        let tx = self.db.tx(false).map_err(|e| StoreError::backend(0, e))?;
        let bucket = tx
            .get_bucket(INODE_BUCKET)
            .map_err(|e| StoreError::backend(0, e))?;
        let max = bucket
            .kv_pairs()
            .filter_map(|kv| <[u8; 8]>::try_from(kv.key()).ok())
            .map(u64::from_be_bytes)
            .max();
        Ok(max.map_or(1, |m| m + 1))
    }

    /// Total bytes accounted to inodes. Errors are swallowed to zero so
    /// statfs keeps answering even when the store is unhappy.
    pub fn space_used(&self) -> u64 {
        let Ok(tx) = self.db.tx(false) else {
            return 0;
        };
        let Ok(bucket) = tx.get_bucket(INODE_BUCKET) else {
            return 0;
        };
        bucket
            .kv_pairs()
            .filter_map(|kv| serde_json::from_slice::<InodeRecord>(kv.value()).ok())
            .map(|rec| rec.size)
            .sum()
    }
}
