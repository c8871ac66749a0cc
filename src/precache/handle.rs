//! Per-entry handle: the `data`/`metadata`/`checksums` triple for one
//! tracked remote object plus its in-memory contention counter (§3, §4.2
//! Contention). Grounded in `irobot/precache/_do.py::DataObject` and the
//! tracked-state base it extends in `irobot/precache/_entity.py`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::common::{ByteRange, DataType, Metadata, Status};
use crate::errors::{GatewayError, Result};
use crate::remote::RemoteStore;
use crate::tracking::TrackingStore;
use crate::{checksum, precache::dir};

/// Decrements the entry's contention counter when dropped, so a handler
/// that bails out early (error, client disconnect) can't leak a hold.
pub struct ContentionGuard {
    counter: Arc<AtomicI64>,
}

impl Drop for ContentionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DataObject {
    pub id: i64,
    pub irods_path: String,
    pub precache_dir: PathBuf,
    pub(crate) store: Arc<TrackingStore>,
    pub(crate) contention: Arc<AtomicI64>,
}

impl DataObject {
    pub fn data_path(&self) -> PathBuf {
        self.precache_dir.join(DataType::Data.file_name())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.precache_dir.join(DataType::Metadata.file_name())
    }

    pub fn checksums_path(&self) -> PathBuf {
        checksum::checksums_path(&self.precache_dir)
    }

    pub async fn status(&self, datatype: DataType) -> Result<Option<Status>> {
        Ok(self.store.get_current_status(self.id, datatype).await?.map(|c| c.status))
    }

    pub async fn size(&self, datatype: DataType) -> Result<Option<u64>> {
        Ok(self.store.get_size(self.id, datatype).await?)
    }

    /// Parsed metadata document, once its datatype is `ready`.
    pub async fn metadata(&self) -> Result<Metadata> {
        let text = tokio::fs::read_to_string(self.metadata_path())
            .await
            .map_err(|_| GatewayError::NotFound(format!("metadata unavailable for {}", self.irods_path)))?;
        serde_json::from_str(&text)
            .map_err(|e| GatewayError::Internal(format!("corrupt metadata for {}: {e}", self.irods_path)))
    }

    pub async fn checksums(&self, chunk_size: u64, range: Option<ByteRange>) -> Result<Vec<ByteRange>> {
        checksum::blocks(&self.precache_dir, chunk_size, range).await
    }

    pub async fn update_last_access(&self) -> Result<()> {
        Ok(self.store.touch_last_access(self.id).await?)
    }

    /// Register interest in this entry for the lifetime of the returned
    /// guard (§4.2: an entry with non-zero contention is never evicted or
    /// deleted out from under an in-flight request).
    pub fn begin_access(&self) -> ContentionGuard {
        self.contention.fetch_add(1, Ordering::SeqCst);
        ContentionGuard { counter: self.contention.clone() }
    }

    pub fn contention_count(&self) -> i64 {
        self.contention.load(Ordering::SeqCst)
    }

    /// Compare the remote's current metadata against ours; `true` means the
    /// remote object has changed since it was last fetched (§4.2 Refetch).
    pub async fn refetch_metadata(&self, remote: &dyn RemoteStore) -> Result<bool> {
        let current = self.metadata().await?;
        let fresh = remote.metadata(&self.irods_path).await?;
        Ok(current.differs_from(&fresh))
    }

    /// Tear the entry down: refuses while anything still holds it open.
    pub async fn delete(&self) -> Result<()> {
        if self.contention_count() > 0 {
            return Err(GatewayError::Conflict(format!(
                "{} is in use and cannot be deleted",
                self.irods_path
            )));
        }
        self.store.delete(self.id).await?;
        dir::delete_precache_dir(&self.precache_dir).await?;
        Ok(())
    }
}
