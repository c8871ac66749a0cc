//! # Precache Manager
//!
//! Orchestrates admission, eviction, expiry and refetch for the precache
//! as a whole (§4.2). Grounded in `irobot/precache/precache.py::Precache`;
//! live handles and background jobs are tracked in a `DashMap`, with
//! `tokio::spawn` driving each fetch/checksum job to completion.

pub mod dir;
pub mod handle;

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::checksum;
use crate::common::{ByteRange, DataType, Metadata, Process, Status};
use crate::config::{PrecacheConfig, SizeLimit};
use crate::errors::{GatewayError, Result};
use crate::remote::RemoteStore;
use crate::tracking::{TrackingError, TrackingStore};
use handle::DataObject;

/// What `resolve` found for a requested path (§4.2 Admission).
pub enum Resolution {
    Ready(Arc<DataObject>),
    InProgress { eta_seconds: Option<f64> },
}

pub struct PrecacheManager {
    store: Arc<TrackingStore>,
    remote: Arc<dyn RemoteStore>,
    config: PrecacheConfig,
    handles: DashMap<i64, Arc<DataObject>>,
    contention: DashMap<i64, Arc<AtomicI64>>,
}

impl PrecacheManager {
    pub async fn new(
        store: Arc<TrackingStore>,
        remote: Arc<dyn RemoteStore>,
        config: PrecacheConfig,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.location)?;

        let inconsistent = store.reset_inconsistent_on_open().await?;
        for entry in &inconsistent {
            tracing::warn!(id = entry.id, path = %entry.precache_path, "found orphaned in-progress entry on startup, marked failed");
        }

        let manager = Arc::new(Self {
            store,
            remote,
            config,
            handles: DashMap::new(),
            contention: DashMap::new(),
        });

        manager.clone().spawn_expiry_sweep();
        Ok(manager)
    }

    fn contention_counter(&self, id: i64) -> Arc<AtomicI64> {
        self.contention.entry(id).or_insert_with(|| Arc::new(AtomicI64::new(0))).clone()
    }

    async fn handle_for(&self, id: i64, irods_path: &str) -> Result<Arc<DataObject>> {
        if let Some(existing) = self.handles.get(&id) {
            return Ok(existing.clone());
        }

        let precache_path = self
            .store
            .get_precache_path(id)
            .await?
            .ok_or_else(|| GatewayError::Internal(format!("tracked entry {id} has no precache path")))?;

        let handle = Arc::new(DataObject {
            id,
            irods_path: irods_path.to_string(),
            precache_dir: PathBuf::from(precache_path),
            store: self.store.clone(),
            contention: self.contention_counter(id),
        });

        self.handles.insert(id, handle.clone());
        Ok(handle)
    }

    /// Resolve a canonical remote path to either a ready handle or an
    /// in-progress notice, admitting it if it isn't tracked yet (§4.2).
    pub async fn resolve(&self, canonical_path: &str) -> Result<Resolution> {
        match self.store.get_id(canonical_path).await? {
            Some(id) => self.resolve_existing(id, canonical_path).await,
            None => self.admit(canonical_path).await,
        }
    }

    async fn resolve_existing(&self, id: i64, canonical_path: &str) -> Result<Resolution> {
        let current = self.store.get_current_status(id, DataType::Data).await?;
        match current.map(|c| c.status) {
            Some(Status::Ready) => {
                let handle = self.handle_for(id, canonical_path).await?;
                Ok(Resolution::Ready(handle))
            }
            Some(Status::Requested) | Some(Status::Producing) => {
                let eta = self.eta_for_entry(id, Process::Download).await?;
                Ok(Resolution::InProgress { eta_seconds: eta })
            }
            Some(Status::Failed) => Err(GatewayError::UpstreamUnavailable(format!(
                "production previously failed for {canonical_path}"
            ))),
            None => Err(GatewayError::Internal(format!("entry {id} has no status history"))),
        }
    }

    /// Whole-object ETA from the rolling throughput average, since progress
    /// within a single transfer isn't tracked at byte granularity (§4.1
    /// `production_rates`, §8 `eta_seconds`).
    async fn eta_for_entry(&self, id: i64, process: Process) -> Result<Option<f64>> {
        let size = self.store.get_size(id, DataType::Data).await?.unwrap_or(0);
        let rates = self.store.production_rates().await?;
        Ok(rates.get(&process).and_then(|stat| stat.eta_seconds(size)))
    }

    async fn admit(&self, canonical_path: &str) -> Result<Resolution> {
        if !self.remote.check_access(canonical_path).await? {
            return Err(GatewayError::Forbidden(canonical_path.to_string()));
        }

        let metadata = self.remote.metadata(canonical_path).await?;
        let chunk_size = self.config.chunk_size;
        let metadata_size = serde_json::to_vec(&metadata).map(|v| v.len() as u64).unwrap_or(256);
        let checksums_size = checksum::checksum_index_size(metadata.size, chunk_size);
        let reservation = metadata.size + metadata_size + checksums_size;

        if let SizeLimit::Bytes(limit) = self.config.precache_size_limit() {
            self.ensure_capacity(limit, reservation).await?;
        }

        let dir = dir::new_precache_dir(&self.config.location);
        dir::create_precache_dir(&dir)?;

        let sizes = (metadata.size, metadata_size, checksums_size);
        let id = match self
            .store
            .new_request(canonical_path, &dir.to_string_lossy(), sizes)
            .await
        {
            Ok(id) => id,
            Err(TrackingError::AlreadyExists(_)) => {
                dir::delete_precache_dir(&dir).await.ok();
                return Err(GatewayError::Conflict(format!(
                    "{canonical_path} is already being admitted by a concurrent request"
                )));
            }
            Err(e) => {
                dir::delete_precache_dir(&dir).await.ok();
                return Err(GatewayError::Internal(e.to_string()));
            }
        };

        let handle = self.handle_for(id, canonical_path).await?;
        self.spawn_fetch_job(handle, metadata, chunk_size);

        Ok(Resolution::InProgress { eta_seconds: None })
    }

    /// Background download + metadata write + checksum generation for a
    /// freshly admitted entry. Each datatype transitions
    /// requested -> producing -> ready|failed exactly once (§4.1, §4.2).
    fn spawn_fetch_job(&self, handle: Arc<DataObject>, metadata: Metadata, chunk_size: u64) {
        let store = self.store.clone();
        let remote = self.remote.clone();

        tokio::spawn(async move {
            let started = Instant::now();

            if let Err(e) = store.set_status(handle.id, DataType::Metadata, Status::Producing).await {
                tracing::warn!(error = %e, "failed to mark metadata producing");
            }
            let metadata_result = tokio::fs::write(
                handle.metadata_path(),
                serde_json::to_vec(&metadata).unwrap_or_default(),
            )
            .await;
            let metadata_status =
                if metadata_result.is_ok() { Status::Ready } else { Status::Failed };
            if let Err(e) = store.set_status(handle.id, DataType::Metadata, metadata_status).await {
                tracing::warn!(error = %e, "failed to record metadata status");
            }

            if let Err(e) = store.set_status(handle.id, DataType::Data, Status::Producing).await {
                tracing::warn!(error = %e, "failed to mark data producing");
            }

            let fetch_result = remote.fetch(&handle.irods_path, &handle.data_path()).await;
            let data_status = match &fetch_result {
                Ok(()) => Status::Ready,
                Err(e) => {
                    tracing::warn!(path = %handle.irods_path, error = %e, "fetch failed");
                    Status::Failed
                }
            };
            if let Err(e) = store.set_status(handle.id, DataType::Data, data_status).await {
                tracing::warn!(error = %e, "failed to record data status");
            }

            if fetch_result.is_err() {
                return;
            }

            let elapsed = started.elapsed().as_secs_f64();
            if let Err(e) = store.record_sample(Process::Download, metadata.size, elapsed).await {
                tracing::warn!(error = %e, "failed to record download throughput sample");
            }

            if let Err(e) = store.set_status(handle.id, DataType::Checksums, Status::Producing).await {
                tracing::warn!(error = %e, "failed to mark checksums producing");
            }

            let checksum_started = Instant::now();
            let checksum_result = checksum::generate(&handle.precache_dir, chunk_size).await;
            let checksum_status = if checksum_result.is_ok() { Status::Ready } else { Status::Failed };
            if let Err(e) = store.set_status(handle.id, DataType::Checksums, checksum_status).await {
                tracing::warn!(error = %e, "failed to record checksums status");
            }

            if checksum_result.is_ok() {
                let elapsed = checksum_started.elapsed().as_secs_f64();
                if let Err(e) = store.record_sample(Process::Checksum, metadata.size, elapsed).await {
                    tracing::warn!(error = %e, "failed to record checksum throughput sample");
                }
            }
        });
    }

    /// Evict least-recently-used, uncontended, fully-resolved entries until
    /// `reservation` fits within `limit`, or fail with `PrecacheFull`
    /// (§4.2 Eviction).
    async fn ensure_capacity(&self, limit: u64, reservation: u64) -> Result<()> {
        loop {
            let commitment = self.store.commitment().await?;
            if commitment + reservation <= limit {
                return Ok(());
            }

            match self.find_eviction_candidate().await? {
                Some(victim) => {
                    if victim.delete().await.is_ok() {
                        self.forget(victim.id);
                    } else {
                        return Err(GatewayError::PrecacheFull);
                    }
                }
                None => return Err(GatewayError::PrecacheFull),
            }
        }
    }

    async fn find_eviction_candidate(&self) -> Result<Option<Arc<DataObject>>> {
        let mut candidates = Vec::new();

        for id in self.store.entries().await? {
            let contention = self.contention.get(&id).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0);
            if contention > 0 {
                continue;
            }

            let status = self.store.get_current_status(id, DataType::Data).await?.map(|c| c.status);
            if matches!(status, Some(Status::Producing)) {
                continue;
            }

            if let Some(last_access) = self.store.get_last_access(id).await? {
                candidates.push((id, last_access));
            }
        }

        candidates.sort_by_key(|&(_, last_access)| last_access);

        match candidates.first() {
            Some(&(id, _)) => {
                let path = self.store.get_irods_path(id).await?.unwrap_or_default();
                Ok(Some(self.handle_for(id, &path).await?))
            }
            None => Ok(None),
        }
    }

    fn forget(&self, id: i64) {
        self.handles.remove(&id);
        self.contention.remove(&id);
    }

    /// Periodically delete entries whose last access predates the
    /// configured expiry, skipping anything contended or still producing
    /// (§4.2 Expiry).
    fn spawn_expiry_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            let expiry = match self.config.expiry {
                crate::config::DurationLimit::Finite(d) => d,
                crate::config::DurationLimit::Unlimited => return,
            };
            let interval_secs = expiry.as_secs().max(60);

            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_expired(expiry).await {
                    tracing::warn!(error = %e, "expiry sweep failed");
                }
            }
        });
    }

    async fn sweep_expired(&self, expiry: std::time::Duration) -> Result<()> {
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(expiry).unwrap_or_default();

        for id in self.store.entries().await? {
            let contention = self.contention.get(&id).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0);
            if contention > 0 {
                continue;
            }

            let Some(last_access) = self.store.get_last_access(id).await? else { continue };
            if last_access > cutoff {
                continue;
            }

            let path = self.store.get_irods_path(id).await?.unwrap_or_default();
            let handle = self.handle_for(id, &path).await?;
            if handle.delete().await.is_ok() {
                tracing::debug!(id, path = %handle.irods_path, "expired entry evicted");
                self.forget(id);
            }
        }

        Ok(())
    }

    pub async fn delete(&self, canonical_path: &str) -> Result<()> {
        let id = self
            .store
            .get_id(canonical_path)
            .await?
            .ok_or_else(|| GatewayError::NotFound(canonical_path.to_string()))?;
        let handle = self.handle_for(id, canonical_path).await?;
        handle.delete().await?;
        self.forget(id);
        Ok(())
    }

    /// Re-request a tracked object whose remote metadata has changed
    /// (§4.2 Refetch / POST semantics).
    pub async fn refetch(&self, canonical_path: &str) -> Result<Resolution> {
        let id = self
            .store
            .get_id(canonical_path)
            .await?
            .ok_or_else(|| GatewayError::NotFound(canonical_path.to_string()))?;
        let handle = self.handle_for(id, canonical_path).await?;

        if handle.refetch_metadata(self.remote.as_ref()).await? {
            handle.delete().await?;
            self.forget(id);
            return self.admit(canonical_path).await;
        }

        self.resolve_existing(id, canonical_path).await
    }

    pub async fn checksums(
        &self,
        handle: &DataObject,
        range: Option<ByteRange>,
    ) -> Result<Vec<ByteRange>> {
        handle.checksums(self.config.chunk_size, range).await
    }

    pub fn commitment_limit(&self) -> SizeLimit {
        self.config.precache_size_limit()
    }
}

impl PrecacheConfig {
    fn precache_size_limit(&self) -> SizeLimit {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockRemoteStore;
    use chrono::Utc;

    fn test_metadata(size: u64) -> Metadata {
        Metadata {
            checksum: "deadbeef".repeat(4),
            size,
            created: Utc::now(),
            modified: Utc::now(),
            avus: vec![],
        }
    }

    async fn manager(size_limit: SizeLimit, root: &std::path::Path) -> (Arc<PrecacheManager>, Arc<MockRemoteStore>) {
        let store = TrackingStore::open_in_memory().await.unwrap();
        let remote = Arc::new(MockRemoteStore::new());
        let config = PrecacheConfig {
            location: root.to_path_buf(),
            index: root.join(".precache.db"),
            size: size_limit,
            expiry: crate::config::DurationLimit::Unlimited,
            chunk_size: 1024,
        };
        let manager = PrecacheManager::new(store, remote.clone(), config).await.unwrap();
        (manager, remote)
    }

    #[tokio::test]
    async fn admitting_unknown_object_returns_in_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, remote) = manager(SizeLimit::Unlimited, tmp.path()).await;
        remote.insert("/a/b", test_metadata(5), b"hello".to_vec());

        let resolution = manager.resolve("/a/b").await.unwrap();
        assert!(matches!(resolution, Resolution::InProgress { .. }));
    }

    #[tokio::test]
    async fn denied_object_is_forbidden() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, remote) = manager(SizeLimit::Unlimited, tmp.path()).await;
        remote.insert("/secret", test_metadata(5), b"nope!".to_vec());
        remote.deny("/secret");

        let err = manager.resolve("/secret").await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn eventually_ready_after_fetch_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, remote) = manager(SizeLimit::Unlimited, tmp.path()).await;
        remote.insert("/a/b", test_metadata(11), b"hello world".to_vec());

        manager.resolve("/a/b").await.unwrap();

        for _ in 0..200 {
            if let Resolution::Ready(handle) = manager.resolve("/a/b").await.unwrap() {
                assert_eq!(tokio::fs::read(handle.data_path()).await.unwrap(), b"hello world");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("entry never became ready");
    }
}
