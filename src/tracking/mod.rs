//! # Tracking Store
//!
//! Durable, concurrently-accessed system of record for every precache entry
//! (§4.1). Backed by a single SQLite file through `sqlx`; a write mutex
//! enforces a single-writer discipline at the statement level while reads
//! proceed unimpeded.
//!
//! Grounded in `irobot/precache/db/tracker.py`; the connection-pool and
//! pragma setup follows a standard `sqlx` connection-pool bootstrap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::common::{DataType, Process, Status, SummaryStat};

/// Errors specific to the tracking store's constraint checks (§4.1
/// Failure semantics). I/O / driver errors pass through as `Sqlx`.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("a precache entity already exists for {0}")]
    AlreadyExists(String),

    #[error("data object file already has that status: {0}")]
    StatusExists(String),

    #[error("tracking store error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, TrackingError>;

/// Current status row for a data object file.
#[derive(Debug, Clone, Copy)]
pub struct CurrentStatus {
    pub timestamp: DateTime<Utc>,
    pub status: Status,
}

/// An entry whose latest status for some datatype was found `producing` on
/// open — orphaned by an unclean shutdown and surfaced for cleanup.
#[derive(Debug, Clone)]
pub struct InconsistentEntry {
    pub id: i64,
    pub precache_path: String,
}

pub struct TrackingStore {
    pool: SqlitePool,
    path: PathBuf,
    in_precache: bool,
    write_lock: AsyncMutex<()>,
}

impl TrackingStore {
    /// Open (creating if absent) the tracking store at `path`.
    ///
    /// `in_precache` controls whether the store's own file size is folded
    /// into [`TrackingStore::commitment`] (§3, §4.1 `commitment()`).
    pub async fn open(path: &Path, in_precache: bool) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query(include_str!("schema.sql")).execute(&pool).await?;

        let store = Arc::new(Self {
            pool,
            path: path.to_path_buf(),
            in_precache,
            write_lock: AsyncMutex::new(()),
        });

        store.clone().spawn_vacuum_timer();

        Ok(store)
    }

    /// In-memory store, for tests.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn open_in_memory() -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new().filename(":memory:").create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::query(include_str!("schema.sql")).execute(&pool).await?;

        Ok(Arc::new(Self {
            pool,
            path: PathBuf::from(":memory:"),
            in_precache: false,
            write_lock: AsyncMutex::new(()),
        }))
    }

    fn spawn_vacuum_timer(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(12 * 3600));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                tracing::debug!("vacuuming precache tracking database");
                let _guard = self.write_lock.lock().await;
                if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
                    tracing::warn!(error = %e, "vacuum failed");
                }
            }
        });
    }

    fn now_unix() -> i64 {
        Utc::now().timestamp()
    }

    fn from_unix(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
    }

    pub async fn get_id(&self, irods_path: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM data_objects WHERE irods_path = ?")
            .bind(irods_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)))
    }

    pub async fn get_irods_path(&self, id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT irods_path FROM data_objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn get_precache_path(&self, id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT precache_path FROM data_objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn get_last_access(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_access FROM data_objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::from_unix(r.get::<i64, _>(0))))
    }

    pub async fn touch_last_access(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE data_objects SET last_access = ? WHERE id = ?")
            .bind(Self::now_unix())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_current_status(
        &self,
        id: i64,
        datatype: DataType,
    ) -> Result<Option<CurrentStatus>> {
        let row = sqlx::query(
            "SELECT timestamp, status FROM status_log
             WHERE data_object = ? AND datatype = ?
             ORDER BY id DESC LIMIT 1",
        )
        .bind(id)
        .bind(datatype.db_id())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CurrentStatus {
            timestamp: Self::from_unix(r.get::<i64, _>(0)),
            status: Status::from_db_id(r.get::<i64, _>(1)).expect("valid status id"),
        }))
    }

    pub async fn set_status(&self, id: i64, datatype: DataType, status: Status) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO status_log (data_object, datatype, status, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(datatype.db_id())
        .bind(status.db_id())
        .bind(Self::now_unix())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Err(TrackingError::StatusExists(format!("{datatype}/{status}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_size(&self, id: i64, datatype: DataType) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT size FROM data_sizes WHERE data_object = ? AND datatype = ?")
            .bind(id)
            .bind(datatype.db_id())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0) as u64))
    }

    pub async fn set_size(&self, id: i64, datatype: DataType, size: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO data_sizes (data_object, datatype, size) VALUES (?, ?, ?)
             ON CONFLICT (data_object, datatype) DO UPDATE SET size = excluded.size",
        )
        .bind(id)
        .bind(datatype.db_id())
        .bind(size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Track a new entry, seeding every datatype's status at `requested`
    /// and recording the reserved sizes (§4.1 `new_request`).
    pub async fn new_request(
        &self,
        irods_path: &str,
        precache_path: &str,
        sizes: (u64, u64, u64),
    ) -> Result<i64> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            "INSERT INTO data_objects (irods_path, precache_path, last_access) VALUES (?, ?, ?)",
        )
        .bind(irods_path)
        .bind(precache_path)
        .bind(Self::now_unix())
        .execute(&mut *tx)
        .await;

        let id = match insert {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                return Err(TrackingError::AlreadyExists(irods_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let (data_size, metadata_size, checksum_size) = sizes;
        for (datatype, size) in [
            (DataType::Data, data_size),
            (DataType::Metadata, metadata_size),
            (DataType::Checksums, checksum_size),
        ] {
            sqlx::query("INSERT INTO data_sizes (data_object, datatype, size) VALUES (?, ?, ?)")
                .bind(id)
                .bind(datatype.db_id())
                .bind(size as i64)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO status_log (data_object, datatype, status, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(datatype.db_id())
            .bind(Status::Requested.db_id())
            .bind(Self::now_unix())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    pub async fn entries(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM data_objects").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    /// Cascade-delete an entry's tracking rows. The caller is responsible
    /// for removing the on-disk directory only *after* this returns
    /// successfully (§3 Destruction: fail-forward ordering).
    pub async fn delete(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM data_objects WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Total reserved bytes across all entries, plus the tracking store's
    /// own file size when it is co-located in the precache (§4.1
    /// `commitment()`).
    pub async fn commitment(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(SUM(size), 0) FROM data_sizes")
            .fetch_one(&self.pool)
            .await?;
        let reserved: i64 = row.get(0);

        let db_size = if self.in_precache {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        Ok(reserved as u64 + db_size)
    }

    /// Record a completed fetch/checksum job's throughput sample (§4.1
    /// `record_sample`).
    pub async fn record_sample(&self, process: Process, size_bytes: u64, duration_seconds: f64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO production_samples (process, size_bytes, duration_seconds, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(process.db_id())
        .bind(size_bytes as i64)
        .bind(duration_seconds)
        .bind(Self::now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mean/standard-error throughput (bytes/second) per process, computed
    /// over the most recent samples. Absent unless at least two samples
    /// exist for a process (§4.1 `production_rates()`).
    pub async fn production_rates(&self) -> Result<std::collections::HashMap<Process, SummaryStat>> {
        let mut out = std::collections::HashMap::new();

        for process in [Process::Download, Process::Checksum] {
            let rows = sqlx::query(
                "SELECT size_bytes, duration_seconds FROM production_samples
                 WHERE process = ? ORDER BY id DESC LIMIT 100",
            )
            .bind(process.db_id())
            .fetch_all(&self.pool)
            .await?;

            let rates: Vec<f64> = rows
                .into_iter()
                .filter_map(|r| {
                    let size: i64 = r.get(0);
                    let duration: f64 = r.get(1);
                    if duration > 0.0 {
                        Some(size as f64 / duration)
                    } else {
                        None
                    }
                })
                .collect();

            if rates.len() < 2 {
                continue;
            }

            let n = rates.len() as f64;
            let mean = rates.iter().sum::<f64>() / n;
            let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let stderr = (variance / n).sqrt();

            out.insert(process, SummaryStat { mean, stderr });
        }

        Ok(out)
    }

    /// On open, any entry whose latest status for any datatype is
    /// `producing` is marked `failed` and returned for cleanup (§4.1
    /// `reset_inconsistent_on_open`). A restart always finds such entries
    /// since no process can still be producing for them.
    pub async fn reset_inconsistent_on_open(&self) -> Result<Vec<InconsistentEntry>> {
        let ids = self.entries().await?;
        let mut inconsistent = Vec::new();

        for id in ids {
            let mut is_inconsistent = false;
            for datatype in DataType::ALL {
                if let Some(current) = self.get_current_status(id, datatype).await? {
                    if current.status == Status::Producing {
                        is_inconsistent = true;
                        match self.set_status(id, datatype, Status::Failed).await {
                            Ok(()) | Err(TrackingError::StatusExists(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            if is_inconsistent {
                if let Some(path) = self.get_precache_path(id).await? {
                    inconsistent.push(InconsistentEntry { id, precache_path: path });
                }
            }
        }

        Ok(inconsistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Arc<TrackingStore> {
        TrackingStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn new_request_seeds_requested_status_and_sizes() {
        let store = store().await;
        let id = store.new_request("/x/y", "/precache/ab/cd", (10, 20, 30)).await.unwrap();

        assert_eq!(store.get_size(id, DataType::Data).await.unwrap(), Some(10));
        assert_eq!(store.get_size(id, DataType::Metadata).await.unwrap(), Some(20));
        assert_eq!(store.get_size(id, DataType::Checksums).await.unwrap(), Some(30));

        let status = store.get_current_status(id, DataType::Data).await.unwrap().unwrap();
        assert_eq!(status.status, Status::Requested);
    }

    #[tokio::test]
    async fn new_request_rejects_duplicate_path() {
        let store = store().await;
        store.new_request("/x/y", "/precache/ab/cd", (1, 1, 1)).await.unwrap();
        let err = store.new_request("/x/y", "/precache/ef/gh", (1, 1, 1)).await.unwrap_err();
        assert!(matches!(err, TrackingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn set_status_rejects_repeated_terminal_transition() {
        let store = store().await;
        let id = store.new_request("/x/y", "/precache/ab/cd", (1, 1, 1)).await.unwrap();
        // `requested` was already logged by new_request.
        let err = store.set_status(id, DataType::Data, Status::Requested).await.unwrap_err();
        assert!(matches!(err, TrackingError::StatusExists(_)));
    }

    #[tokio::test]
    async fn commitment_sums_reserved_sizes() {
        let store = store().await;
        store.new_request("/a", "/precache/aa/bb", (100, 10, 5)).await.unwrap();
        store.new_request("/b", "/precache/cc/dd", (200, 10, 5)).await.unwrap();
        assert_eq!(store.commitment().await.unwrap(), 330);
    }

    #[tokio::test]
    async fn production_rates_absent_below_two_samples() {
        let store = store().await;
        store.record_sample(Process::Download, 1000, 1.0).await.unwrap();
        let rates = store.production_rates().await.unwrap();
        assert!(!rates.contains_key(&Process::Download));

        store.record_sample(Process::Download, 2000, 1.0).await.unwrap();
        let rates = store.production_rates().await.unwrap();
        assert!(rates.contains_key(&Process::Download));
    }

    #[tokio::test]
    async fn delete_cascades_dependent_rows() {
        let store = store().await;
        let id = store.new_request("/x/y", "/precache/ab/cd", (1, 1, 1)).await.unwrap();
        store.delete(id).await.unwrap();
        assert_eq!(store.get_precache_path(id).await.unwrap(), None);
        assert_eq!(store.get_size(id, DataType::Data).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_inconsistent_on_open_fails_producing_entries() {
        let store = store().await;
        let id = store.new_request("/x/y", "/precache/ab/cd", (1, 1, 1)).await.unwrap();
        store.set_status(id, DataType::Data, Status::Producing).await.unwrap();

        let inconsistent = store.reset_inconsistent_on_open().await.unwrap();
        assert_eq!(inconsistent.len(), 1);
        assert_eq!(inconsistent[0].id, id);

        let status = store.get_current_status(id, DataType::Data).await.unwrap().unwrap();
        assert_eq!(status.status, Status::Failed);
    }

}
