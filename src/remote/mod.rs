//! # Remote Store Client
//!
//! The external collaborator the precache manager fetches from (§1, §2):
//! "fetch to local path", "read metadata", "check access". Modelled as a
//! trait so the manager and tests can swap in a fake; the real
//! implementation talks to an HTTP-fronted iRODS proxy, grounded in
//! `irobot/irods/_api.py` and `irods.py` -- a REST layer rather than the
//! native iRODS wire protocol (a Non-goal, §1).
//!
//! Blocking work (the actual transfer) runs on a task bounded by a
//! semaphore sized to `irods.max_connections` (§5 Suspension/blocking).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::common::Metadata;
use crate::errors::{GatewayError, Result};

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read an object's metadata (small, synchronous from the caller's
    /// point of view — §4.2 Admission step 3a).
    async fn metadata(&self, remote_path: &str) -> Result<Metadata>;

    /// Fetch the object's bytes to `dest`, overwriting it.
    async fn fetch(&self, remote_path: &str, dest: &Path) -> Result<()>;

    /// Whether the (already authenticated) caller may access this object.
    async fn check_access(&self, remote_path: &str) -> Result<bool>;
}

/// HTTP-backed client for an iRODS REST proxy.
pub struct IrodsHttpClient {
    http: reqwest::Client,
    base_url: String,
    connections: Arc<Semaphore>,
}

impl IrodsHttpClient {
    pub fn new(base_url: impl Into<String>, max_connections: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    fn object_url(&self, remote_path: &str) -> String {
        format!("{}/objects{}", self.base_url.trim_end_matches('/'), remote_path)
    }
}

#[async_trait]
impl RemoteStore for IrodsHttpClient {
    async fn metadata(&self, remote_path: &str) -> Result<Metadata> {
        let _permit = self
            .connections
            .acquire()
            .await
            .map_err(|_| GatewayError::Internal("connection pool closed".into()))?;

        let url = format!("{}/metadata", self.object_url(remote_path));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => response
                .json::<Metadata>()
                .await
                .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string())),
            reqwest::StatusCode::NOT_FOUND => Err(GatewayError::NotFound(remote_path.to_string())),
            reqwest::StatusCode::FORBIDDEN => Err(GatewayError::Forbidden(remote_path.to_string())),
            other => Err(GatewayError::UpstreamUnavailable(format!("unexpected status {other}"))),
        }
    }

    async fn fetch(&self, remote_path: &str, dest: &Path) -> Result<()> {
        let _permit = self
            .connections
            .acquire()
            .await
            .map_err(|_| GatewayError::Internal("connection pool closed".into()))?;

        let url = format!("{}/data", self.object_url(remote_path));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "fetch failed with status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    async fn check_access(&self, remote_path: &str) -> Result<bool> {
        match self.metadata(remote_path).await {
            Ok(_) => Ok(true),
            Err(GatewayError::Forbidden(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-memory fake used by tests and by the precache manager's own test
/// suite.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use dashmap::DashMap;

    pub struct MockRemoteStore {
        pub objects: DashMap<String, (Metadata, Vec<u8>)>,
        pub denied: DashMap<String, ()>,
    }

    impl MockRemoteStore {
        pub fn new() -> Self {
            Self { objects: DashMap::new(), denied: DashMap::new() }
        }

        pub fn insert(&self, path: &str, metadata: Metadata, bytes: Vec<u8>) {
            self.objects.insert(path.to_string(), (metadata, bytes));
        }

        pub fn deny(&self, path: &str) {
            self.denied.insert(path.to_string(), ());
        }
    }

    impl Default for MockRemoteStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemoteStore {
        async fn metadata(&self, remote_path: &str) -> Result<Metadata> {
            if self.denied.contains_key(remote_path) {
                return Err(GatewayError::Forbidden(remote_path.to_string()));
            }
            self.objects
                .get(remote_path)
                .map(|e| e.value().0.clone())
                .ok_or_else(|| GatewayError::NotFound(remote_path.to_string()))
        }

        async fn fetch(&self, remote_path: &str, dest: &Path) -> Result<()> {
            if self.denied.contains_key(remote_path) {
                return Err(GatewayError::Forbidden(remote_path.to_string()));
            }
            let bytes = self
                .objects
                .get(remote_path)
                .map(|e| e.value().1.clone())
                .ok_or_else(|| GatewayError::NotFound(remote_path.to_string()))?;
            tokio::fs::write(dest, &bytes).await?;
            Ok(())
        }

        async fn check_access(&self, remote_path: &str) -> Result<bool> {
            Ok(!self.denied.contains_key(remote_path) && self.objects.contains_key(remote_path))
        }
    }
}
