//! End-to-end tests that drive the full router and middleware chain via
//! `tower::ServiceExt::oneshot`, covering the gateway's literal
//! request/response scenarios: cold admission, warm whole-file GET,
//! multi-range GET, conditional GET, DELETE-while-contended, and
//! admission against an exhausted precache budget.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use tower::ServiceExt;

use irobot::auth::{AuthenticatedUser, Authenticator};
use irobot::common::Metadata;
use irobot::config::{
    ArvadosAuthConfig, BasicAuthConfig, Config, DurationLimit, HttpdConfig, IrodsConfig,
    LoggingConfig, PrecacheConfig, SizeLimit,
};
use irobot::errors::{GatewayError, Result as GatewayResult};
use irobot::http::{build_router, AppState};
use irobot::precache::PrecacheManager;
use irobot::remote::RemoteStore;
use irobot::tracking::TrackingStore;

const VALID_AUTH: &str = "Basic Zm9vOmJhcg==";

/// A fixed-credential stand-in for a real upstream validator, so these
/// tests don't depend on the network.
struct TestAuthenticator;

#[async_trait]
impl Authenticator for TestAuthenticator {
    async fn authenticate(&self, auth_header: &str) -> GatewayResult<AuthenticatedUser> {
        if auth_header == VALID_AUTH {
            Ok(AuthenticatedUser::new("foo"))
        } else {
            Err(GatewayError::Unauthorized(self.www_authenticate()))
        }
    }

    fn www_authenticate(&self) -> String {
        "Basic realm=\"test\"".to_string()
    }

    fn matches(&self, auth_header: &str) -> bool {
        auth_header.starts_with("Basic ")
    }
}

/// An in-memory remote store, local to these tests rather than the
/// library's own `cfg(test)` fixture, since an external integration
/// binary doesn't link against the library's test-only code.
struct TestRemoteStore {
    objects: Mutex<HashMap<String, (Metadata, Vec<u8>)>>,
}

impl TestRemoteStore {
    fn new() -> Self {
        Self { objects: Mutex::new(HashMap::new()) }
    }

    fn insert(&self, path: &str, size: u64, bytes: Vec<u8>) {
        let checksum = format!("{:x}", md5::compute(&bytes));
        let metadata = Metadata { checksum, size, created: Utc::now(), modified: Utc::now(), avus: vec![] };
        self.objects.lock().unwrap().insert(path.to_string(), (metadata, bytes));
    }
}

#[async_trait]
impl RemoteStore for TestRemoteStore {
    async fn metadata(&self, remote_path: &str) -> GatewayResult<Metadata> {
        self.objects
            .lock()
            .unwrap()
            .get(remote_path)
            .map(|(m, _)| m.clone())
            .ok_or_else(|| GatewayError::NotFound(remote_path.to_string()))
    }

    async fn fetch(&self, remote_path: &str, dest: &Path) -> GatewayResult<()> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(remote_path)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| GatewayError::NotFound(remote_path.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    async fn check_access(&self, remote_path: &str) -> GatewayResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(remote_path))
    }
}

async fn test_app(tmp: &Path, size: SizeLimit) -> (Router, Arc<TestRemoteStore>) {
    let store_path = tmp.join("precache.db");
    let store = TrackingStore::open(&store_path, true).await.unwrap();
    let remote = Arc::new(TestRemoteStore::new());

    let precache_config = PrecacheConfig {
        location: tmp.to_path_buf(),
        index: store_path,
        size,
        expiry: DurationLimit::Unlimited,
        chunk_size: 1024,
    };

    let precache =
        PrecacheManager::new(store.clone(), remote.clone(), precache_config.clone()).await.unwrap();

    let config = Arc::new(Config {
        precache: precache_config,
        irods: IrodsConfig { max_connections: 4, base_url: "http://localhost:0".to_string() },
        httpd: HttpdConfig {
            bind_address: Ipv4Addr::new(0, 0, 0, 0),
            listen: 0,
            timeout: DurationLimit::Finite(Duration::from_secs(5)),
            authentication: vec!["basic_auth".to_string()],
        },
        basic_auth: BasicAuthConfig {
            url: "http://localhost:0/validate".to_string(),
            cache: DurationLimit::Finite(Duration::from_secs(3600)),
        },
        arvados_auth: ArvadosAuthConfig {
            api_host: "localhost".to_string(),
            api_version: "v1".to_string(),
            cache: DurationLimit::Unlimited,
        },
        logging: LoggingConfig { output: None, level: "error".to_string() },
    });

    let auth_handlers: Vec<Arc<dyn Authenticator>> = vec![Arc::new(TestAuthenticator)];
    let state = AppState::new(precache, store, config, auth_handlers);
    (build_router(state), remote)
}

fn authed(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, VALID_AUTH)
        .body(Body::empty())
        .unwrap()
}

async fn poll_until_ready(router: &Router, uri: &str) -> Response {
    for _ in 0..200 {
        let response = router.clone().oneshot(authed("GET", uri)).await.unwrap();
        if response.status() != StatusCode::ACCEPTED {
            return response;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("entry never became ready");
}

const OBJECT_BYTES: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123";

#[tokio::test]
async fn cold_get_returns_in_progress_with_no_eta() {
    let tmp = tempfile::tempdir().unwrap();
    let (router, remote) = test_app(tmp.path(), SizeLimit::Unlimited).await;
    remote.insert("/x/y", OBJECT_BYTES.len() as u64, OBJECT_BYTES.to_vec());

    let response = router.clone().oneshot(authed("GET", "/x/y")).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().get("iRobot-ETA").is_none());
}

#[tokio::test]
async fn warm_get_returns_whole_file() {
    let tmp = tempfile::tempdir().unwrap();
    let (router, remote) = test_app(tmp.path(), SizeLimit::Unlimited).await;
    remote.insert("/x/y", OBJECT_BYTES.len() as u64, OBJECT_BYTES.to_vec());

    router.clone().oneshot(authed("GET", "/x/y")).await.unwrap();
    let response = poll_until_ready(&router, "/x/y").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::ACCEPT_RANGES).unwrap(), "bytes");
    let etag = response.headers().get(header::ETAG).unwrap().to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{:x}\"", md5::compute(OBJECT_BYTES)));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), OBJECT_BYTES);
}

#[tokio::test]
async fn range_get_returns_multipart_byteranges() {
    let tmp = tempfile::tempdir().unwrap();
    let (router, remote) = test_app(tmp.path(), SizeLimit::Unlimited).await;
    assert_eq!(OBJECT_BYTES.len(), 30);
    remote.insert("/x/y", 30, OBJECT_BYTES.to_vec());

    router.clone().oneshot(authed("GET", "/x/y")).await.unwrap();
    poll_until_ready(&router, "/x/y").await;

    let mut request = authed("GET", "/x/y");
    request.headers_mut().insert(header::RANGE, "bytes=0-9,20-29".parse().unwrap());
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap().to_string();
    assert!(content_type.starts_with("multipart/byteranges"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("Content-Range: bytes 0-10/30"));
    assert!(text.contains("Content-Range: bytes 20-30/30"));
}

#[tokio::test]
async fn conditional_get_returns_not_modified() {
    let tmp = tempfile::tempdir().unwrap();
    let (router, remote) = test_app(tmp.path(), SizeLimit::Unlimited).await;
    remote.insert("/x/y", OBJECT_BYTES.len() as u64, OBJECT_BYTES.to_vec());

    router.clone().oneshot(authed("GET", "/x/y")).await.unwrap();
    let warm = poll_until_ready(&router, "/x/y").await;
    let etag = warm.headers().get(header::ETAG).unwrap().to_str().unwrap().to_string();

    let mut request = authed("GET", "/x/y");
    request.headers_mut().insert(header::IF_NONE_MATCH, etag.parse().unwrap());
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn delete_while_streaming_get_is_in_flight_returns_conflict() {
    let tmp = tempfile::tempdir().unwrap();
    let (router, remote) = test_app(tmp.path(), SizeLimit::Unlimited).await;
    remote.insert("/x/y", OBJECT_BYTES.len() as u64, OBJECT_BYTES.to_vec());

    router.clone().oneshot(authed("GET", "/x/y")).await.unwrap();
    let open_get = poll_until_ready(&router, "/x/y").await;
    assert_eq!(open_get.status(), StatusCode::OK);

    // The GET's response body is a stream still carrying its contention
    // guard -- it hasn't been drained, so the entry is still held open.
    let delete_while_open = router.clone().oneshot(authed("DELETE", "/x/y")).await.unwrap();
    assert_eq!(delete_while_open.status(), StatusCode::CONFLICT);

    to_bytes(open_get.into_body(), usize::MAX).await.unwrap();

    let mut delete_after_close = router.clone().oneshot(authed("DELETE", "/x/y")).await.unwrap();
    for _ in 0..200 {
        if delete_after_close.status() != StatusCode::CONFLICT {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        delete_after_close = router.clone().oneshot(authed("DELETE", "/x/y")).await.unwrap();
    }
    assert_eq!(delete_after_close.status(), StatusCode::NO_CONTENT);

    let refetch = router.clone().oneshot(authed("GET", "/x/y")).await.unwrap();
    assert_eq!(refetch.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn precache_full_rejects_admission() {
    let tmp = tempfile::tempdir().unwrap();
    let (router, remote) = test_app(tmp.path(), SizeLimit::Bytes(1024)).await;
    remote.insert("/big/object", 2048, vec![0u8; 2048]);

    let response = router.clone().oneshot(authed("POST", "/big/object")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
}
