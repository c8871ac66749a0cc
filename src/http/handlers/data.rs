//! The data-object endpoint: `GET|HEAD|POST|DELETE /{irods_path}` (§4.4).
//!
//! Grounded in `irobot/httpd/handlers/dataobject/{_common,_get,_post,_delete}.py`.
//! `_delete.py` left the actual removal as a `NotImplementedError`
//! placeholder; this gateway carries out the deletion it describes, since
//! there is no external delegate left to do it.

use std::path::Path as FsPath;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use super::super::multipart;
use super::super::range;
use super::super::responses::{Accept, MEDIA_DATA, MEDIA_METADATA, MEDIA_MULTIPART};
use super::super::AppState;
use crate::common::{canonical_path, is_root_object, ByteRange, DataType, Status};
use crate::errors::{GatewayError, Result};
use crate::precache::handle::{ContentionGuard, DataObject};
use crate::precache::Resolution;

pin_project_lite::pin_project! {
    /// Keeps a [`ContentionGuard`] alive for as long as the streamed body
    /// it's attached to, so an entry can't be evicted or deleted while a
    /// whole-file GET is still being read by the client (§4.2 Contention,
    /// §8 scenario 5).
    struct GuardedStream<S> {
        #[pin]
        inner: S,
        _guard: ContentionGuard,
    }
}

impl<S: Stream> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

/// Normalise and reject root-level paths before they ever reach the
/// precache manager (§4.4 step 1).
fn canonicalise_or_404(raw: &str) -> Result<String> {
    let canonical = canonical_path(raw);
    if is_root_object(&canonical) {
        return Err(GatewayError::NotFound(canonical));
    }
    Ok(canonical)
}

/// `202 Accepted`, with `iRobot-ETA` when a rate estimate exists (§4.4 step
/// 2, §8 scenario 1).
fn in_progress_response(eta_seconds: Option<f64>) -> Response {
    let mut response = StatusCode::ACCEPTED.into_response();
    if let Some(eta) = eta_seconds {
        if let Ok(value) = HeaderValue::from_str(&(eta.round() as u64).to_string()) {
            response.headers_mut().insert("iRobot-ETA", value);
        }
    }
    response
}

fn if_none_match_matches(header_value: &str, etag: &str) -> bool {
    header_value.split(',').map(str::trim).any(|candidate| candidate == "*" || candidate.trim_matches('"') == etag)
}

fn quoted(etag: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("\"{etag}\"")).unwrap_or_else(|_| HeaderValue::from_static("\"\""))
}

/// `GET|HEAD /{irods_path}`: delegate to the metadata or data representation
/// per `Accept` negotiation (§4.4 steps 3-4).
pub async fn get_or_head(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response> {
    let canonical = canonicalise_or_404(&raw_path)?;

    let handle = match state.precache.resolve(&canonical).await? {
        Resolution::InProgress { eta_seconds } => return Ok(in_progress_response(eta_seconds)),
        Resolution::Ready(handle) => handle,
    };

    let guard = handle.begin_access();
    handle.update_last_access().await?;

    let accept_header = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()).unwrap_or("*/*");
    let accept = Accept::parse(accept_header);

    match accept.preferred(&[MEDIA_METADATA, MEDIA_DATA]) {
        Some(MEDIA_METADATA) => {
            let metadata = handle.metadata().await?;
            let mut response = super::super::responses::metadata_response(&metadata);
            if method == Method::HEAD {
                *response.body_mut() = Body::empty();
            }
            Ok(response)
        }
        Some(MEDIA_DATA) => serve_data(&state, &handle, &method, &headers, guard).await,
        _ => Err(GatewayError::NotAcceptable),
    }
}

async fn serve_data(
    state: &AppState,
    handle: &Arc<DataObject>,
    method: &Method,
    headers: &HeaderMap,
    guard: ContentionGuard,
) -> Result<Response> {
    let metadata = handle.metadata().await?;
    let size = metadata.size;
    let etag = metadata.checksum;

    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if if_none_match_matches(if_none_match, &etag) {
            drop(guard);
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            response.headers_mut().insert(header::ETAG, quoted(&etag));
            return Ok(response);
        }
    }

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    let mut response = match range_header {
        None => whole_file_response(handle, size, method, guard).await?,
        Some(raw_range) => {
            let requested = range::parse_range(raw_range, size)?;

            let mut range_sets = vec![requested.clone()];
            for r in &requested {
                if let Ok(blocks) = state.precache.checksums(handle, Some(r.clone())).await {
                    range_sets.push(blocks);
                }
            }
            let canonical_ranges = range::canonicalise_ranges(&range_sets);

            ranged_response(handle, &canonical_ranges, size, method).await?
        }
    };

    if !response.headers().contains_key(header::ETAG) {
        response.headers_mut().insert(header::ETAG, quoted(&etag));
    }
    response.headers_mut().insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

/// `200` for a whole-file GET, streamed with chunked transfer encoding
/// rather than buffered (§4.4 step 4d: the object may be arbitrarily
/// large). The contention guard rides along with the stream so the entry
/// can't be evicted or deleted mid-transfer (§4.2 Contention, §8 scenario 5).
async fn whole_file_response(
    handle: &Arc<DataObject>,
    size: u64,
    method: &Method,
    guard: ContentionGuard,
) -> Result<Response> {
    let mut response = StatusCode::OK.into_response();

    if *method == Method::HEAD {
        drop(guard);
        response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from_str(&size.to_string()).unwrap());
        return Ok(response);
    }

    let file = tokio::fs::File::open(handle.data_path()).await?;
    let stream = GuardedStream { inner: ReaderStream::new(file), _guard: guard };
    *response.body_mut() = Body::from_stream(stream);
    Ok(response)
}

async fn read_range(path: &FsPath, range: &ByteRange) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// `206` for one range, `206 multipart/byteranges` for several (§4.4 step
/// 4c, §4.5 Multipart writer).
async fn ranged_response(
    handle: &Arc<DataObject>,
    ranges: &[ByteRange],
    size: u64,
    method: &Method,
) -> Result<Response> {
    if ranges.is_empty() {
        return Err(GatewayError::RangeNotSatisfiable { size });
    }

    if ranges.len() == 1 {
        let r = &ranges[0];
        let mut response = StatusCode::PARTIAL_CONTENT.into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_RANGE, HeaderValue::from_str(&r.content_range(size)).unwrap());
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_str(&r.len().to_string()).unwrap());
        if let Some(checksum) = &r.checksum {
            response.headers_mut().insert(header::ETAG, quoted(checksum));
        }

        if *method == Method::HEAD {
            return Ok(response);
        }

        let bytes = read_range(&handle.data_path(), r).await?;
        *response.body_mut() = Body::from(bytes);
        return Ok(response);
    }

    let boundary = multipart::generate_boundary(&handle.data_path(), ranges).await?;
    let mut response = StatusCode::PARTIAL_CONTENT.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&format!("{MEDIA_MULTIPART}; boundary={boundary}")).unwrap(),
    );

    if *method == Method::HEAD {
        return Ok(response);
    }

    let body = multipart::write_multipart(&handle.data_path(), ranges, &boundary, size).await?;
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from_str(&body.len().to_string()).unwrap());
    *response.body_mut() = Body::from(body);
    Ok(response)
}

/// `POST /{irods_path}`: re-seed from the remote store if its metadata has
/// changed; always `201` (§4.4 POST, §8 idempotence law).
pub async fn post(State(state): State<AppState>, Path(raw_path): Path<String>) -> Result<Response> {
    let canonical = canonicalise_or_404(&raw_path)?;

    match state.precache.resolve(&canonical).await? {
        Resolution::InProgress { eta_seconds } => return Ok(in_progress_response(eta_seconds)),
        Resolution::Ready(handle) => {
            if handle.contention_count() > 0 {
                return Err(GatewayError::Conflict(format!("{canonical} is in use and cannot be re-seeded")));
            }
            state.precache.refetch(&canonical).await?;
        }
    }

    Ok(StatusCode::CREATED.into_response())
}

/// `DELETE /{irods_path}`: refuse while anything is unready or contended,
/// otherwise remove the tracking row and the on-disk directory (§4.4
/// DELETE).
pub async fn delete(State(state): State<AppState>, Path(raw_path): Path<String>) -> Result<Response> {
    let canonical = canonicalise_or_404(&raw_path)?;

    let id = state
        .store
        .get_id(&canonical)
        .await?
        .ok_or_else(|| GatewayError::NotFound(canonical.clone()))?;

    for datatype in DataType::ALL {
        let status = state.store.get_current_status(id, datatype).await?.map(|c| c.status);
        if status != Some(Status::Ready) {
            return Err(GatewayError::Conflict(format!("{canonical} is not fully ready")));
        }
    }

    state.precache.delete(&canonical).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
