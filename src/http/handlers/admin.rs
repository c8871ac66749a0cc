//! Administrative status/config/precache-listing endpoints (§4.4 Design
//! Note: Supplemented admin surface). Grounded in
//! `irobot/httpd/handlers/admin.py`'s `status`/`config`/`precache`
//! handlers; `config` and `precache` here return the gateway's actual
//! effective configuration and tracked-entry listing rather than stub
//! placeholder bodies.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::super::AppState;
use crate::common::{DataType, Process};
use crate::errors::Result;

#[derive(Serialize)]
struct ConnectionsSummary {
    active: i64,
    total: u64,
}

#[derive(Serialize)]
struct PrecacheSummary {
    commitment_bytes: u64,
    commitment_limit_bytes: Option<u64>,
    checksum_rate_bytes_per_sec: Option<f64>,
}

#[derive(Serialize)]
struct IrodsSummary {
    download_rate_bytes_per_sec: Option<f64>,
}

#[derive(Serialize)]
struct StatusBody {
    connections: ConnectionsSummary,
    precache: PrecacheSummary,
    irods: IrodsSummary,
}

/// `GET|HEAD /_status`: live connection counts and throughput summaries.
pub async fn status(State(state): State<AppState>) -> Result<Response> {
    let rates = state.store.production_rates().await?;
    let commitment = state.store.commitment().await?;

    let body = StatusBody {
        connections: ConnectionsSummary {
            active: state.active_connections.load(Ordering::SeqCst),
            total: state.total_connections.load(Ordering::SeqCst),
        },
        precache: PrecacheSummary {
            commitment_bytes: commitment,
            commitment_limit_bytes: state.precache.commitment_limit().bytes(),
            checksum_rate_bytes_per_sec: rates.get(&Process::Checksum).map(|s| s.mean),
        },
        irods: IrodsSummary {
            download_rate_bytes_per_sec: rates.get(&Process::Download).map(|s| s.mean),
        },
    };

    Ok(Json(body).into_response())
}

/// `GET|HEAD /_config`: the effective, environment-resolved configuration
/// this gateway is running with.
pub async fn config(State(state): State<AppState>) -> Response {
    Json(state.config.as_ref()).into_response()
}

#[derive(Serialize)]
struct EntrySummary {
    irods_path: String,
    data_status: Option<String>,
    metadata_status: Option<String>,
    checksums_status: Option<String>,
    last_access: Option<chrono::DateTime<chrono::Utc>>,
}

/// `GET|HEAD /_precache`: every tracked entry and its per-datatype status.
pub async fn precache(State(state): State<AppState>) -> Result<Response> {
    let mut entries = Vec::new();

    for id in state.store.entries().await? {
        let irods_path = state.store.get_irods_path(id).await?.unwrap_or_default();
        let data_status = state.store.get_current_status(id, DataType::Data).await?.map(|c| c.status.to_string());
        let metadata_status =
            state.store.get_current_status(id, DataType::Metadata).await?.map(|c| c.status.to_string());
        let checksums_status =
            state.store.get_current_status(id, DataType::Checksums).await?.map(|c| c.status.to_string());
        let last_access = state.store.get_last_access(id).await?;

        entries.push(EntrySummary { irods_path, data_status, metadata_status, checksums_status, last_access });
    }

    Ok(Json(entries).into_response())
}
