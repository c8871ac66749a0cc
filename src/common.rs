//! Shared types used across the precache, tracking store and HTTP layers.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three files that make up a precache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Data,
    Metadata,
    Checksums,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::Data, DataType::Metadata, DataType::Checksums];

    /// The integer discriminant used in the tracking store schema.
    pub fn db_id(self) -> i64 {
        match self {
            DataType::Data => 1,
            DataType::Metadata => 2,
            DataType::Checksums => 3,
        }
    }

    pub fn from_db_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(DataType::Data),
            2 => Some(DataType::Metadata),
            3 => Some(DataType::Checksums),
            _ => None,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            DataType::Data => "data",
            DataType::Metadata => "metadata",
            DataType::Checksums => "checksums",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Lifecycle state of a single per-datatype file within a precache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Requested,
    Producing,
    Ready,
    Failed,
}

impl Status {
    pub fn db_id(self) -> i64 {
        match self {
            Status::Requested => 1,
            Status::Producing => 2,
            Status::Ready => 3,
            Status::Failed => 4,
        }
    }

    pub fn from_db_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Status::Requested),
            2 => Some(Status::Producing),
            3 => Some(Status::Ready),
            4 => Some(Status::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Requested => "requested",
            Status::Producing => "producing",
            Status::Ready => "ready",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A background process whose throughput feeds ETA estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    Download,
    Checksum,
}

impl Process {
    pub fn db_id(self) -> i64 {
        match self {
            Process::Download => 1,
            Process::Checksum => 2,
        }
    }

    pub fn from_db_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Process::Download),
            2 => Some(Process::Checksum),
            _ => None,
        }
    }
}

/// Arithmetic mean and standard error of a rolling sample set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStat {
    pub mean: f64,
    pub stderr: f64,
}

impl SummaryStat {
    /// Estimated seconds remaining to produce `remaining_bytes` at this rate.
    pub fn eta_seconds(&self, remaining_bytes: u64) -> Option<f64> {
        if self.mean <= 0.0 {
            return None;
        }
        Some(remaining_bytes as f64 / self.mean)
    }
}

/// Half-open byte range `[start, finish)`, with an optional checksum that is
/// only ever populated when the range is chunk-aligned and has already been
/// checksummed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub finish: u64,
    pub checksum: Option<String>,
}

impl ByteRange {
    pub fn new(start: u64, finish: u64) -> Self {
        Self { start, finish, checksum: None }
    }

    pub fn with_checksum(start: u64, finish: u64, checksum: impl Into<String>) -> Self {
        Self { start, finish, checksum: Some(checksum.into()) }
    }

    pub fn len(&self) -> u64 {
        self.finish.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.finish <= self.start
    }

    /// Content-Range header value for this range against `total_size`.
    ///
    /// Grounded in `_get.py::_content_range`, whose inclusive `ByteRange`
    /// emits `start-{finish + 1}`; carried over verbatim in this crate's
    /// half-open convention, where that is simply `start-finish` (§8
    /// scenario 3: `bytes=0-9,20-29` on a 30-byte file yields parts
    /// `bytes 0-10/30` and `bytes 20-30/30`, not the RFC-7233 inclusive
    /// `0-9`/`20-29`).
    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.finish, total_size)
    }
}

/// Attribute-value-unit triple carried verbatim from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Avu {
    pub attribute: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Remote-store metadata for a data object.
///
/// Serialises to/from the wire shape of §6 (`timestamps` as a list of
/// single-key `{created: ...}`/`{modified: ...}` objects, UTC with no
/// timezone suffix) via [`MetadataWire`], grounded in
/// `irobot/irods/_types.py`'s `MetadataJSONEncoder`/`MetadataJSONDecoder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetadataWire", into = "MetadataWire")]
pub struct Metadata {
    pub checksum: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub avus: Vec<Avu>,
}

impl Metadata {
    /// Whether `other` describes the same remote object as `self` for the
    /// purposes of refetch comparison (§4.2 Refetch).
    pub fn differs_from(&self, other: &Metadata) -> bool {
        self.checksum != other.checksum
            || self.size != other.size
            || self.created != other.created
            || self.modified != other.modified
    }
}

/// `YYYY-MM-DDTHH:MM:SS`, always UTC, never carrying a timezone suffix (§6).
const IROBOT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(IROBOT_TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, MetadataWireError> {
    chrono::NaiveDateTime::parse_from_str(s, IROBOT_TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| MetadataWireError(format!("malformed timestamp {s:?}: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct TimestampEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modified: Option<String>,
}

/// The over-the-wire JSON shape of [`Metadata`] (§6 Metadata body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataWire {
    pub checksum: String,
    pub size: u64,
    pub timestamps: Vec<TimestampEntry>,
    pub avus: Vec<Avu>,
}

impl From<Metadata> for MetadataWire {
    fn from(m: Metadata) -> Self {
        Self {
            checksum: m.checksum,
            size: m.size,
            timestamps: vec![
                TimestampEntry { created: Some(format_timestamp(m.created)), modified: None },
                TimestampEntry { created: None, modified: Some(format_timestamp(m.modified)) },
            ],
            avus: m.avus,
        }
    }
}

#[derive(Debug)]
pub struct MetadataWireError(String);

impl fmt::Display for MetadataWireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MetadataWireError {}

impl TryFrom<MetadataWire> for Metadata {
    type Error = MetadataWireError;

    fn try_from(wire: MetadataWire) -> std::result::Result<Self, Self::Error> {
        let mut created = None;
        let mut modified = None;
        for entry in wire.timestamps {
            created = created.or(entry.created);
            modified = modified.or(entry.modified);
        }

        let created = created.ok_or_else(|| MetadataWireError("missing created timestamp".into()))?;
        let modified = modified.ok_or_else(|| MetadataWireError("missing modified timestamp".into()))?;

        Ok(Metadata {
            checksum: wire.checksum,
            size: wire.size,
            created: parse_timestamp(&created)?,
            modified: parse_timestamp(&modified)?,
            avus: wire.avus,
        })
    }
}

/// Canonicalise a remote path: prepend `/` if missing, collapse repeated
/// separators. Grounded in `irobot/common/canon.py`.
pub fn canonical_path(path: &str) -> String {
    let prefixed = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    let mut out = String::with_capacity(prefixed.len());
    let mut last_was_slash = false;
    for c in prefixed.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }
    out
}

/// Whether a canonical path names a root-level object (disallowed, §4.4).
pub fn is_root_object(canonical: &str) -> bool {
    canonical.matches('/').count() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalises_missing_leading_slash() {
        assert_eq!(canonical_path("x/y"), "/x/y");
    }

    #[test]
    fn canonicalises_repeated_separators() {
        assert_eq!(canonical_path("//x//y/"), "/x/y/");
    }

    #[test]
    fn root_object_is_rejected() {
        assert!(is_root_object("/x"));
        assert!(!is_root_object("/x/y"));
    }

    #[test]
    fn byte_range_content_range_header() {
        let r = ByteRange::new(0, 10);
        assert_eq!(r.content_range(30), "bytes 0-10/30");
    }

    #[test]
    fn content_range_matches_multi_range_scenario() {
        assert_eq!(ByteRange::new(0, 10).content_range(30), "bytes 0-10/30");
        assert_eq!(ByteRange::new(20, 30).content_range(30), "bytes 20-30/30");
    }

    #[test]
    fn metadata_round_trips_through_wire_shape() {
        let metadata = Metadata {
            checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 0,
            created: Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap(),
            modified: Utc.with_ymd_and_hms(2021, 6, 7, 8, 9, 10).unwrap(),
            avus: vec![Avu { attribute: "a".into(), value: "b".into(), units: None }],
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"timestamps\""));
        assert!(json.contains("2020-01-02T03:04:05"));
        assert!(!json.contains('+'));

        let parsed: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metadata);
    }
}
