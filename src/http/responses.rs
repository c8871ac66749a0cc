//! Standard response helpers and the `Accept` header media-range parser
//! (§4.4). Grounded in `irobot/httpd/handlers/_accept_parser.py`; the
//! error body shape matches `irobot/httpd/_error.py::error_factory` and is
//! defined once, in [`crate::errors::ErrorBody`].

use std::collections::BTreeMap;

use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::common::Metadata;

pub const MEDIA_DATA: &str = "application/octet-stream";
pub const MEDIA_METADATA: &str = "application/vnd.irobot.metadata+json";
pub const MEDIA_MULTIPART: &str = "multipart/byteranges";
pub const MEDIA_JSON: &str = "application/json";

static RE_MEDIA_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<type>[a-z0-9][a-z0-9!#$&\-^_.+]{0,126})/(?P<subtype>[a-z0-9][a-z0-9!#$&\-^_.+]{0,126})$").unwrap());

#[derive(Debug, Clone)]
struct MediaRange {
    type_: String,
    subtype: String,
    q: f64,
    params: BTreeMap<String, String>,
}

impl MediaRange {
    fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.split(';').map(str::trim);
        let media_range = parts.next()?;
        let (type_, subtype) = media_range.split_once('/')?;

        let mut q = 1.0;
        let mut params = BTreeMap::new();
        for param in parts {
            if let Some((k, v)) = param.split_once('=') {
                let (k, v) = (k.trim(), v.trim());
                if k.eq_ignore_ascii_case("q") {
                    q = v.parse().unwrap_or(1.0);
                } else {
                    params.insert(k.to_ascii_lowercase(), v.to_string());
                }
            }
        }

        Some(Self { type_: type_.to_ascii_lowercase(), subtype: subtype.to_ascii_lowercase(), q, params })
    }

    fn in_range(&self, media_type: &str) -> bool {
        if self.type_ == "*" && self.subtype == "*" {
            return true;
        }

        let Some(captures) = RE_MEDIA_TYPE.captures(media_type) else { return false };
        let mt_type = captures["type"].to_ascii_lowercase();
        let mt_subtype = captures["subtype"].to_ascii_lowercase();

        if mt_type == self.type_ && self.subtype == "*" {
            return true;
        }

        mt_type == self.type_ && mt_subtype == self.subtype && self.params.is_empty()
    }
}

/// Parsed `Accept` header, ranges kept in client-preference order (highest
/// `q` first; ties preserve the order they appeared in the header).
pub struct Accept {
    ranges: Vec<MediaRange>,
}

impl Accept {
    pub fn parse(header: &str) -> Self {
        let mut ranges: Vec<MediaRange> =
            header.split(',').filter_map(|m| MediaRange::parse(m.trim())).collect();
        if ranges.is_empty() {
            ranges.push(MediaRange { type_: "*".into(), subtype: "*".into(), q: 1.0, params: BTreeMap::new() });
        }
        ranges.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
        Self { ranges }
    }

    pub fn accepts(&self, media_types: &[&str]) -> bool {
        media_types.iter().any(|m| self.ranges.iter().any(|r| r.in_range(m)))
    }

    /// The client's most preferred of `media_types`, or `None` if it
    /// accepts none of them (§4.4 406 dispatch).
    pub fn preferred<'a>(&self, media_types: &[&'a str]) -> Option<&'a str> {
        for range in &self.ranges {
            for media_type in media_types {
                if range.in_range(media_type) {
                    return Some(media_type);
                }
            }
        }
        None
    }
}

/// `application/vnd.irobot.metadata+json` response for the metadata
/// handler (§4.4).
pub fn metadata_response(metadata: &Metadata) -> Response {
    let body = serde_json::to_vec(metadata).unwrap_or_default();
    (
        [(axum::http::header::CONTENT_TYPE, MEDIA_METADATA)],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_highest_quality_value() {
        let accept = Accept::parse("text/plain;q=0.5, application/json;q=0.9");
        assert_eq!(accept.preferred(&["text/plain", "application/json"]), Some("application/json"));
    }

    #[test]
    fn wildcard_accepts_anything() {
        let accept = Accept::parse("*/*");
        assert!(accept.accepts(&[MEDIA_DATA]));
    }

    #[test]
    fn subtype_wildcard_matches_any_subtype() {
        let accept = Accept::parse("application/*");
        assert!(accept.accepts(&[MEDIA_METADATA]));
        assert!(!accept.accepts(&["text/plain"]));
    }

    #[test]
    fn rejects_unlisted_type() {
        let accept = Accept::parse("text/plain");
        assert!(!accept.accepts(&[MEDIA_DATA]));
    }
}
