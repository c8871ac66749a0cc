//! RFC-7233 (subset) `Range` header parser and canonicaliser (§4.5).
//!
//! Grounded in `irobot/httpd/handlers/dataobject/_range_parser.py`, adapted
//! to this crate's half-open `ByteRange` convention (the source file's
//! ranges are inclusive). Canonicalisation merges adjacent/overlapping
//! ranges that neither carry a checksum; a checksummed range is never
//! merged, since doing so would invalidate its checksum.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::common::ByteRange;
use crate::errors::{GatewayError, Result};

static RE_RANGE_REQUEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?P<units>\w+)=(?P<ranges>\d*-\d*(?:,\d*-\d*)*)$").unwrap());
static RE_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?P<from>\d+)?-(?P<to>\d+)?$").unwrap());

/// Parse a `Range` header against an object of size `size`, returning the
/// canonicalised, half-open byte ranges it names. Fails with
/// `RangeNotSatisfiable` for any malformed or out-of-bounds range, per
/// RFC 7233 §2.1 and §4.4.
pub fn parse_range(header: &str, size: u64) -> Result<Vec<ByteRange>> {
    let unsatisfiable = || GatewayError::RangeNotSatisfiable { size };

    let request = RE_RANGE_REQUEST.captures(header.trim()).ok_or_else(unsatisfiable)?;
    if !request["units"].eq_ignore_ascii_case("bytes") {
        return Err(unsatisfiable());
    }

    let mut ranges = Vec::new();
    for part in request["ranges"].split(',') {
        let captures = RE_RANGE.captures(part).ok_or_else(unsatisfiable)?;

        let from: Option<u64> = captures.name("from").map(|m| m.as_str().parse().unwrap());
        let to: Option<u64> = captures.name("to").map(|m| m.as_str().parse().unwrap());

        let (start, finish) = match (from, to) {
            (None, None) => return Err(unsatisfiable()),
            (Some(a), Some(b)) => {
                if a > b || a >= size {
                    return Err(unsatisfiable());
                }
                (a, (b + 1).min(size))
            }
            (Some(a), None) => {
                if a >= size {
                    return Err(unsatisfiable());
                }
                (a, size)
            }
            (None, Some(suffix_len)) => {
                if suffix_len == 0 {
                    return Err(unsatisfiable());
                }
                let len = suffix_len.min(size);
                (size.saturating_sub(len), size)
            }
        };

        if size == 0 || start >= finish {
            return Err(unsatisfiable());
        }

        ranges.push(ByteRange::new(start, finish));
    }

    Ok(canonicalise_ranges(&[ranges]))
}

/// The parts of `range` left over once `remove` (a checksummed range) has
/// been carved out of it. Empty if there's no overlap.
fn subtract(range: &ByteRange, remove: &ByteRange) -> Vec<ByteRange> {
    if remove.finish <= range.start || remove.start >= range.finish {
        return vec![range.clone()];
    }

    let mut out = Vec::new();
    if range.start < remove.start {
        out.push(ByteRange::new(range.start, remove.start));
    }
    if remove.finish < range.finish {
        out.push(ByteRange::new(remove.finish, range.finish));
    }
    out
}

/// Merge any number of sets of byte ranges into one ordered, mutually
/// exclusive set (§4.5 Canonicalisation).
///
/// Checksummed ranges are taken verbatim and never merged with anything.
/// Unchecksummed ranges are first split around every checksummed range
/// they overlap (exposing the checksummed portion untouched), then the
/// remaining unchecksummed fragments are merged where adjacent/overlapping.
pub fn canonicalise_ranges(range_sets: &[Vec<ByteRange>]) -> Vec<ByteRange> {
    let mut all: Vec<ByteRange> = range_sets.iter().flatten().cloned().collect();
    all.sort_by(|a, b| a.start.cmp(&b.start).then(a.finish.cmp(&b.finish)));

    let (checksummed, unchecksummed): (Vec<ByteRange>, Vec<ByteRange>) =
        all.into_iter().partition(|r| r.checksum.is_some());

    let mut fragments: Vec<ByteRange> = Vec::new();
    for range in unchecksummed {
        let mut pieces = vec![range];
        for cut in &checksummed {
            pieces = pieces.into_iter().flat_map(|p| subtract(&p, cut)).collect();
        }
        fragments.extend(pieces);
    }

    fragments.sort_by(|a, b| a.start.cmp(&b.start).then(a.finish.cmp(&b.finish)));
    let mut merged_fragments: Vec<ByteRange> = Vec::with_capacity(fragments.len());
    for range in fragments {
        if let Some(last) = merged_fragments.last_mut() {
            if last.finish >= range.start {
                last.finish = last.finish.max(range.finish);
                continue;
            }
        }
        merged_fragments.push(range);
    }

    let mut result = checksummed;
    result.extend(merged_fragments);
    result.sort_by(|a, b| a.start.cmp(&b.start).then(a.finish.cmp(&b.finish)));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_range() {
        let ranges = parse_range("bytes=0-499", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange::new(0, 500)]);
    }

    #[test]
    fn truncates_end_beyond_size() {
        let ranges = parse_range("bytes=900-1999", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange::new(900, 1000)]);
    }

    #[test]
    fn suffix_range_from_end() {
        let ranges = parse_range("bytes=-100", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange::new(900, 1000)]);
    }

    #[test]
    fn open_ended_range() {
        let ranges = parse_range("bytes=500-", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange::new(500, 1000)]);
    }

    #[test]
    fn rejects_zero_length_suffix() {
        assert!(parse_range("bytes=-0", 1000).is_err());
    }

    #[test]
    fn rejects_any_range_on_empty_file() {
        assert!(parse_range("bytes=0-", 0).is_err());
    }

    #[test]
    fn rejects_non_byte_units() {
        assert!(parse_range("items=0-5", 1000).is_err());
    }

    #[test]
    fn merges_overlapping_unchecksummed_ranges() {
        let merged = canonicalise_ranges(&[vec![ByteRange::new(0, 10), ByteRange::new(5, 20)]]);
        assert_eq!(merged, vec![ByteRange::new(0, 20)]);
    }

    #[test]
    fn never_merges_checksummed_ranges() {
        let merged = canonicalise_ranges(&[vec![
            ByteRange::with_checksum(0, 10, "abc"),
            ByteRange::new(5, 20),
        ]]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn multiple_ranges_stay_separate_when_disjoint() {
        let ranges = parse_range("bytes=0-9,20-29", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange::new(0, 10), ByteRange::new(20, 30)]);
    }

    #[test]
    fn splits_unchecksummed_range_around_checksummed_overlap() {
        let canon = canonicalise_ranges(&[
            vec![ByteRange::new(0, 30)],
            vec![ByteRange::with_checksum(10, 20, "abc")],
        ]);

        assert_eq!(
            canon,
            vec![
                ByteRange::new(0, 10),
                ByteRange::with_checksum(10, 20, "abc"),
                ByteRange::new(20, 30),
            ]
        );
    }

    #[test]
    fn checksummed_range_fully_inside_requested_range_leaves_no_gap() {
        let canon = canonicalise_ranges(&[
            vec![ByteRange::new(0, 10)],
            vec![ByteRange::with_checksum(0, 10, "whole")],
        ]);
        assert_eq!(canon, vec![ByteRange::with_checksum(0, 10, "whole")]);
    }
}
