//! # Checksummer
//!
//! Computes whole-file and chunk MD5s for a precache entry's `data` file,
//! writes the text checksum index (§6), and answers sub-range checksum
//! queries, computing partial sums on the fly when a request doesn't align
//! to chunk boundaries (§4.3).
//!
//! Grounded in `irobot/precache/_checksummer.py`; chunk hashing fans out
//! over a dedicated `rayon` thread pool, sized cores x 5.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use rayon::prelude::*;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::common::ByteRange;
use crate::errors::{GatewayError, Result};

/// One parsed line of a checksum index file: `None` span means the
/// whole-file record (`*\t<md5>`); `Some((start, end))` is a chunk record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChecksumRecord {
    pub span: Option<(u64, u64)>,
    pub md5: String,
}

impl ChecksumRecord {
    fn to_line(&self) -> String {
        match self.span {
            None => format!("*\t{}\n", self.md5),
            Some((start, end)) => format!("{start}-{end}\t{}\n", self.md5),
        }
    }
}

/// Parse a single line (without trailing newline) of the checksum index.
pub fn parse_checksum_record(line: &str) -> Result<ChecksumRecord> {
    let (span_part, md5) = line
        .split_once('\t')
        .ok_or_else(|| GatewayError::Internal(format!("malformed checksum record: {line:?}")))?;

    if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GatewayError::Internal(format!("malformed checksum in record: {line:?}")));
    }

    let span = if span_part == "*" {
        None
    } else {
        let (start, end) = span_part
            .split_once('-')
            .ok_or_else(|| GatewayError::Internal(format!("malformed chunk span: {span_part:?}")))?;
        let start: u64 = start
            .parse()
            .map_err(|_| GatewayError::Internal(format!("malformed chunk start: {start:?}")))?;
        let end: u64 = end
            .parse()
            .map_err(|_| GatewayError::Internal(format!("malformed chunk end: {end:?}")))?;
        Some((start, end))
    };

    Ok(ChecksumRecord { span, md5: md5.to_lowercase() })
}

fn parse_checksum_index(text: &str) -> Result<Vec<ChecksumRecord>> {
    text.lines().filter(|l| !l.is_empty()).map(parse_checksum_record).collect()
}

/// Deterministic size of the checksum index file for a given data size and
/// chunk size (§4.3 `checksum_index_size`): one 35-byte whole-file record
/// plus, per chunk, the ASCII length of `"{start}-{end}\t{md5}\n"`.
pub fn checksum_index_size(data_size: u64, chunk_size: u64) -> u64 {
    let mut size = 35u64;
    let mut start = 0u64;
    let placeholder_md5 = "0".repeat(32);

    while start < data_size {
        let end = (start + chunk_size).min(data_size);
        size += format!("{start}-{end}\t{placeholder_md5}\n").len() as u64;
        start = end;
    }

    size
}

/// Worker pool for chunk checksumming, sized virtual-core-count × 5 (§4.3
/// Concurrency).
static CHECKSUM_POOL: Lazy<rayon::ThreadPool> = Lazy::new(|| {
    let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) * 5;
    rayon::ThreadPoolBuilder::new().num_threads(workers).build().expect("build checksum pool")
});

fn chunk_bounds(data_size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let mut start = 0u64;
    while start < data_size {
        let end = (start + chunk_size).min(data_size);
        chunks.push((start, end));
        start = end;
    }
    chunks
}

fn md5_of_span(data: &[u8], start: u64, end: u64) -> String {
    let digest = md5::compute(&data[start as usize..end as usize]);
    format!("{digest:x}")
}

/// Generate the whole-file and chunk checksums for `precache_dir/data` and
/// write them to `precache_dir/checksums` (write-to-temp, rename).
///
/// Reads the whole file into memory once, then fans chunk hashing out
/// across the worker pool; file sizes here are bounded by the precache's
/// own admission budget so this is an acceptable tradeoff against
/// re-opening the file per chunk.
pub async fn generate(precache_dir: &Path, chunk_size: u64) -> Result<String> {
    let data_path = precache_dir.join("data");
    let checksums_path = precache_dir.join("checksums");

    let data = tokio::fs::read(&data_path).await?;
    let bounds = chunk_bounds(data.len() as u64, chunk_size);

    let (whole_md5, records) = tokio::task::spawn_blocking(move || {
        let whole = {
            let digest = md5::compute(&data);
            format!("{digest:x}")
        };

        let records: Vec<ChecksumRecord> = CHECKSUM_POOL.install(|| {
            bounds
                .par_iter()
                .map(|&(start, end)| ChecksumRecord {
                    span: Some((start, end)),
                    md5: md5_of_span(&data, start, end),
                })
                .collect()
        });

        (whole, records)
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("checksum task panicked: {e}")))?;

    let mut text = String::new();
    text.push_str(&ChecksumRecord { span: None, md5: whole_md5.clone() }.to_line());
    for record in &records {
        text.push_str(&record.to_line());
    }

    let tmp_path = checksums_path.with_extension("tmp");
    {
        let mut f = tokio::fs::File::create(&tmp_path).await?;
        f.write_all(text.as_bytes()).await?;
        f.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, &checksums_path).await?;

    tracing::info!(path = %precache_dir.display(), "checksumming completed");
    Ok(whole_md5)
}

/// Retrieve checksummed blocks covering `range`, or the whole-file checksum
/// when `range` is `None` (§4.3 `blocks`).
pub async fn blocks(
    precache_dir: &Path,
    chunk_size: u64,
    range: Option<ByteRange>,
) -> Result<Vec<ByteRange>> {
    let checksums_path = precache_dir.join("checksums");
    let data_path = precache_dir.join("data");

    let text = tokio::fs::read_to_string(&checksums_path)
        .await
        .map_err(|_| GatewayError::NotFound(format!("checksums not available for {}", precache_dir.display())))?;

    let mut lines = text.lines();
    let whole_line = lines.next().ok_or_else(|| GatewayError::Internal("empty checksum index".into()))?;
    let whole_record = parse_checksum_record(whole_line)?;

    let Some(range) = range else {
        let size = tokio::fs::metadata(&data_path).await?.len();
        return Ok(vec![ByteRange::with_checksum(0, size, whole_record.md5)]);
    };

    let data_size = tokio::fs::metadata(&data_path).await?.len();
    if range.start >= range.finish || range.finish > data_size {
        return Err(GatewayError::BadRequest(format!(
            "invalid checksum range [{}, {}) for size {}",
            range.start, range.finish, data_size
        )));
    }

    let chunk_records: std::collections::HashMap<u64, String> = parse_checksum_index(&text)?
        .into_iter()
        .filter_map(|r| r.span.map(|(start, _end)| (start, r.md5)))
        .collect();

    let mut data_file = tokio::fs::File::open(&data_path).await?;
    let mut out = Vec::new();

    for (chunk_start, chunk_end) in chunk_bounds(data_size, chunk_size) {
        let overlap_start = chunk_start.max(range.start);
        let overlap_end = chunk_end.min(range.finish);
        if overlap_start >= overlap_end {
            continue;
        }

        let aligned = overlap_start == chunk_start && overlap_end == chunk_end;
        let md5 = if aligned {
            chunk_records.get(&chunk_start).cloned()
        } else {
            None
        };

        let md5 = match md5 {
            Some(md5) => md5,
            None => {
                data_file.seek(std::io::SeekFrom::Start(overlap_start)).await?;
                let mut buf = vec![0u8; (overlap_end - overlap_start) as usize];
                data_file.read_exact(&mut buf).await?;
                let digest = md5::compute(&buf);
                format!("{digest:x}")
            }
        };

        out.push(ByteRange::with_checksum(overlap_start, overlap_end, md5));
    }

    Ok(out)
}

pub fn checksums_path(precache_dir: &Path) -> PathBuf {
    precache_dir.join("checksums")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_index_size_for_empty_file() {
        assert_eq!(checksum_index_size(0, 1024), 35);
    }

    #[test]
    fn checksum_index_size_grows_with_chunks() {
        let one_chunk = checksum_index_size(100, 1024);
        let two_chunks = checksum_index_size(2000, 1024);
        assert!(two_chunks > one_chunk);
    }

    #[test]
    fn parses_whole_file_record() {
        let record = parse_checksum_record(&format!("*\t{}", "a".repeat(32))).unwrap();
        assert_eq!(record.span, None);
    }

    #[test]
    fn parses_chunk_record() {
        let record = parse_checksum_record(&format!("0-1024\t{}", "b".repeat(32))).unwrap();
        assert_eq!(record.span, Some((0, 1024)));
    }

    #[test]
    fn rejects_malformed_record() {
        assert!(parse_checksum_record("garbage").is_err());
        assert!(parse_checksum_record("0-1024\tnothex").is_err());
    }

    #[tokio::test]
    async fn generate_then_blocks_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("data"), b"hello world, this is chunked data").await.unwrap();

        let whole = generate(dir.path(), 8).await.unwrap();
        let all = blocks(dir.path(), 8, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].checksum.as_deref(), Some(whole.as_str()));

        let partial = blocks(dir.path(), 8, Some(ByteRange::new(2, 10))).await.unwrap();
        assert!(!partial.is_empty());
        for r in &partial {
            assert!(r.checksum.is_some());
        }
    }
}
