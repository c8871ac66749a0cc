//! RFC-2046 `multipart/byteranges` writer (§4.5), grounded in
//! `irobot/httpd/handlers/dataobject/_get.py`'s `_generate_boundary` /
//! `_write_multipart`.

use std::path::Path;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::common::ByteRange;
use crate::errors::Result;

const BOUNDARY_CHARS: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789'()+_,./:=? -";
const BOUNDARY_LENGTH: usize = 70;

fn is_boundary_char(b: u8) -> bool {
    BOUNDARY_CHARS.contains(&b)
}

/// A boundary is valid if every character is in the allowed alphabet and
/// it doesn't end in a space (RFC 2046 §5.1.1).
fn is_valid_boundary(s: &str) -> bool {
    !s.is_empty() && !s.ends_with(' ') && s.bytes().all(is_boundary_char)
}

/// Generate a boundary guaranteed not to collide with the first 72 bytes
/// of any range's payload, by inspecting those prefixes for anything that
/// looks like `--<candidate-boundary>` and excluding it.
pub async fn generate_boundary(data_path: &Path, ranges: &[ByteRange]) -> Result<String> {
    let mut file = tokio::fs::File::open(data_path).await?;
    let mut taken: Vec<String> = Vec::new();

    for range in ranges {
        let prefix_len = range.len().min(72) as usize;
        if prefix_len <= 2 {
            continue;
        }

        file.seek(std::io::SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; prefix_len];
        file.read_exact(&mut buf).await?;

        if &buf[0..2] == b"--" {
            if let Ok(tail) = std::str::from_utf8(&buf[2..]) {
                if is_valid_boundary(tail) {
                    taken.push(tail.to_string());
                }
            }
        }
    }

    let mut rng = rand::thread_rng();
    loop {
        let candidate: String = (0..BOUNDARY_LENGTH)
            .map(|_| BOUNDARY_CHARS[rng.gen_range(0..BOUNDARY_CHARS.len())] as char)
            .collect();

        if !taken.iter().any(|t| t == &candidate) {
            return Ok(candidate);
        }
    }
}

/// Build the full `multipart/byteranges` body for `ranges` read from
/// `data_path`, against `total_size` for `Content-Range` headers.
pub async fn write_multipart(
    data_path: &Path,
    ranges: &[ByteRange],
    boundary: &str,
    total_size: u64,
) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(data_path).await?;
    let dash_boundary = format!("--{boundary}");
    let mut out = Vec::new();

    for range in ranges {
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(dash_boundary.as_bytes());
        out.extend_from_slice(b"\r\n");

        out.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        out.extend_from_slice(format!("Content-Range: {}\r\n", range.content_range(total_size)).as_bytes());
        if let Some(checksum) = &range.checksum {
            out.extend_from_slice(format!("ETag: \"{checksum}\"\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");

        file.seek(std::io::SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf).await?;
        out.extend_from_slice(&buf);
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(dash_boundary.as_bytes());
    out.extend_from_slice(b"--");

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boundary_avoids_colliding_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"just some ordinary bytes, nothing boundary-like here").await.unwrap();

        let boundary = generate_boundary(&path, &[ByteRange::new(0, 10)]).await.unwrap();
        assert_eq!(boundary.len(), BOUNDARY_LENGTH);
        assert!(is_valid_boundary(&boundary));
    }

    #[tokio::test]
    async fn multipart_body_contains_each_range_and_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"0123456789abcdefghij").await.unwrap();

        let ranges = vec![ByteRange::new(0, 5), ByteRange::with_checksum(10, 15, "deadbeef")];
        let body = write_multipart(&path, &ranges, "BOUNDARY", 20).await.unwrap();
        let text = String::from_utf8_lossy(&body);

        assert!(text.contains("--BOUNDARY"));
        assert!(text.contains("Content-Range: bytes 0-5/20"));
        assert!(text.contains("ETag: \"deadbeef\""));
        assert!(text.trim_end().ends_with("--BOUNDARY--"));
    }
}
