//! Directory allocator: mints unique on-disk directories for cache entries,
//! UUID4-derived and shallowly sharded two hex characters at a time, and
//! deletes them atomically. Grounded in
//! `irobot/precache/precache.py::_new_precache_dir` /
//! `_create_precache_dir` / `_delete_precache_dir`.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::errors::Result;

/// Mint a fresh (not yet created) precache directory path under `root`,
/// from a UUID4 split into byte-pair shards so each level holds at most
/// 256 entries.
pub fn new_precache_dir(root: &Path) -> PathBuf {
    let hex = Uuid::new_v4().simple().to_string();
    let mut path = root.to_path_buf();
    for shard in hex.as_bytes().chunks(2) {
        path.push(std::str::from_utf8(shard).expect("hex chunk is ascii"));
    }
    path
}

/// Create the directory on disk, `0o750` (owner rwx, group rx).
pub fn create_precache_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o750);
        std::fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

/// Remove the top-level precache directory and its contents.
pub async fn delete_precache_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_dir_is_sharded_by_uuid_bytepairs() {
        let root = Path::new("/precache");
        let dir = new_precache_dir(root);
        let rel = dir.strip_prefix(root).unwrap();
        let components: Vec<_> = rel.components().collect();
        // 32 hex chars / 2 per shard = 16 levels
        assert_eq!(components.len(), 16);
    }

    #[tokio::test]
    async fn create_then_delete_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("ab").join("cd");
        create_precache_dir(&dir).unwrap();
        assert!(dir.exists());

        delete_precache_dir(&dir).await.unwrap();
        assert!(!dir.exists());
    }
}
