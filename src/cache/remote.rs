// src/cache/remote.rs

//! The remote tier. It only ever exchanges whole entries with the local
//! cache directory: `retrieve` fills it, `store` publishes from it.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cache::fs_ops::{copy_path, remove_path};
use crate::errors::CacheError;

pub trait RemoteCache: Send + Sync + Debug {
    /// Copy the entry for `hash` into `cache_dir`. `Ok(false)` on a miss.
    fn retrieve(&self, hash: &str, cache_dir: &Path) -> Result<bool, CacheError>;

    /// Publish the committed entry for `hash` from `cache_dir`.
    fn store(&self, hash: &str, cache_dir: &Path) -> Result<bool, CacheError>;
}

/// A directory shared between machines (network mount, synced folder).
#[derive(Debug, Clone)]
pub struct DirectoryRemoteCache {
    dir: PathBuf,
}

impl DirectoryRemoteCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RemoteCache for DirectoryRemoteCache {
    fn retrieve(&self, hash: &str, cache_dir: &Path) -> Result<bool, CacheError> {
        let commit = self.dir.join(format!("{hash}.commit"));
        if !commit.exists() {
            debug!(hash = %hash, "remote cache miss");
            return Ok(false);
        }

        let local = cache_dir.join(hash);
        let local_commit = cache_dir.join(format!("{hash}.commit"));
        remove_path(&local_commit)?;
        remove_path(&local)?;
        copy_path(&self.dir.join(hash), &local)?;
        // Commit marker last, as for local writes.
        fs::copy(&commit, &local_commit).map_err(|source| CacheError::Io {
            path: local_commit.clone(),
            source,
        })?;
        debug!(hash = %hash, "retrieved entry from remote cache");
        Ok(true)
    }

    fn store(&self, hash: &str, cache_dir: &Path) -> Result<bool, CacheError> {
        let local_commit = cache_dir.join(format!("{hash}.commit"));
        if !local_commit.exists() {
            return Ok(false);
        }

        let remote = self.dir.join(hash);
        let remote_commit = self.dir.join(format!("{hash}.commit"));
        remove_path(&remote_commit)?;
        remove_path(&remote)?;
        copy_path(&cache_dir.join(hash), &remote)?;
        fs::copy(&local_commit, &remote_commit).map_err(|source| CacheError::Io {
            path: remote_commit.clone(),
            source,
        })?;
        debug!(hash = %hash, "stored entry in remote cache");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_retrieve_moves_committed_entries_only() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let cache = DirectoryRemoteCache::new(remote.path());

        fs::create_dir_all(local.path().join("h1/outputs")).unwrap();
        fs::write(local.path().join("h1/code"), "0").unwrap();
        assert!(!cache.store("h1", local.path()).unwrap());

        fs::write(local.path().join("h1.commit"), "true").unwrap();
        assert!(cache.store("h1", local.path()).unwrap());

        assert!(cache.retrieve("h1", other.path()).unwrap());
        assert!(other.path().join("h1.commit").exists());
        assert_eq!(fs::read_to_string(other.path().join("h1/code")).unwrap(), "0");
        assert!(!cache.retrieve("missing", other.path()).unwrap());
    }
}
