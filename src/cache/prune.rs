// src/cache/prune.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, warn};

use crate::cache::fs_ops::remove_path;
use crate::cache::TERMINAL_OUTPUTS_DIR;

/// One cache access in this many starts a pruning pass.
pub const PRUNE_ONE_IN: u32 = 50;

/// Start [`remove_old_cache_records`] on a detached thread, with
/// probability `1 / PRUNE_ONE_IN`. Returns whether a pass was started.
pub fn maybe_spawn_pruning(cache_dir: &Path, max_age: Duration) -> bool {
    if rand::rng().random_range(0..PRUNE_ONE_IN) != 0 {
        return false;
    }
    let cache_dir = cache_dir.to_path_buf();
    let spawned = thread::Builder::new()
        .name("monodag-cache-prune".to_string())
        .spawn(move || match remove_old_cache_records(&cache_dir, max_age) {
            Ok(removed) => debug!(removed, "pruned old cache records"),
            Err(e) => warn!(error = %e, "failed to prune old cache records"),
        });
    if let Err(e) = spawned {
        warn!(error = %e, "unable to start cache pruning");
        return false;
    }
    true
}

/// Remove cache entries (and their commit markers and terminal outputs)
/// last modified more than `max_age` ago. Returns the number removed.
pub fn remove_old_cache_records(cache_dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let is_old = |path: &Path| -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= max_age)
    };

    let mut removed = 0;
    let mut candidates: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(cache_dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == TERMINAL_OUTPUTS_DIR {
            for output in fs::read_dir(&path)? {
                candidates.push(output?.path());
            }
        } else if !name.ends_with(".commit") && path.is_dir() {
            candidates.push(path);
        }
    }

    for path in candidates {
        if !is_old(&path) {
            continue;
        }
        let is_staging = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".tmp-"));
        if !is_staging {
            let commit = path.with_extension("commit");
            // Marker first so a half-removed entry is never treated as a hit.
            if commit.exists() && remove_path(&commit).is_err() {
                continue;
            }
        }
        if remove_path(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
