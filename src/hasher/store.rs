// src/hasher/store.rs

//! Which task hash last produced each output path.
//!
//! When an output is still the one a cached hash produced, restoring it from
//! the cache can be skipped.

use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

/// Abstract storage for output hashes.
pub trait HashStore: Send + Sync {
    fn load(&self, output: &str) -> Result<Option<String>>;
    fn save(&mut self, output: &str, hash: &str) -> Result<()>;
    /// Forget every output that contains (or is contained in) a changed path.
    fn invalidate(&mut self, changed: &[String]) -> Result<()>;

    fn record_outputs_hash(&mut self, outputs: &[String], hash: &str) -> Result<()> {
        for output in outputs {
            self.save(output, hash)?;
        }
        Ok(())
    }

    /// True when every output was last recorded with `hash`.
    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> Result<bool> {
        for output in outputs {
            if self.load(output)?.as_deref() != Some(hash) {
                return Ok(false);
            }
        }
        Ok(!outputs.is_empty())
    }
}

/// Stores hashes in memory. The daemon keeps one for its lifetime, a run
/// without the daemon keeps one per run.
#[derive(Debug, Default)]
pub struct MemoryHashStore {
    map: HashMap<String, String>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashStore for MemoryHashStore {
    fn load(&self, output: &str) -> Result<Option<String>> {
        Ok(self.map.get(output).cloned())
    }

    fn save(&mut self, output: &str, hash: &str) -> Result<()> {
        self.map.insert(output.to_string(), hash.to_string());
        debug!(output = %output, hash = %hash, "stored outputs hash (memory)");
        Ok(())
    }

    fn invalidate(&mut self, changed: &[String]) -> Result<()> {
        let initial_len = self.map.len();
        self.map.retain(|output, _| !touches_any(output, changed));
        if self.map.len() < initial_len {
            debug!(removed = initial_len - self.map.len(), "invalidated outputs hashes (memory)");
        }
        Ok(())
    }
}

fn touches_any(output: &str, changed: &[String]) -> bool {
    changed
        .iter()
        .any(|path| is_within(path, output) || is_within(output, path))
}

fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    fn exercise(store: &mut dyn HashStore) {
        let dist = outputs(&["dist/libs/a", "libs/a/coverage"]);
        assert!(!store.outputs_hashes_match(&dist, "h1").unwrap());

        store.record_outputs_hash(&dist, "h1").unwrap();
        assert!(store.outputs_hashes_match(&dist, "h1").unwrap());
        assert!(!store.outputs_hashes_match(&dist, "h2").unwrap());

        store.invalidate(&outputs(&["dist/libs/a/main.js"])).unwrap();
        assert!(!store.outputs_hashes_match(&dist, "h1").unwrap());
        assert_eq!(store.load("libs/a/coverage").unwrap().as_deref(), Some("h1"));

        // A sibling with a common prefix is unaffected.
        store.invalidate(&outputs(&["libs/a/coverage-old"])).unwrap();
        assert_eq!(store.load("libs/a/coverage").unwrap().as_deref(), Some("h1"));
    }

    #[test]
    fn memory_store_tracks_outputs() {
        exercise(&mut MemoryHashStore::new());
    }

    #[test]
    fn empty_outputs_never_match() {
        let store = MemoryHashStore::new();
        assert!(!store.outputs_hashes_match(&[], "h").unwrap());
    }
}
