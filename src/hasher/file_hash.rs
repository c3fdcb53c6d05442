// src/hasher/file_hash.rs

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use blake3::Hasher;

use crate::fs::FileSystem;

/// Compute the blake3 hash of a single file's contents.
pub fn compute_file_hash(fs: &dyn FileSystem, path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut reader = fs
        .open_read(path)
        .with_context(|| format!("opening file for hashing: {:?}", path))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash a list of already-computed hashes (or any strings) in order.
///
/// Callers sort the parts when order must not matter.
pub fn compute_aggregate_hash<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        // Separator so that ["ab", "c"] and ["a", "bc"] differ.
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

pub fn hash_str(value: &str) -> String {
    blake3::hash(value.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn file_hash_depends_on_content_only() {
        let fs = MockFileSystem::new();
        fs.add_file("/a.txt", "same");
        fs.add_file("/b.txt", "same");
        fs.add_file("/c.txt", "different");

        let a = compute_file_hash(&fs, Path::new("/a.txt")).unwrap();
        let b = compute_file_hash(&fs, Path::new("/b.txt")).unwrap();
        let c = compute_file_hash(&fs, Path::new("/c.txt")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn aggregate_hash_is_order_sensitive_and_separated() {
        assert_ne!(compute_aggregate_hash(&["a", "b"]), compute_aggregate_hash(&["b", "a"]));
        assert_ne!(compute_aggregate_hash(&["ab", "c"]), compute_aggregate_hash(&["a", "bc"]));
    }
}
