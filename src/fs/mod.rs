// src/fs/mod.rs

//! Filesystem access used by plugins, the file map and the hasher.
//!
//! Production code uses [`RealFileSystem`]; tests can swap in
//! [`mock::MockFileSystem`] to build a workspace entirely in memory.

use std::fmt::Debug;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod mock;
pub mod patterns;

/// Directory names never descended into when listing workspace files.
pub const ALWAYS_IGNORED_DIRS: &[&str] = &[".git", "node_modules", "target", ".monodag"];

/// Abstract filesystem interface.
pub trait FileSystem: Send + Sync + Debug {
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;

    /// Return the entries of a directory as full paths.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// List every file under `root` as a `/`-separated path relative to it,
    /// sorted, skipping [`ALWAYS_IGNORED_DIRS`].
    fn list_files(&self, root: &Path) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            for path in self.read_dir(&dir)? {
                let ignored = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| ALWAYS_IGNORED_DIRS.contains(&n))
                    .unwrap_or(false);
                if self.is_dir(&path) {
                    if !ignored {
                        stack.push(path);
                    }
                } else if self.is_file(&path) {
                    if let Some(rel) = relative_str(root, &path) {
                        files.push(rel);
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("reading file {:?}", path))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(path).with_context(|| format!("opening file {:?}", path))?;
        Ok(Box::new(file))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        let mut file = fs::File::create(path).with_context(|| format!("creating file {:?}", path))?;
        file.write_all(contents)
            .with_context(|| format!("writing to file {:?}", path))?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {:?}", path))? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }
}

/// Convert a path into a string relative to `root`, with forward slashes.
///
/// Tries a plain `strip_prefix` first, then retries with both paths
/// canonicalized (symlinked temp dirs on macOS report `/private/var/...`).
/// Returns `None` if the path is not under `root`.
pub fn relative_str(root: &Path, path: &Path) -> Option<String> {
    if let Ok(rel) = path.strip_prefix(root) {
        return Some(to_slash(rel));
    }

    if let (Ok(root_canon), Ok(path_canon)) = (root.canonicalize(), path.canonicalize()) {
        if let Ok(rel) = path_canon.strip_prefix(&root_canon) {
            return Some(to_slash(rel));
        }
    }

    None
}

fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
