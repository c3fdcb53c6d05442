// src/fs/mock.rs

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use super::FileSystem;

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir(BTreeSet<String>),
}

/// In-memory filesystem for tests.
///
/// Paths are stored as given; use the same root (e.g. `/ws`) for writes and
/// reads. Parent directories are created implicitly.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a file, creating its parent directories.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref().to_path_buf();
        if let Ok(mut nodes) = self.nodes.lock() {
            link_to_parent(&mut nodes, &path);
            nodes.insert(path, Node::File(content.into()));
        }
    }

    /// Remove a file. Directories are left in place.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.remove(path);
            if let (Some(parent), Some(name)) = (path.parent(), file_name(path)) {
                if let Some(Node::Dir(children)) = nodes.get_mut(parent) {
                    children.remove(&name);
                }
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<PathBuf, Node>>> {
        self.nodes
            .lock()
            .map_err(|_| anyhow!("mock filesystem lock poisoned"))
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

/// Register `path` with its parent directory, creating ancestors as needed.
fn link_to_parent(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if parent == path {
        return;
    }
    if !nodes.contains_key(parent) {
        link_to_parent(nodes, parent);
        nodes.insert(parent.to_path_buf(), Node::Dir(BTreeSet::new()));
    }
    if let (Some(Node::Dir(children)), Some(name)) = (nodes.get_mut(parent), file_name(path)) {
        children.insert(name);
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        match self.lock()?.get(path) {
            Some(Node::File(content)) => {
                String::from_utf8(content.clone())
                    .map_err(|e| anyhow!("invalid UTF-8 in {:?}: {e}", path))
            }
            Some(Node::Dir(_)) => Err(anyhow!("is a directory: {:?}", path)),
            None => Err(anyhow!("file not found: {:?}", path)),
        }
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        match self.lock()?.get(path) {
            Some(Node::File(content)) => Ok(Box::new(Cursor::new(content.clone()))),
            Some(Node::Dir(_)) => Err(anyhow!("is a directory: {:?}", path)),
            None => Err(anyhow!("file not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().map(|n| n.contains_key(path)).unwrap_or(false)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.lock()
            .map(|n| matches!(n.get(path), Some(Node::File(_))))
            .unwrap_or(false)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.lock()
            .map(|n| matches!(n.get(path), Some(Node::Dir(_))))
            .unwrap_or(false)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        match self.lock()?.get(path) {
            Some(Node::Dir(children)) => Ok(children.iter().map(|name| path.join(name)).collect()),
            _ => Err(anyhow!("not a directory or not found: {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files_relative_to_root() {
        let fs = MockFileSystem::new();
        fs.add_file("/ws/libs/a/project.json", "{}");
        fs.add_file("/ws/libs/a/src/lib.rs", "fn a() {}");
        fs.add_file("/ws/node_modules/x/package.json", "{}");

        let files = fs.list_files(Path::new("/ws")).unwrap();
        assert_eq!(files, vec!["libs/a/project.json", "libs/a/src/lib.rs"]);
    }

    #[test]
    fn remove_file_unlinks_from_parent() {
        let fs = MockFileSystem::new();
        fs.add_file("/ws/a.txt", "a");
        fs.remove_file("/ws/a.txt");
        assert!(!fs.exists(Path::new("/ws/a.txt")));
        assert!(fs.read_dir(Path::new("/ws")).unwrap().is_empty());
    }
}
