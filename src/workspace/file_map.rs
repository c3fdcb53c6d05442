// src/workspace/file_map.rs

//! Which workspace file belongs to which project, with content hashes.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fs::FileSystem;
use crate::hasher::file_hash::compute_file_hash;
use crate::workspace::ignore::WorkspaceIgnore;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileData {
    pub file: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMap {
    pub project_file_map: BTreeMap<String, Vec<FileData>>,
    pub non_project_files: Vec<FileData>,
}

/// Every file in the workspace, relative path → content hash.
pub type WorkspaceFileHashes = BTreeMap<String, String>;

impl FileMap {
    /// Files owned by `project`, sorted by path.
    pub fn files_for_project(&self, project: &str) -> &[FileData] {
        self.project_file_map
            .get(project)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every file in the map, project files first.
    pub fn all_files(&self) -> impl Iterator<Item = &FileData> {
        self.project_file_map
            .values()
            .flatten()
            .chain(self.non_project_files.iter())
    }
}

/// List and hash every file under `workspace_root` that no ignore file
/// excludes.
pub fn hash_workspace_files(
    workspace_root: &Path,
    fs: &dyn FileSystem,
) -> Result<WorkspaceFileHashes> {
    let mut files = fs.list_files(workspace_root)?;
    let ignore = WorkspaceIgnore::from_files(workspace_root, fs, &files)?;
    ignore.retain(&mut files);
    debug!(count = files.len(), "hashing workspace files");
    hash_files(workspace_root, &files, fs)
}

/// Hash the given workspace-relative files in parallel.
///
/// Files that vanished between listing and hashing are skipped.
pub fn hash_files(
    workspace_root: &Path,
    files: &[String],
    fs: &dyn FileSystem,
) -> Result<WorkspaceFileHashes> {
    let hashed: Vec<(String, Option<String>)> = files
        .par_iter()
        .map(|file| {
            let path = workspace_root.join(file);
            match compute_file_hash(fs, &path) {
                Ok(hash) => (file.clone(), Some(hash)),
                Err(e) => {
                    warn!(file = %file, error = %e, "could not hash file");
                    (file.clone(), None)
                }
            }
        })
        .collect();

    Ok(hashed
        .into_iter()
        .filter_map(|(file, hash)| hash.map(|h| (file, h)))
        .collect())
}

/// The project whose root is the deepest directory containing `file`.
///
/// `root_map` maps project root → project name. The root `"."` owns every
/// file not claimed by a deeper project.
pub fn find_project_for_path<'a>(
    file: &str,
    root_map: &'a BTreeMap<String, String>,
) -> Option<&'a String> {
    let mut dir = file;
    while let Some((parent, _)) = dir.rsplit_once('/') {
        if let Some(project) = root_map.get(parent) {
            return Some(project);
        }
        dir = parent;
    }
    root_map.get(".")
}

/// Assign every hashed file to its project.
pub fn create_file_map(
    root_map: &BTreeMap<String, String>,
    files: &WorkspaceFileHashes,
) -> FileMap {
    let mut file_map = FileMap::default();
    for project in root_map.values() {
        file_map.project_file_map.entry(project.clone()).or_default();
    }

    for (file, hash) in files {
        let data = FileData {
            file: file.clone(),
            hash: hash.clone(),
        };
        match find_project_for_path(file, root_map) {
            Some(project) => file_map
                .project_file_map
                .entry(project.clone())
                .or_default()
                .push(data),
            None => file_map.non_project_files.push(data),
        }
    }
    file_map
}

/// Patch `file_map` in place with changed and deleted files.
///
/// Only valid when the set of project roots did not change; otherwise build
/// a new map with [`create_file_map`].
pub fn update_file_map(
    file_map: &mut FileMap,
    root_map: &BTreeMap<String, String>,
    updated: &WorkspaceFileHashes,
    deleted: &[String],
) {
    let remove = |list: &mut Vec<FileData>, file: &str| list.retain(|d| d.file != file);

    for file in deleted.iter().chain(updated.keys()) {
        match find_project_for_path(file, root_map) {
            Some(project) => {
                if let Some(list) = file_map.project_file_map.get_mut(project) {
                    remove(list, file);
                }
            }
            None => remove(&mut file_map.non_project_files, file),
        }
    }

    for (file, hash) in updated {
        let data = FileData {
            file: file.clone(),
            hash: hash.clone(),
        };
        let list = match find_project_for_path(file, root_map) {
            Some(project) => file_map.project_file_map.entry(project.clone()).or_default(),
            None => &mut file_map.non_project_files,
        };
        let pos = list.partition_point(|d| d.file < data.file);
        list.insert(pos, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> BTreeMap<String, String> {
        [("libs/a", "a"), ("libs/a/nested", "nested")]
            .iter()
            .map(|(r, n)| (r.to_string(), n.to_string()))
            .collect()
    }

    fn hashes(entries: &[(&str, &str)]) -> WorkspaceFileHashes {
        entries
            .iter()
            .map(|(f, h)| (f.to_string(), h.to_string()))
            .collect()
    }

    #[test]
    fn files_go_to_the_deepest_project_root() {
        let files = hashes(&[
            ("libs/a/src/lib.rs", "1"),
            ("libs/a/nested/x.rs", "2"),
            ("Cargo.lock", "3"),
        ]);
        let map = create_file_map(&roots(), &files);
        assert_eq!(map.files_for_project("a")[0].file, "libs/a/src/lib.rs");
        assert_eq!(map.files_for_project("nested")[0].file, "libs/a/nested/x.rs");
        assert_eq!(map.non_project_files[0].file, "Cargo.lock");
    }

    #[test]
    fn incremental_update_matches_full_rebuild() {
        let before = hashes(&[("libs/a/one.rs", "1"), ("libs/a/two.rs", "2"), ("README.md", "3")]);
        let mut map = create_file_map(&roots(), &before);

        let updated = hashes(&[("libs/a/two.rs", "22"), ("libs/a/nested/new.rs", "4")]);
        update_file_map(&mut map, &roots(), &updated, &["README.md".to_string()]);

        let after = hashes(&[
            ("libs/a/one.rs", "1"),
            ("libs/a/two.rs", "22"),
            ("libs/a/nested/new.rs", "4"),
        ]);
        assert_eq!(map, create_file_map(&roots(), &after));
    }
}
