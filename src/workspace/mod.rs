// src/workspace/mod.rs

//! Workspace-level state that is not configuration: the file map and the
//! directory where derived data lives.

use std::path::{Path, PathBuf};

pub mod file_map;
pub mod ignore;

pub use file_map::{
    create_file_map, find_project_for_path, hash_files, hash_workspace_files, update_file_map,
    FileData, FileMap, WorkspaceFileHashes,
};
pub use ignore::{is_ignore_file, WorkspaceIgnore};

/// Relative location of derived workspace data (daemon record, outputs hashes).
pub const WORKSPACE_DATA_DIR: &str = ".monodag/workspace-data";

pub fn workspace_data_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(WORKSPACE_DATA_DIR)
}
