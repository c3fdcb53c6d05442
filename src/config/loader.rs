// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{RawWorkspaceConfig, WorkspaceConfig, WORKSPACE_CONFIG_FILE};
use crate::errors::Result;

/// Load `Monodag.toml` from a given path and return the raw model.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawWorkspaceConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawWorkspaceConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Load and validate a workspace config file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<WorkspaceConfig> {
    let raw_config = load_from_path(&path)?;
    let config = WorkspaceConfig::try_from(raw_config)?;
    Ok(config)
}

/// Load the config for a workspace root.
///
/// A workspace without `Monodag.toml` is valid and gets all defaults.
pub fn load_workspace_config(workspace_root: &Path) -> Result<WorkspaceConfig> {
    let path = workspace_root.join(WORKSPACE_CONFIG_FILE);
    if !path.is_file() {
        debug!(?path, "no workspace config found; using defaults");
        return WorkspaceConfig::try_from(RawWorkspaceConfig::default());
    }
    load_and_validate(path)
}

/// Walk up from `start` to the first directory containing `Monodag.toml`.
///
/// Falls back to `start` itself when no config file is found.
pub fn find_workspace_root(start: &Path) -> PathBuf {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(WORKSPACE_CONFIG_FILE).is_file() {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    start.to_path_buf()
}
