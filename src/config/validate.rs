// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::{DependsOnEntry, RawWorkspaceConfig, WorkspaceConfig};
use crate::errors::{MonodagError, Result};

impl TryFrom<RawWorkspaceConfig> for WorkspaceConfig {
    type Error = MonodagError;

    fn try_from(raw: RawWorkspaceConfig) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(WorkspaceConfig::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawWorkspaceConfig) -> Result<()> {
    validate_workspace_section(cfg)?;
    validate_plugins(cfg)?;
    validate_target_defaults(cfg)?;
    Ok(())
}

fn validate_workspace_section(cfg: &RawWorkspaceConfig) -> Result<()> {
    if cfg.workspace.parallel == 0 {
        return Err(MonodagError::ConfigError(
            "[workspace].parallel must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.workspace.cache_directory.as_os_str().is_empty() {
        return Err(MonodagError::ConfigError(
            "[workspace].cache_directory must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_plugins(cfg: &RawWorkspaceConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for plugin in cfg.workspace.plugins.iter() {
        let name = plugin.name().trim();
        if name.is_empty() {
            return Err(MonodagError::ConfigError(
                "[workspace].plugins contains an entry with an empty name".to_string(),
            ));
        }
        if !seen.insert(name) {
            return Err(MonodagError::ConfigError(format!(
                "plugin '{name}' is listed more than once in [workspace].plugins"
            )));
        }
    }
    Ok(())
}

fn validate_target_defaults(cfg: &RawWorkspaceConfig) -> Result<()> {
    for (key, target) in cfg.target_defaults.iter() {
        if target.executor.is_some() && target.command.is_some() {
            return Err(MonodagError::ConfigError(format!(
                "[target_defaults.{key}] should not have executor and command both configured"
            )));
        }
        for entry in target.depends_on.iter().flatten() {
            match entry {
                DependsOnEntry::Shorthand(s) if s.trim().is_empty() || s == "^" => {
                    return Err(MonodagError::ConfigError(format!(
                        "[target_defaults.{key}].dependsOn contains an empty target"
                    )));
                }
                DependsOnEntry::Full(full)
                    if full.projects.is_some() && full.dependencies == Some(true) =>
                {
                    return Err(MonodagError::ConfigError(format!(
                        "[target_defaults.{key}].dependsOn: \
                         projects and dependencies cannot be used together"
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}
