// src/plugins/project_json.rs

//! Projects declared explicitly with a `project.json` file.

use anyhow::Context;

use crate::config::ProjectConfiguration;
use crate::plugins::{
    create_nodes_from_files, project_root_of, CreateNodesContext, CreateNodesOutput,
    CreateNodesResult, GraphPlugin, PluginCapabilities,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectJsonPlugin;

impl ProjectJsonPlugin {
    pub const NAME: &'static str = "project-json";
}

impl GraphPlugin for ProjectJsonPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            create_nodes: true,
            ..Default::default()
        }
    }

    fn create_nodes_pattern(&self) -> &str {
        "**/project.json"
    }

    fn create_nodes(&self, files: &[String], ctx: &CreateNodesContext<'_>) -> CreateNodesOutput {
        create_nodes_from_files(files, |file| {
            let path = ctx.workspace_root.join(file);
            let contents = ctx.fs.read_to_string(&path)?;
            let mut config: ProjectConfiguration =
                serde_json::from_str(&contents).with_context(|| format!("parsing {file}"))?;
            let root = project_root_of(file);
            config.root = root.clone();

            let mut result = CreateNodesResult::default();
            result.projects.insert(root, config);
            Ok(Some(result))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::fs::mock::MockFileSystem;
    use std::path::Path;

    #[test]
    fn reads_project_json_with_root_from_location() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "/ws/libs/a/project.json",
            r#"{"name": "a", "tags": ["scope:shared"], "targets": {"build": {"command": "make"}}}"#,
        );
        fs.add_file("/ws/libs/bad/project.json", "{ not json");
        let config = WorkspaceConfig::default();
        let ctx = CreateNodesContext {
            workspace_root: Path::new("/ws"),
            config: &config,
            fs: &fs,
            options: None,
        };

        let files = vec!["libs/a/project.json".to_string(), "libs/bad/project.json".to_string()];
        let err = ProjectJsonPlugin.create_nodes(&files, &ctx).unwrap_err();

        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].0.as_deref(), Some("libs/bad/project.json"));
        let (file, result) = &err.partial_results[0];
        assert_eq!(file, "libs/a/project.json");
        let project = &result.projects["libs/a"];
        assert_eq!(project.root, "libs/a");
        assert_eq!(project.name.as_deref(), Some("a"));
    }
}
