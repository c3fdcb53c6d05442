// src/plugins/registry.rs

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{PluginSpec, WorkspaceConfig};
use crate::fs::patterns::PathMatcher;
use crate::plugins::package_json::PackageJsonPlugin;
use crate::plugins::project_json::ProjectJsonPlugin;
use crate::plugins::target_defaults::TargetDefaultsPlugin;
use crate::plugins::GraphPlugin;

/// Built-in plugins, lowest precedence first.
pub const BUILT_IN_PLUGINS: &[&str] = &[
    TargetDefaultsPlugin::NAME,
    PackageJsonPlugin::NAME,
    ProjectJsonPlugin::NAME,
];

/// Strategy for turning a plugin entry into a plugin value.
///
/// The default [`InProcessLoader`] resolves names against plugins linked into
/// this binary. A loader that isolates plugins (e.g. one process per plugin)
/// can be swapped in without touching the registry.
pub trait PluginLoader: Send + Sync {
    fn load(&self, spec: &PluginSpec, workspace_root: &Path) -> Result<Arc<dyn GraphPlugin>>;
}

/// Resolves plugin names against an in-process table.
#[derive(Debug, Clone)]
pub struct InProcessLoader {
    known: BTreeMap<String, Arc<dyn GraphPlugin>>,
}

impl InProcessLoader {
    /// Loader that knows the built-in plugins.
    pub fn new() -> Self {
        let mut loader = Self {
            known: BTreeMap::new(),
        };
        loader.register(Arc::new(TargetDefaultsPlugin));
        loader.register(Arc::new(PackageJsonPlugin));
        loader.register(Arc::new(ProjectJsonPlugin));
        loader
    }

    /// Make an additional plugin resolvable by its name.
    pub fn register(&mut self, plugin: Arc<dyn GraphPlugin>) {
        self.known.insert(plugin.name().to_string(), plugin);
    }
}

impl Default for InProcessLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLoader for InProcessLoader {
    fn load(&self, spec: &PluginSpec, _workspace_root: &Path) -> Result<Arc<dyn GraphPlugin>> {
        self.known
            .get(spec.name())
            .cloned()
            .ok_or_else(|| anyhow!("unable to resolve plugin '{}'", spec.name()))
    }
}

/// A plugin together with its per-workspace options and file filters.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub plugin: Arc<dyn GraphPlugin>,
    pub options: Option<Value>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
}

impl LoadedPlugin {
    pub fn new(plugin: Arc<dyn GraphPlugin>) -> Self {
        Self {
            plugin,
            options: None,
            include: None,
            exclude: None,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    /// Files matching the plugin's pattern and its include/exclude filters.
    pub fn matching_files(&self, files: &[String]) -> Result<Vec<String>> {
        let pattern = self.plugin.create_nodes_pattern();
        if pattern.is_empty() {
            return Ok(Vec::new());
        }
        let pattern_matcher = PathMatcher::single(pattern)
            .with_context(|| format!("plugin {} has an invalid pattern", self.name()))?;
        let filter = PathMatcher::new(
            self.include.as_deref().unwrap_or_default(),
            self.exclude.as_deref().unwrap_or_default(),
        )
        .with_context(|| format!("plugin {} has invalid include/exclude globs", self.name()))?;

        Ok(files
            .iter()
            .filter(|f| pattern_matcher.matches(f) && filter.matches(f))
            .cloned()
            .collect())
    }
}

/// Ordered set of loaded plugins: user plugins first, then built-ins.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<LoadedPlugin>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<LoadedPlugin>) -> Self {
        Self { plugins }
    }

    /// Load every plugin named in the workspace config, then the built-ins
    /// that were not listed explicitly.
    pub fn load(
        config: &WorkspaceConfig,
        workspace_root: &Path,
        loader: &dyn PluginLoader,
    ) -> Result<Self> {
        let mut plugins = Vec::new();

        for spec in config.workspace.plugins.iter() {
            let plugin = loader
                .load(spec, workspace_root)
                .with_context(|| format!("loading plugin '{}'", spec.name()))?;
            let mut loaded = LoadedPlugin::new(plugin);
            if let PluginSpec::Detailed {
                options,
                include,
                exclude,
                ..
            } = spec
            {
                loaded.options = options.clone();
                loaded.include = include.clone();
                loaded.exclude = exclude.clone();
            }
            debug!(plugin = %loaded.name(), "loaded plugin");
            plugins.push(loaded);
        }

        for name in BUILT_IN_PLUGINS {
            if plugins.iter().any(|p| p.name() == *name) {
                continue;
            }
            let plugin = loader.load(&PluginSpec::Name(name.to_string()), workspace_root)?;
            plugins.push(LoadedPlugin::new(plugin));
        }

        info!(count = plugins.len(), "plugin registry ready");
        Ok(Self { plugins })
    }

    pub fn plugins(&self) -> &[LoadedPlugin] {
        &self.plugins
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawWorkspaceConfig;

    #[test]
    fn user_plugins_come_before_built_ins() {
        let raw: RawWorkspaceConfig = toml::from_str(
            "[workspace]\nplugins = [{ name = \"project-json\", exclude = [\"tools/**\"] }]\n",
        )
        .unwrap();
        let cfg = WorkspaceConfig::try_from(raw).unwrap();
        let registry =
            PluginRegistry::load(&cfg, Path::new("/ws"), &InProcessLoader::new()).unwrap();
        let names: Vec<&str> = registry.plugins().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["project-json", "target-defaults", "package-json"]);
    }

    #[test]
    fn unknown_plugin_fails_to_load() {
        let raw: RawWorkspaceConfig =
            toml::from_str("[workspace]\nplugins = [\"does-not-exist\"]\n").unwrap();
        let cfg = WorkspaceConfig::try_from(raw).unwrap();
        let err =
            PluginRegistry::load(&cfg, Path::new("/ws"), &InProcessLoader::new()).unwrap_err();
        assert!(format!("{err:#}").contains("does-not-exist"));
    }

    #[test]
    fn include_and_exclude_filter_matching_files() {
        let mut loaded = LoadedPlugin::new(Arc::new(ProjectJsonPlugin));
        loaded.exclude = Some(vec!["tools/**".to_string()]);
        let files = vec![
            "libs/a/project.json".to_string(),
            "tools/b/project.json".to_string(),
            "libs/a/src/main.rs".to_string(),
        ];
        assert_eq!(loaded.matching_files(&files).unwrap(), vec!["libs/a/project.json"]);
    }
}
