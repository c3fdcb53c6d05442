// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs` holds the `Monodag.toml` model and the JSON project/target
//!   configuration shared by plugins and the graph builder.
//! - `loader.rs` reads the workspace config from disk.
//! - `validate.rs` checks basic invariants.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{find_workspace_root, load_and_validate, load_from_path, load_workspace_config};
pub use model::{
    DependsOnEntry, DependsOnParams, ExecutorSection, InputDefinition, PluginSpec,
    ProjectConfiguration, RawWorkspaceConfig, TargetConfiguration, TargetDependencyConfig,
    WorkspaceConfig, WorkspaceSection, WORKSPACE_CONFIG_FILE,
};
