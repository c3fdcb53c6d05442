#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use monodag::cache::{Cache, CacheOptions, RetryPolicy};
use monodag::config::WorkspaceConfig;
use monodag::dag::{create_task_graph, TaskGraph, TaskGraphRequest};
use monodag::engine::RunContext;
use monodag::exec::ExecutorRegistry;
use monodag::fs::RealFileSystem;
use monodag::graph::ProjectGraph;
use monodag::hasher::{HashStore, MemoryHashStore};
use monodag::workspace::{create_file_map, hash_workspace_files};

pub use monodag_test_utils::{init_tracing, with_timeout};

pub type SharedHashStore = Arc<Mutex<Box<dyn HashStore>>>;

pub fn memory_store() -> SharedHashStore {
    Arc::new(Mutex::new(Box::new(MemoryHashStore::new())))
}

/// Write `(relative path, contents)` pairs under `root`.
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let dest = root.join(path);
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, contents).unwrap();
    }
}

/// A workspace on disk for a prebuilt project graph, with one source file
/// per project, `dist` ignored, and a cache directory of its own.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub cache_dir: TempDir,
    pub graph: Arc<ProjectGraph>,
    pub config: Arc<WorkspaceConfig>,
    pub executors: ExecutorRegistry,
}

impl TestWorkspace {
    pub fn new(graph: ProjectGraph) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &[(".gitignore", "dist\n")]);
        for node in graph.nodes.values() {
            let source = format!("{}/src/lib.rs", node.root);
            let contents = format!("// {}\n", node.name);
            write_files(dir.path(), &[(&source, &contents)]);
        }
        Self {
            dir,
            cache_dir: tempfile::tempdir().unwrap(),
            graph: Arc::new(graph),
            config: Arc::new(WorkspaceConfig::default()),
            executors: ExecutorRegistry::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn task_graph(&self, projects: &[&str], target: &str) -> TaskGraph {
        let request = TaskGraphRequest {
            projects: projects.iter().map(|p| p.to_string()).collect(),
            targets: vec![target.to_string()],
            ..Default::default()
        };
        create_task_graph(&self.graph, &request).unwrap()
    }

    /// A run context over the workspace as it is on disk right now.
    pub fn context(&self, outputs_store: SharedHashStore) -> RunContext {
        let fs = RealFileSystem;
        let files = hash_workspace_files(self.root(), &fs).unwrap();
        let file_map = create_file_map(&self.graph.root_map(), &files);
        let cache = Cache::new(
            self.root(),
            CacheOptions {
                cache_directory: self.cache_dir.path().to_path_buf(),
                remote: None,
                reject_unknown_local_cache: false,
                max_age: Duration::from_secs(7 * 24 * 60 * 60),
                retry: RetryPolicy::none(),
            },
        )
        .unwrap();

        RunContext {
            workspace_root: self.root().to_path_buf(),
            project_graph: Arc::clone(&self.graph),
            file_map: Arc::new(file_map),
            config: Arc::clone(&self.config),
            fs: Arc::new(RealFileSystem),
            executors: Arc::new(self.executors.clone()),
            cache: Some(Arc::new(cache)),
            outputs_store,
        }
    }
}
