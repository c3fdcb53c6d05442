// tests/daemon_ipc.rs
#![cfg(unix)]

mod common;
use crate::common::{init_tracing, with_timeout, write_files};

use std::collections::BTreeSet;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use monodag::config::load_workspace_config;
use monodag::daemon::server::add_changed_files;
use monodag::daemon::{
    serve, DaemonClient, FileWatcherConfig, ServerContext, ServerOptions, WatchProjects,
};
use monodag::fs::RealFileSystem;
use monodag::plugins::{InProcessLoader, PluginRegistry};
use monodag::types::DependencyType;
use monodag::watch::ChangedFiles;

type TestResult = Result<(), Box<dyn Error>>;

fn write_workspace(root: &Path) {
    write_files(
        root,
        &[
            (
                "libs/a/project.json",
                r#"{"name": "a", "targets": {"build": {"command": "echo a"}}}"#,
            ),
            (
                "libs/b/project.json",
                r#"{
                    "name": "b",
                    "implicitDependencies": ["a"],
                    "targets": {"build": {"command": "echo b"}}
                }"#,
            ),
            ("libs/a/src/index.ts", "export const a = 1;\n"),
            ("libs/b/src/index.ts", "export const b = 2;\n"),
        ],
    );
}

type DaemonTask = tokio::task::JoinHandle<anyhow::Result<()>>;

async fn start_daemon(
    root: &Path,
    socket: &Path,
) -> Result<(Arc<ServerContext>, DaemonTask), Box<dyn Error>> {
    let config = load_workspace_config(root)?;
    let registry = PluginRegistry::load(&config, root, &InProcessLoader::new())?;
    let ctx = ServerContext::init(root, Arc::new(RealFileSystem), config, registry);
    let options = ServerOptions {
        socket_path: socket.to_path_buf(),
        inactivity_timeout: Duration::from_secs(60),
        watch_files: false,
    };
    let server = tokio::spawn(serve(Arc::clone(&ctx), options));
    Ok((ctx, server))
}

/// Poll until the socket accepts connections; `send` would otherwise try
/// to spawn a daemon process.
async fn wait_until_available(client: &DaemonClient) {
    while !client.is_server_available().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn serves_graph_and_file_queries_then_shuts_down() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_workspace(root);
    let socket = root.join("d.sock");

    let (_ctx, server) = start_daemon(root, &socket).await?;
    let client = DaemonClient::with_socket_path(root, &socket);
    with_timeout(wait_until_available(&client)).await;

    let (graph, source_maps) = with_timeout(client.get_project_graph()).await?;
    assert_eq!(graph.nodes.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    let b_deps = &graph.dependencies["b"];
    assert!(
        b_deps
            .iter()
            .any(|d| d.target == "a" && d.dependency_type == DependencyType::Implicit)
    );
    assert!(source_maps.contains_key("libs/a"));

    let files = with_timeout(client.glob(vec!["libs/*/src/*.ts".into()], vec![])).await?;
    assert_eq!(files, vec!["libs/a/src/index.ts", "libs/b/src/index.ts"]);

    let children = with_timeout(client.get_files_in_directory("libs/a")).await?;
    assert_eq!(children, vec!["libs/a/project.json"]);

    let outputs = vec!["libs/a/dist".to_string()];
    assert!(!with_timeout(client.outputs_hashes_match(outputs.clone(), "h1".into())).await?);
    with_timeout(client.record_outputs_hash(outputs.clone(), "h1".into())).await?;
    assert!(with_timeout(client.outputs_hashes_match(outputs, "h1".into())).await?);

    with_timeout(client.request_shutdown()).await?;
    with_timeout(server).await??;
    assert!(!socket.exists());
    Ok(())
}

#[tokio::test]
async fn registered_watchers_hear_about_their_projects() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_workspace(root);
    let socket = root.join("d.sock");

    let (ctx, server) = start_daemon(root, &socket).await?;
    let client = DaemonClient::with_socket_path(root, &socket);
    with_timeout(wait_until_available(&client)).await;
    // Make sure the graph (and with it the root map) is ready.
    with_timeout(client.get_project_graph()).await?;

    let mut stream = with_timeout(client.register_file_watcher(FileWatcherConfig {
        watch_projects: WatchProjects::Projects(vec!["a".into()]),
        include_global_workspace_files: false,
    }))
    .await?;

    write_files(root, &[("libs/b/src/index.ts", "export const b = 3;\n")]);
    add_changed_files(
        &ctx,
        ChangedFiles {
            updated: BTreeSet::from(["libs/b/src/index.ts".to_string()]),
            ..Default::default()
        },
    )
    .await;

    write_files(root, &[("libs/a/src/index.ts", "export const a = 2;\n")]);
    add_changed_files(
        &ctx,
        ChangedFiles {
            updated: BTreeSet::from(["libs/a/src/index.ts".to_string()]),
            ..Default::default()
        },
    )
    .await;

    // Only the change in `a` reaches a watcher of `a`.
    let notification = with_timeout(stream.next()).await?.expect("notification");
    assert_eq!(notification.changed_projects, vec!["a"]);
    assert_eq!(notification.changed_files.len(), 1);
    assert_eq!(notification.changed_files[0].path, "libs/a/src/index.ts");

    drop(stream);
    with_timeout(client.request_shutdown()).await?;
    with_timeout(server).await??;
    Ok(())
}
