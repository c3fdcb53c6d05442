// src/daemon/server/handlers.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::daemon::protocol::{Request, Response};
use crate::daemon::server::context::ServerContext;
use crate::daemon::server::recompute::{current_files, get_cached_project_graph, GraphFailure};
use crate::fs::patterns::PathMatcher;
use crate::hasher::{compute_aggregate_hash, HashStore, TaskHash, TaskHasher};
use crate::workspace::{create_file_map, FileData, WorkspaceFileHashes};

fn failure_response(failure: GraphFailure) -> Response {
    let mut response = Response::error(failure.message);
    response.project_graph = failure.partial_graph.map(Arc::unwrap_or_clone);
    response
}

fn file_data(files: &WorkspaceFileHashes) -> Vec<FileData> {
    files
        .iter()
        .map(|(file, hash)| FileData {
            file: file.clone(),
            hash: hash.clone(),
        })
        .collect()
}

fn matching_files<'a>(
    files: &'a WorkspaceFileHashes,
    globs: &[String],
    exclude: &[String],
) -> anyhow::Result<Vec<(&'a String, &'a String)>> {
    let matcher = PathMatcher::new(globs, exclude)?;
    Ok(files.iter().filter(|(file, _)| matcher.matches(file)).collect())
}

/// Immediate children of `dir` (`""` or `"."` for the workspace root).
fn files_in_directory(files: &WorkspaceFileHashes, dir: &str) -> Vec<String> {
    let dir = dir.trim_end_matches('/');
    let dir = if dir == "." { "" } else { dir };
    files
        .keys()
        .filter(|file| {
            let parent = Path::new(file.as_str())
                .parent()
                .and_then(|p| p.to_str())
                .unwrap_or("");
            parent == dir
        })
        .cloned()
        .collect()
}

/// Answer one request. `REGISTER_FILE_WATCHER` is handled by the
/// connection itself, since it keeps the socket.
pub async fn handle_request(ctx: &Arc<ServerContext>, request: Request) -> Response {
    debug!(request = request.kind(), "handling daemon request");
    match request {
        Request::RequestProjectGraph => match get_cached_project_graph(ctx).await {
            Ok(build) => Response {
                project_graph: Some(build.graph.clone()),
                source_maps: Some(build.source_maps.clone()),
                ..Response::ok()
            },
            Err(failure) => failure_response(failure),
        },

        Request::RequestFileData => match get_cached_project_graph(ctx).await {
            Ok(build) => {
                Response::ok().with("files", build.file_map.all_files().collect::<Vec<_>>())
            }
            Err(failure) => failure_response(failure),
        },

        Request::HashTasks { tasks, task_graph, env } => {
            let build = match get_cached_project_graph(ctx).await {
                Ok(build) => build,
                Err(failure) => return failure_response(failure),
            };
            let config = ctx.state.lock().await.config.clone();
            let worker = Arc::clone(ctx);
            let hashed = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<TaskHash>> {
                let hasher = TaskHasher::new(
                    &worker.workspace_root,
                    &build.graph,
                    &build.file_map,
                    &config,
                    worker.fs.as_ref(),
                )
                .with_env(env.into_iter().collect::<HashMap<_, _>>());
                let refs: Vec<_> = tasks.iter().collect();
                hasher.hash_tasks(&refs, &task_graph).into_iter().collect()
            })
            .await;
            match hashed {
                Ok(Ok(hashes)) => Response::ok().with("hashes", hashes),
                Ok(Err(e)) => Response::error(format!("{e:#}")),
                Err(e) => Response::error(format!("task hashing panicked: {e}")),
            }
        }

        Request::Glob { globs, exclude } => match current_files(ctx).await {
            Ok(files) => match matching_files(&files, &globs, &exclude) {
                Ok(matched) => {
                    let files: Vec<String> = matched.into_iter().map(|(f, _)| f.clone()).collect();
                    Response::ok().with("files", files)
                }
                Err(e) => Response::error(format!("{e:#}")),
            },
            Err(failure) => failure_response(failure),
        },

        Request::HashGlob { globs, exclude } => match current_files(ctx).await {
            Ok(files) => match matching_files(&files, &globs, &exclude) {
                Ok(matched) => {
                    let hashes: Vec<&String> = matched.into_iter().map(|(_, h)| h).collect();
                    Response::ok().with("hash", compute_aggregate_hash(&hashes))
                }
                Err(e) => Response::error(format!("{e:#}")),
            },
            Err(failure) => failure_response(failure),
        },

        Request::GetContextFileData => match current_files(ctx).await {
            Ok(files) => Response::ok().with("files", file_data(&files)),
            Err(failure) => failure_response(failure),
        },

        Request::GetWorkspaceFiles { project_root_map } => match current_files(ctx).await {
            Ok(files) => Response::ok()
                .with("fileMap", create_file_map(&project_root_map, &files))
                .with("allWorkspaceFiles", file_data(&files)),
            Err(failure) => failure_response(failure),
        },

        Request::GetFilesInDirectory { dir } => match current_files(ctx).await {
            Ok(files) => Response::ok().with("files", files_in_directory(&files, &dir)),
            Err(failure) => failure_response(failure),
        },

        Request::RecordOutputsHash { outputs, hash } => {
            let recorded = match ctx.outputs.lock() {
                Ok(mut store) => store.record_outputs_hash(&outputs, &hash),
                Err(_) => Err(anyhow::anyhow!("outputs store poisoned")),
            };
            match recorded {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(format!("{e:#}")),
            }
        }

        Request::OutputsHashesMatch { outputs, hash } => {
            let matched = match ctx.outputs.lock() {
                Ok(store) => store.outputs_hashes_match(&outputs, &hash),
                Err(_) => Err(anyhow::anyhow!("outputs store poisoned")),
            };
            match matched {
                Ok(matched) => Response::ok().with("matched", matched),
                Err(e) => Response::error(format!("{e:#}")),
            }
        }

        Request::ProcessInBackground { name, data } => {
            let Some(f) = ctx.background_fn(&name) else {
                warn!(name = %name, "unknown background function");
                return Response::error(format!("no background function named '{name}'"));
            };
            match tokio::task::spawn_blocking(move || f(data)).await {
                Ok(Ok(result)) => Response::ok().with("result", result),
                Ok(Err(e)) => Response::error(format!("{e:#}")),
                Err(e) => Response::error(format!("background function '{name}' panicked: {e}")),
            }
        }

        Request::RequestShutdown => Response::ok(),

        Request::RegisterFileWatcher { .. } => {
            Response::error("REGISTER_FILE_WATCHER must be the first message on its own connection")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::fs::RealFileSystem;
    use crate::plugins::{InProcessLoader, PluginRegistry};
    use serde_json::{json, Value};
    use std::fs;

    fn setup() -> (tempfile::TempDir, Arc<ServerContext>) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("libs/a/src")).unwrap();
        fs::write(root.join("libs/a/project.json"), r#"{"name": "a"}"#).unwrap();
        fs::write(root.join("libs/a/src/lib.rs"), "a").unwrap();
        fs::write(root.join("README.md"), "hi").unwrap();
        let config = WorkspaceConfig::default();
        let registry = PluginRegistry::load(&config, root, &InProcessLoader::new()).unwrap();
        let ctx = ServerContext::init(root, Arc::new(RealFileSystem), config, registry);
        (dir, ctx)
    }

    #[tokio::test]
    async fn serves_graph_and_file_queries() {
        let (_dir, ctx) = setup();

        let response = handle_request(&ctx, Request::RequestProjectGraph).await;
        assert!(response.error.is_none());
        assert!(response.project_graph.unwrap().contains("a"));

        let mut glob = handle_request(
            &ctx,
            Request::Glob {
                globs: vec!["libs/**/*.rs".into()],
                exclude: vec![],
            },
        )
        .await;
        let files: Vec<String> = glob.take("files").unwrap();
        assert_eq!(files, vec!["libs/a/src/lib.rs"]);

        let mut in_root =
            handle_request(&ctx, Request::GetFilesInDirectory { dir: ".".into() }).await;
        let files: Vec<String> = in_root.take("files").unwrap();
        assert_eq!(files, vec!["README.md"]);

        let mut first = handle_request(
            &ctx,
            Request::HashGlob {
                globs: vec!["libs/**".into()],
                exclude: vec![],
            },
        )
        .await;
        let mut second = handle_request(
            &ctx,
            Request::HashGlob {
                globs: vec!["libs/**".into()],
                exclude: vec![],
            },
        )
        .await;
        assert_eq!(first.take::<String>("hash").unwrap(), second.take::<String>("hash").unwrap());
    }

    #[tokio::test]
    async fn records_and_matches_outputs_hashes() {
        let (_dir, ctx) = setup();
        let outputs = vec!["dist/libs/a".to_string()];

        let mut before = handle_request(
            &ctx,
            Request::OutputsHashesMatch {
                outputs: outputs.clone(),
                hash: "h1".into(),
            },
        )
        .await;
        assert!(!before.take::<bool>("matched").unwrap());

        handle_request(
            &ctx,
            Request::RecordOutputsHash {
                outputs: outputs.clone(),
                hash: "h1".into(),
            },
        )
        .await;
        let request = Request::OutputsHashesMatch {
            outputs,
            hash: "h1".into(),
        };
        let mut after = handle_request(&ctx, request).await;
        assert!(after.take::<bool>("matched").unwrap());
    }

    #[tokio::test]
    async fn runs_registered_background_functions() {
        let (_dir, ctx) = setup();
        ctx.register_background_fn(
            "echo",
            Arc::new(|data: Value| -> anyhow::Result<Value> { Ok(json!({"echo": data})) }),
        );

        let mut response = handle_request(
            &ctx,
            Request::ProcessInBackground {
                name: "echo".into(),
                data: json!(1),
            },
        )
        .await;
        assert_eq!(response.take::<Value>("result").unwrap(), json!({"echo": 1}));

        let missing = handle_request(
            &ctx,
            Request::ProcessInBackground {
                name: "nope".into(),
                data: Value::Null,
            },
        )
        .await;
        assert!(missing.error.is_some());
    }
}
