// src/daemon/protocol.rs

//! Messages exchanged over the daemon socket.
//!
//! Framing is newline-delimited JSON: every request and response is one
//! line of compact JSON followed by `\n`. `serde_json` escapes newlines
//! inside strings, so a line is always exactly one message.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::dag::{Task, TaskGraph};
use crate::errors::DaemonError;
use crate::graph::{ConfigurationSourceMaps, ProjectGraph};

/// A request, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    RequestProjectGraph,
    RequestFileData,
    #[serde(rename_all = "camelCase")]
    HashTasks {
        tasks: Vec<Task>,
        task_graph: TaskGraph,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    RegisterFileWatcher {
        config: FileWatcherConfig,
    },
    ProcessInBackground {
        name: String,
        #[serde(default)]
        data: Value,
    },
    RecordOutputsHash {
        outputs: Vec<String>,
        hash: String,
    },
    OutputsHashesMatch {
        outputs: Vec<String>,
        hash: String,
    },
    Glob {
        globs: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    GetContextFileData,
    #[serde(
        rename = "GET_NX_WORKSPACE_FILES",
        alias = "GET_WORKSPACE_FILES",
        rename_all = "camelCase"
    )]
    GetWorkspaceFiles {
        /// Project root → project name.
        project_root_map: BTreeMap<String, String>,
    },
    GetFilesInDirectory {
        dir: String,
    },
    HashGlob {
        globs: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    RequestShutdown,
}

impl Request {
    /// Wire name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::RequestProjectGraph => "REQUEST_PROJECT_GRAPH",
            Request::RequestFileData => "REQUEST_FILE_DATA",
            Request::HashTasks { .. } => "HASH_TASKS",
            Request::RegisterFileWatcher { .. } => "REGISTER_FILE_WATCHER",
            Request::ProcessInBackground { .. } => "PROCESS_IN_BACKGROUND",
            Request::RecordOutputsHash { .. } => "RECORD_OUTPUTS_HASH",
            Request::OutputsHashesMatch { .. } => "OUTPUTS_HASHES_MATCH",
            Request::Glob { .. } => "GLOB",
            Request::GetContextFileData => "GET_CONTEXT_FILE_DATA",
            Request::GetWorkspaceFiles { .. } => "GET_NX_WORKSPACE_FILES",
            Request::GetFilesInDirectory { .. } => "GET_FILES_IN_DIRECTORY",
            Request::HashGlob { .. } => "HASH_GLOB",
            Request::RequestShutdown => "REQUEST_SHUTDOWN",
        }
    }
}

/// Which changes a registered watcher wants pushed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWatcherConfig {
    pub watch_projects: WatchProjects,
    /// Also send changes to files that belong to no project.
    #[serde(default)]
    pub include_global_workspace_files: bool,
}

/// `"all"` or a list of project names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatchProjects {
    Projects(Vec<String>),
    Keyword(String),
}

impl WatchProjects {
    pub fn all() -> Self {
        WatchProjects::Keyword("all".to_string())
    }

    pub fn includes(&self, project: &str) -> bool {
        match self {
            WatchProjects::Keyword(k) => k == "all",
            WatchProjects::Projects(projects) => projects.iter().any(|p| p == project),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
}

/// `{error, projectGraph, sourceMaps, ...payload}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_graph: Option<ProjectGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_maps: Option<ConfigurationSourceMaps>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(WireError {
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    /// Add a payload field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.payload.insert(key.to_string(), value);
                self
            }
            Err(e) => Self::error(format!("failed to serialize {key}: {e}")),
        }
    }

    /// Remove and decode a payload field.
    pub fn take<T: DeserializeOwned>(&mut self, key: &str) -> Result<T, DaemonError> {
        let value = self.payload.remove(key).unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

/// Write one message and its terminating newline.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw message line, without the newline. `None` at end of stream.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, DaemonError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn requests_are_tagged_by_type() {
        let value = serde_json::to_value(Request::RequestProjectGraph).unwrap();
        assert_eq!(value, json!({"type": "REQUEST_PROJECT_GRAPH"}));

        let files = Request::GetWorkspaceFiles {
            project_root_map: BTreeMap::from([("libs/a".to_string(), "a".to_string())]),
        };
        let value = serde_json::to_value(&files).unwrap();
        assert_eq!(
            value,
            json!({"type": "GET_NX_WORKSPACE_FILES", "projectRootMap": {"libs/a": "a"}})
        );
        assert_eq!(files.kind(), "GET_NX_WORKSPACE_FILES");
        // The short name is still accepted.
        let short = json!({"type": "GET_WORKSPACE_FILES", "projectRootMap": {"libs/a": "a"}});
        let parsed: Request = serde_json::from_value(short).unwrap();
        assert_eq!(parsed, files);

        let watcher: Request = serde_json::from_value(json!({
            "type": "REGISTER_FILE_WATCHER",
            "config": {"watchProjects": "all", "includeGlobalWorkspaceFiles": true}
        }))
        .unwrap();
        let Request::RegisterFileWatcher { config } = watcher else {
            panic!("wrong variant");
        };
        assert!(config.watch_projects.includes("anything"));
    }

    #[test]
    fn response_payload_is_flattened() {
        let response = Response::ok().with("files", vec!["a.rs"]);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"error": null, "files": ["a.rs"]}));

        let mut back: Response = serde_json::from_value(value).unwrap();
        let files: Vec<String> = back.take("files").unwrap();
        assert_eq!(files, vec!["a.rs"]);
    }

    #[tokio::test]
    async fn messages_are_newline_delimited() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::RequestShutdown).await.unwrap();
        write_message(&mut buf, &Request::GetFilesInDirectory { dir: "a\nb".into() })
            .await
            .unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 2);

        let mut reader = BufReader::new(buf.as_slice());
        let first = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Request>(&first).unwrap(), Request::RequestShutdown);
        let second = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Request>(&second).unwrap(),
            Request::GetFilesInDirectory { dir: "a\nb".into() }
        );
        assert!(read_line(&mut reader).await.unwrap().is_none());
    }
}
