// src/daemon/client.rs

//! Talking to the daemon from a command invocation.
//!
//! Requests go through a FIFO queue with one in flight. If nothing is
//! listening on the socket the client starts a detached daemon and waits
//! for it to come up.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkspaceConfig;
use crate::dag::{Task, TaskGraph};
use crate::daemon::process::{
    daemon_dir, daemon_log_path, is_marked_disabled, process_alive, read_log_tail,
    read_process_record, remove_process_record, terminate_process,
};
use crate::daemon::protocol::{read_line, write_message, FileWatcherConfig, Request, Response};
use crate::daemon::socket::{kill_socket, remove_socket_dir, socket_path};
use crate::errors::DaemonError;
use crate::graph::{ConfigurationSourceMaps, ProjectGraph};
use crate::hasher::TaskHash;
use crate::watch::ChangedFile;
use crate::workspace::{FileData, FileMap};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const START_POLL_ATTEMPTS: u32 = 6000;
const STOP_POLL_ATTEMPTS: u32 = 200;
const MALFORMED_TAIL_CHARS: usize = 300;
const LOG_TAIL_LINES: usize = 20;

/// Whether commands in this workspace should use the daemon.
///
/// `MONODAG_DAEMON` wins when set. Otherwise the daemon is off in CI, when
/// the workspace config sets `use_daemon_process = false`, or when a
/// previous failure left the `disabled` marker.
pub fn daemon_enabled(workspace_root: &Path, config: &WorkspaceConfig) -> bool {
    let env = std::env::var("MONODAG_DAEMON").ok();
    let ci = std::env::var("CI").is_ok_and(|v| v == "true" || v == "1");
    daemon_enabled_with(workspace_root, config, env.as_deref(), ci)
}

fn daemon_enabled_with(
    workspace_root: &Path,
    config: &WorkspaceConfig,
    env: Option<&str>,
    ci: bool,
) -> bool {
    if is_marked_disabled(workspace_root) {
        return false;
    }
    match env {
        Some("false") | Some("0") => false,
        Some("true") | Some("1") => true,
        _ => !ci && config.workspace.use_daemon_process,
    }
}

/// Push notification received by a registered file watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct FileWatcherNotification {
    pub changed_projects: Vec<String>,
    pub changed_files: Vec<ChangedFile>,
}

/// Stream of notifications for one registered watcher. Dropping it closes
/// the connection, which deregisters the watcher on the server.
#[derive(Debug)]
pub struct FileWatcherStream {
    reader: BufReader<OwnedReadHalf>,
    _writer: tokio::net::unix::OwnedWriteHalf,
    workspace_root: PathBuf,
}

impl FileWatcherStream {
    /// The next notification; `None` once the daemon closes the connection.
    pub async fn next(&mut self) -> Result<Option<FileWatcherNotification>, DaemonError> {
        let Some(line) = read_line(&mut self.reader).await? else {
            return Ok(None);
        };
        let mut response = decode_response(&line, &self.workspace_root)?;
        if let Some(error) = response.error.take() {
            return Err(DaemonError::Server(error.message));
        }
        Ok(Some(FileWatcherNotification {
            changed_projects: response.take("changedProjects")?,
            changed_files: response.take("changedFiles")?,
        }))
    }
}

#[derive(Debug)]
pub struct DaemonClient {
    workspace_root: PathBuf,
    socket_path: PathBuf,
    queue: Mutex<()>,
}

impl DaemonClient {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let socket_path = socket_path(&workspace_root);
        Self::with_socket_path(workspace_root, socket_path)
    }

    pub fn with_socket_path(
        workspace_root: impl Into<PathBuf>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            socket_path: socket_path.into(),
            queue: Mutex::new(()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Something accepts connections on the socket.
    pub async fn is_server_available(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// Send one request, starting the daemon first if needed.
    pub async fn send(&self, request: &Request) -> Result<Response, DaemonError> {
        // tokio's Mutex is fair, so waiters are served in FIFO order.
        let _turn = self.queue.lock().await;
        if !self.is_server_available().await {
            self.start_in_background().await?;
        }
        self.send_once(request).await
    }

    /// Send one request to an already running daemon.
    pub async fn send_once(&self, request: &Request) -> Result<Response, DaemonError> {
        debug!(request = request.kind(), "sending daemon request");
        let stream = self.connect().await?;
        let (read, mut write) = stream.into_split();
        write_message(&mut write, request).await.map_err(classify_daemon_error)?;

        let mut reader = BufReader::new(read);
        let line = read_line(&mut reader)
            .await
            .map_err(classify_daemon_error)?
            .ok_or(DaemonError::ConnectionReset)?;
        let mut response = decode_response(&line, &self.workspace_root)?;
        if let Some(error) = response.error.take() {
            return Err(match response.project_graph.take() {
                Some(partial) => DaemonError::ProjectGraph {
                    message: error.message,
                    partial_graph: Some(Box::new(partial)),
                },
                None => DaemonError::Server(error.message),
            });
        }
        Ok(response)
    }

    async fn connect(&self) -> Result<UnixStream, DaemonError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| self.classify_connect_error(e))
    }

    fn classify_connect_error(&self, e: io::Error) -> DaemonError {
        match e.kind() {
            io::ErrorKind::NotFound => DaemonError::NotRunning(self.socket_path.clone()),
            io::ErrorKind::ConnectionRefused => {
                kill_socket(&self.socket_path);
                DaemonError::StaleSocket
            }
            _ => classify_daemon_error(DaemonError::Io(e)),
        }
    }

    /// Spawn `<current exe> daemon --foreground` detached, with output
    /// appended to the daemon log, and wait until it accepts connections.
    pub async fn start_in_background(&self) -> Result<u32, DaemonError> {
        let log_path = daemon_log_path(&self.workspace_root);
        std::fs::create_dir_all(daemon_dir(&self.workspace_root))?;
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let exe = std::env::current_exe()?;

        let mut command = Command::new(exe);
        command
            .args(["daemon", "--foreground"])
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so the daemon outlives the invoking shell.
            command.process_group(0);
        }
        let child = command.spawn()?;
        let pid = child.id();
        info!(pid, log = ?log_path, "started daemon in the background");

        for _ in 0..START_POLL_ATTEMPTS {
            if self.is_server_available().await {
                return Ok(pid);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(DaemonError::FailedToStart(log_path))
    }

    /// Stop the recorded daemon and clean up its socket.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        match read_process_record(&self.workspace_root) {
            Some(record) => {
                if terminate_process(record.process_id) {
                    let mut attempts = 0;
                    while process_alive(record.process_id) && attempts < STOP_POLL_ATTEMPTS {
                        tokio::time::sleep(POLL_INTERVAL).await;
                        attempts += 1;
                    }
                    if process_alive(record.process_id) {
                        warn!(pid = record.process_id, "daemon did not exit in time");
                    } else {
                        info!(pid = record.process_id, "daemon stopped");
                    }
                }
                remove_process_record(&self.workspace_root);
            }
            None => debug!("no daemon process record; nothing to stop"),
        }
        kill_socket(&self.socket_path);
        remove_socket_dir(&self.workspace_root);
        Ok(())
    }

    pub async fn get_project_graph(
        &self,
    ) -> Result<(ProjectGraph, ConfigurationSourceMaps), DaemonError> {
        let mut response = self.send(&Request::RequestProjectGraph).await?;
        let graph = response.project_graph.take().unwrap_or_default();
        let source_maps = response.source_maps.take().unwrap_or_default();
        Ok((graph, source_maps))
    }

    pub async fn get_all_file_data(&self) -> Result<Vec<FileData>, DaemonError> {
        self.send(&Request::RequestFileData).await?.take("files")
    }

    pub async fn hash_tasks(
        &self,
        tasks: Vec<Task>,
        task_graph: TaskGraph,
        env: BTreeMap<String, String>,
    ) -> Result<Vec<TaskHash>, DaemonError> {
        let request = Request::HashTasks { tasks, task_graph, env };
        self.send(&request).await?.take("hashes")
    }

    pub async fn glob(
        &self,
        globs: Vec<String>,
        exclude: Vec<String>,
    ) -> Result<Vec<String>, DaemonError> {
        self.send(&Request::Glob { globs, exclude }).await?.take("files")
    }

    pub async fn hash_glob(
        &self,
        globs: Vec<String>,
        exclude: Vec<String>,
    ) -> Result<String, DaemonError> {
        self.send(&Request::HashGlob { globs, exclude }).await?.take("hash")
    }

    pub async fn get_files_in_directory(
        &self,
        dir: impl Into<String>,
    ) -> Result<Vec<String>, DaemonError> {
        self.send(&Request::GetFilesInDirectory { dir: dir.into() })
            .await?
            .take("files")
    }

    pub async fn get_context_file_data(&self) -> Result<Vec<FileData>, DaemonError> {
        self.send(&Request::GetContextFileData).await?.take("files")
    }

    /// File map for the given root → name map, plus every workspace file.
    pub async fn get_workspace_files(
        &self,
        project_root_map: BTreeMap<String, String>,
    ) -> Result<(FileMap, Vec<FileData>), DaemonError> {
        let mut response = self.send(&Request::GetWorkspaceFiles { project_root_map }).await?;
        Ok((response.take("fileMap")?, response.take("allWorkspaceFiles")?))
    }

    pub async fn record_outputs_hash(
        &self,
        outputs: Vec<String>,
        hash: String,
    ) -> Result<(), DaemonError> {
        self.send(&Request::RecordOutputsHash { outputs, hash }).await?;
        Ok(())
    }

    pub async fn outputs_hashes_match(
        &self,
        outputs: Vec<String>,
        hash: String,
    ) -> Result<bool, DaemonError> {
        self.send(&Request::OutputsHashesMatch { outputs, hash })
            .await?
            .take("matched")
    }

    pub async fn process_in_background(
        &self,
        name: impl Into<String>,
        data: Value,
    ) -> Result<Value, DaemonError> {
        let request = Request::ProcessInBackground {
            name: name.into(),
            data,
        };
        self.send(&request).await?.take("result")
    }

    /// Ask a running daemon to exit. Does not start one.
    pub async fn request_shutdown(&self) -> Result<(), DaemonError> {
        let _turn = self.queue.lock().await;
        self.send_once(&Request::RequestShutdown).await?;
        Ok(())
    }

    /// Register for change notifications on a dedicated connection.
    pub async fn register_file_watcher(
        &self,
        config: FileWatcherConfig,
    ) -> Result<FileWatcherStream, DaemonError> {
        {
            let _turn = self.queue.lock().await;
            if !self.is_server_available().await {
                self.start_in_background().await?;
            }
        }
        let stream = self.connect().await?;
        let (read, mut write) = stream.into_split();
        write_message(&mut write, &Request::RegisterFileWatcher { config })
            .await
            .map_err(classify_daemon_error)?;

        let mut reader = BufReader::new(read);
        let ack = read_line(&mut reader)
            .await
            .map_err(classify_daemon_error)?
            .ok_or(DaemonError::ConnectionReset)?;
        let mut ack = decode_response(&ack, &self.workspace_root)?;
        if let Some(error) = ack.error.take() {
            return Err(DaemonError::Server(error.message));
        }
        Ok(FileWatcherStream {
            reader,
            _writer: write,
            workspace_root: self.workspace_root.clone(),
        })
    }
}

fn classify_daemon_error(e: DaemonError) -> DaemonError {
    match e {
        DaemonError::Io(io)
            if matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ) =>
        {
            DaemonError::ConnectionReset
        }
        other => other,
    }
}

fn decode_response(line: &str, workspace_root: &Path) -> Result<Response, DaemonError> {
    serde_json::from_str(line).map_err(|e| DaemonError::MalformedResponse {
        message: e.to_string(),
        received_tail: tail_chars(line, MALFORMED_TAIL_CHARS),
        log_tail: read_log_tail(workspace_root, LOG_TAIL_LINES),
    })
}

fn tail_chars(s: &str, n: usize) -> String {
    let start = s.char_indices().rev().nth(n.saturating_sub(1)).map_or(0, |(i, _)| i);
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enablement_rules() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut config = WorkspaceConfig::default();
        config.workspace.use_daemon_process = true;

        assert!(daemon_enabled_with(root, &config, None, false));
        assert!(!daemon_enabled_with(root, &config, None, true));
        assert!(daemon_enabled_with(root, &config, Some("true"), true));
        assert!(!daemon_enabled_with(root, &config, Some("false"), false));

        config.workspace.use_daemon_process = false;
        assert!(!daemon_enabled_with(root, &config, None, false));
        assert!(daemon_enabled_with(root, &config, Some("true"), false));

        crate::daemon::process::mark_disabled(root).unwrap();
        assert!(!daemon_enabled_with(root, &config, Some("true"), false));
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 300), "ab");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[test]
    fn malformed_response_includes_tail_and_log() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(daemon_dir(dir.path())).unwrap();
        std::fs::write(daemon_log_path(dir.path()), "booting\ncrashed").unwrap();

        let long = format!("{}garbage", "x".repeat(400));
        let err = decode_response(&long, dir.path()).unwrap_err();
        let DaemonError::MalformedResponse {
            received_tail,
            log_tail,
            ..
        } = err
        else {
            panic!("expected malformed response");
        };
        assert_eq!(received_tail.chars().count(), 300);
        assert!(received_tail.ends_with("garbage"));
        assert!(log_tail.contains("crashed"));
    }

    #[tokio::test]
    async fn missing_socket_is_reported_as_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::with_socket_path(dir.path(), dir.path().join("d.sock"));
        assert!(!client.is_server_available().await);
        let err = client.send_once(&Request::RequestProjectGraph).await.unwrap_err();
        assert!(matches!(err, DaemonError::NotRunning(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_socket_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        // Bind and drop: the file stays but nothing listens.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let client = DaemonClient::with_socket_path(dir.path(), &path);
        let err = client.send_once(&Request::RequestProjectGraph).await.unwrap_err();
        assert!(matches!(err, DaemonError::StaleSocket));
        assert!(!path.exists());
    }
}
