// src/exec/task_runner.rs

//! Shell backend for `run-commands` and `run-script` targets.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::Result;
use crate::exec::backend::{BoxFuture, ExecutionRequest, ExecutionResult, ExecutorBackend};
use crate::types::{RUN_COMMANDS_EXECUTOR, RUN_SCRIPT_EXECUTOR};

/// Runs tasks through the platform shell.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Echo task output to this process's stdout/stderr as it arrives.
    pub stream_output: bool,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self { stream_output: true }
    }
}

/// Commands to run, in order, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommands {
    pub commands: Vec<String>,
    pub cwd: PathBuf,
}

/// Translate a request into shell commands.
///
/// `run-commands` reads `command` or `commands` (strings or
/// `{command}` objects) and an optional `cwd` relative to the workspace
/// root; the project root is the default. `run-script` runs
/// `npm run <script>` in the project root. An `args` string option is
/// appended to a single command.
pub fn shell_commands_for(request: &ExecutionRequest) -> anyhow::Result<ShellCommands> {
    let project_root = request.workspace_root.join(&request.task.project_root);
    let executor = request.executor.as_deref().unwrap_or(RUN_COMMANDS_EXECUTOR);

    let (mut commands, cwd) = match executor {
        RUN_COMMANDS_EXECUTOR => {
            let commands = match (request.options.get("command"), request.options.get("commands")) {
                (Some(Value::String(command)), _) => vec![command.clone()],
                (_, Some(Value::Array(entries))) => entries
                    .iter()
                    .map(|entry| match entry {
                        Value::String(s) => Ok(s.clone()),
                        Value::Object(o) => o
                            .get("command")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| anyhow!("commands entry without a command")),
                        other => Err(anyhow!("invalid commands entry: {other}")),
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?,
                _ => bail!("task {} has no command to run", request.task.id),
            };
            let cwd = match request.options.get("cwd").and_then(Value::as_str) {
                Some(cwd) => request.workspace_root.join(cwd),
                None => project_root,
            };
            (commands, cwd)
        }
        RUN_SCRIPT_EXECUTOR => {
            let script = request
                .options
                .get("script")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("task {} has no script to run", request.task.id))?;
            (vec![format!("npm run {script}")], project_root)
        }
        other => bail!("no shell runner for executor '{other}' (task {})", request.task.id),
    };

    let args = request.options.get("args").and_then(Value::as_str);
    if let (Some(args), [single]) = (args, commands.as_mut_slice()) {
        single.push(' ');
        single.push_str(args);
    }
    Ok(ShellCommands { commands, cwd })
}

impl ExecutorBackend for ShellExecutor {
    fn run_task(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionResult>> {
        Box::pin(async move {
            let shell = shell_commands_for(&request)?;
            let mut terminal_output = String::new();
            for command in &shell.commands {
                let result = self.run_command(&request, command, &shell.cwd).await?;
                terminal_output.push_str(&result.terminal_output);
                if !result.success() {
                    return Ok(ExecutionResult {
                        code: result.code,
                        terminal_output,
                    });
                }
            }
            Ok(ExecutionResult {
                code: 0,
                terminal_output,
            })
        })
    }
}

impl ShellExecutor {
    async fn run_command(
        &self,
        request: &ExecutionRequest,
        command: &str,
        cwd: &PathBuf,
    ) -> Result<ExecutionResult> {
        let task = &request.task;
        info!(task = %task.id, cmd = %command, "starting task process");

        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };
        cmd.current_dir(cwd)
            .env("MONODAG_TASK_TARGET_PROJECT", &task.target.project)
            .env("MONODAG_TASK_TARGET_TARGET", &task.target.target)
            .env("MONODAG_TASK_HASH", task.hash.as_deref().unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(configuration) = &task.target.configuration {
            cmd.env("MONODAG_TASK_TARGET_CONFIGURATION", configuration);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for task '{}'", task.id))?;

        // Both streams feed one channel so the captured output keeps the
        // order lines arrived in.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(bool, String)>();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, false, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, true, line_tx.clone());
        }
        drop(line_tx);

        let mut terminal_output = String::new();
        while let Some((is_stderr, line)) = line_rx.recv().await {
            if self.stream_output {
                if is_stderr {
                    eprintln!("{line}");
                } else {
                    println!("{line}");
                }
            }
            terminal_output.push_str(&line);
            terminal_output.push('\n');
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for process of task '{}'", task.id))?;
        let code = status.code().unwrap_or(-1);
        info!(task = %task.id, exit_code = code, success = status.success(), "task process exited");

        Ok(ExecutionResult { code, terminal_output })
    }
}

fn forward_lines<R>(reader: R, is_stderr: bool, tx: mpsc::UnboundedSender<(bool, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((is_stderr, line)).is_err() {
                break;
            }
        }
        debug!(is_stderr, "output stream closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Task, TaskTarget};
    use serde_json::{json, Map};
    use std::path::Path;

    fn request(executor: &str, options: Value) -> ExecutionRequest {
        let options: Map<String, Value> = serde_json::from_value(options).unwrap();
        ExecutionRequest {
            task: Task {
                id: "a:build".into(),
                target: TaskTarget {
                    project: "a".into(),
                    target: "build".into(),
                    configuration: None,
                },
                overrides: Map::new(),
                outputs: vec![],
                project_root: "libs/a".into(),
                hash: None,
                hash_details: None,
                cache: true,
            },
            executor: Some(executor.into()),
            options,
            workspace_root: PathBuf::from("/ws"),
        }
    }

    #[test]
    fn run_commands_options() {
        let single = shell_commands_for(&request(
            "run-commands",
            json!({"command": "make", "args": "--fast"}),
        ))
        .unwrap();
        assert_eq!(single.commands, vec!["make --fast"]);
        assert_eq!(single.cwd, Path::new("/ws/libs/a"));

        let many = shell_commands_for(&request(
            "run-commands",
            json!({"commands": ["a", {"command": "b"}], "cwd": "tools", "args": "x"}),
        ))
        .unwrap();
        assert_eq!(many.commands, vec!["a", "b"]);
        assert_eq!(many.cwd, Path::new("/ws/tools"));

        assert!(shell_commands_for(&request("run-commands", json!({}))).is_err());
        assert!(shell_commands_for(&request("custom-executor", json!({}))).is_err());
    }

    #[test]
    fn run_script_uses_npm() {
        let script =
            shell_commands_for(&request("run-script", json!({"script": "build"}))).unwrap();
        assert_eq!(script.commands, vec!["npm run build"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("libs/a")).unwrap();
        let mut req = request(
            "run-commands",
            json!({"commands": ["echo hello", "echo oops >&2; exit 3", "echo never"]}),
        );
        req.workspace_root = dir.path().to_path_buf();

        let executor = ShellExecutor { stream_output: false };
        let result = executor.run_task(req).await.unwrap();
        assert_eq!(result.code, 3);
        assert!(result.terminal_output.contains("hello"));
        assert!(result.terminal_output.contains("oops"));
        assert!(!result.terminal_output.contains("never"));
    }
}
