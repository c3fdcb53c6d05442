// src/daemon/process.rs

//! The daemon's on-disk footprint inside the workspace:
//! `<workspace>/.monodag/workspace-data/d/` holds `daemon.log`,
//! `server-process.json` and the optional `disabled` marker.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::workspace::workspace_data_dir;

pub const DAEMON_LOG_FILE: &str = "daemon.log";
pub const PROCESS_RECORD_FILE: &str = "server-process.json";
pub const DISABLED_MARKER_FILE: &str = "disabled";

pub fn daemon_dir(workspace_root: &Path) -> PathBuf {
    workspace_data_dir(workspace_root).join("d")
}

pub fn daemon_log_path(workspace_root: &Path) -> PathBuf {
    daemon_dir(workspace_root).join(DAEMON_LOG_FILE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub process_id: u32,
}

pub fn read_process_record(workspace_root: &Path) -> Option<ProcessRecord> {
    let path = daemon_dir(workspace_root).join(PROCESS_RECORD_FILE);
    let contents = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(?path, error = %e, "ignoring unreadable daemon process record");
            None
        }
    }
}

/// Record the current process as the workspace's daemon.
pub fn write_process_record(workspace_root: &Path) -> io::Result<()> {
    let dir = daemon_dir(workspace_root);
    fs::create_dir_all(&dir)?;
    let record = ProcessRecord {
        process_id: std::process::id(),
    };
    let json = serde_json::to_string(&record)?;
    fs::write(dir.join(PROCESS_RECORD_FILE), json)
}

/// Remove the record, but only if it still names `pid`. A newer daemon
/// may already have replaced it.
pub fn delete_process_record_for(workspace_root: &Path, pid: u32) {
    let matches = read_process_record(workspace_root).is_some_and(|r| r.process_id == pid);
    if matches {
        remove_process_record(workspace_root);
    }
}

pub fn remove_process_record(workspace_root: &Path) {
    let path = daemon_dir(workspace_root).join(PROCESS_RECORD_FILE);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(?path, error = %e, "failed to remove daemon process record");
        }
    }
}

pub fn is_marked_disabled(workspace_root: &Path) -> bool {
    daemon_dir(workspace_root).join(DISABLED_MARKER_FILE).exists()
}

/// Stop clients from starting a daemon for this workspace until `reset`.
pub fn mark_disabled(workspace_root: &Path) -> io::Result<()> {
    let dir = daemon_dir(workspace_root);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(DISABLED_MARKER_FILE), "true")
}

/// The last `lines` lines of the daemon log, or an empty string.
pub fn read_log_tail(workspace_root: &Path, lines: usize) -> String {
    let Ok(contents) = fs::read_to_string(daemon_log_path(workspace_root)) else {
        return String::new();
    };
    let all: Vec<&str> = contents.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs the permission and existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Send SIGTERM. Returns false if the process could not be signalled.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> bool {
    debug!(pid, "sending SIGTERM to daemon");
    // SAFETY: plain syscall with no memory arguments.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> bool {
    debug!(pid, "terminating daemon is not supported on this platform");
    false
}
