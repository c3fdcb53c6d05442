// src/daemon/socket.rs

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cache::machine::sha256_hex;
use crate::daemon::process::daemon_dir;

pub const SOCKET_DIR_ENV: &str = "MONODAG_DAEMON_SOCKET_DIR";
pub const SOCKET_FILE: &str = "d.sock";

/// Directory holding the daemon socket.
///
/// `MONODAG_DAEMON_SOCKET_DIR` when set, otherwise a per-workspace directory
/// in the system temp dir named by the first 20 hex characters of
/// sha256(lowercased workspace root). Socket paths have a short length
/// limit, hence temp rather than the workspace. Falls back to the daemon
/// directory if the temp dir is not writable.
pub fn socket_dir(workspace_root: &Path) -> PathBuf {
    if let Some(dir) = std::env::var_os(SOCKET_DIR_ENV) {
        return PathBuf::from(dir);
    }

    let key = workspace_root.to_string_lossy().to_lowercase();
    let dir = std::env::temp_dir().join(&sha256_hex(key.as_bytes())[..20]);
    match fs::create_dir_all(&dir) {
        Ok(()) => dir,
        Err(e) => {
            warn!(?dir, error = %e, "socket directory not writable; using the daemon directory");
            daemon_dir(workspace_root)
        }
    }
}

pub fn socket_path(workspace_root: &Path) -> PathBuf {
    socket_dir(workspace_root).join(SOCKET_FILE)
}

/// Remove a socket file. Missing is fine.
pub fn kill_socket(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(?path, "removed socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(?path, error = %e, "failed to remove socket"),
    }
}

pub fn remove_socket_dir(workspace_root: &Path) {
    let dir = socket_dir(workspace_root);
    if let Err(e) = fs::remove_dir_all(&dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(?dir, error = %e, "failed to remove socket directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_dir_depends_on_lowercased_root() {
        if std::env::var_os(SOCKET_DIR_ENV).is_some() {
            return;
        }
        let a = socket_dir(Path::new("/Work/Repo"));
        let b = socket_dir(Path::new("/work/repo"));
        let c = socket_dir(Path::new("/work/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.file_name().unwrap().len(), 20);
        assert_eq!(socket_path(Path::new("/work/repo")), a.join(SOCKET_FILE));
    }
}
