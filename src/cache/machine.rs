// src/cache/machine.rs

use std::fs;

use sha2::{Digest, Sha256};
use tracing::debug;

const MACHINE_ID_FILES: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Stable identifier of this machine, recorded in every cache entry.
///
/// `MONODAG_MACHINE_ID` wins when set. Otherwise the OS machine id (or the
/// host name) is hashed with sha256. Empty when nothing is available, in
/// which case entries are never rejected.
pub fn current_machine_id() -> String {
    if let Ok(id) = std::env::var("MONODAG_MACHINE_ID") {
        return id;
    }

    let raw = MACHINE_ID_FILES
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok());

    match raw {
        Some(raw) => sha256_hex(raw.as_bytes()),
        None => {
            debug!("unable to determine machine id");
            String::new()
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
