// src/daemon/mod.rs

//! The background process that keeps the project graph warm, and the
//! client commands use to talk to it over a Unix domain socket.

pub mod client;
pub mod process;
pub mod protocol;
pub mod server;
pub mod socket;

pub use client::{daemon_enabled, DaemonClient, FileWatcherNotification, FileWatcherStream};
pub use protocol::{FileWatcherConfig, Request, Response, WatchProjects};
pub use server::{run_server, serve, ServerContext, ServerOptions};
