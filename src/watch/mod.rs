// src/watch/mod.rs

//! File watching.
//!
//! Wires a cross-platform `notify` watcher to an async channel and turns raw
//! events into workspace-relative [`ChangedFiles`] sets. Deciding what to do
//! with a change (recompute the graph, notify clients) is the daemon's job.

pub mod events;
pub mod watcher;

pub use events::{classify_event, ChangeType, ChangedFile, ChangedFiles};
pub use watcher::{spawn_watcher, WatcherHandle};
