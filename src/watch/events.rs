// src/watch/events.rs

use std::collections::BTreeSet;
use std::path::{Component, Path};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use serde::{Deserialize, Serialize};

use crate::fs::{relative_str, ALWAYS_IGNORED_DIRS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// One changed path, as pushed to registered file watchers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
}

/// Workspace-relative paths touched by one or more watcher events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFiles {
    pub created: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChangedFiles {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Fold `other` in. A later delete wins over an earlier create/update and
    /// vice versa.
    pub fn merge(&mut self, other: ChangedFiles) {
        for path in other.deleted {
            self.created.remove(&path);
            self.updated.remove(&path);
            self.deleted.insert(path);
        }
        for path in other.created {
            self.deleted.remove(&path);
            self.created.insert(path);
        }
        for path in other.updated {
            if !self.created.contains(&path) {
                self.deleted.remove(&path);
                self.updated.insert(path);
            }
        }
    }

    pub fn to_changed_files(&self) -> Vec<ChangedFile> {
        let tag = |paths: &BTreeSet<String>, change_type| {
            paths
                .iter()
                .map(move |path| ChangedFile {
                    path: path.clone(),
                    change_type,
                })
                .collect::<Vec<_>>()
        };
        let mut out = tag(&self.created, ChangeType::Create);
        out.extend(tag(&self.updated, ChangeType::Update));
        out.extend(tag(&self.deleted, ChangeType::Delete));
        out
    }
}

fn is_ignored(rel: &str) -> bool {
    Path::new(rel).components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| ALWAYS_IGNORED_DIRS.contains(&name)),
        _ => false,
    })
}

/// Classify a notify event into created/updated/deleted relative paths.
///
/// Paths outside `root`, under an ignored directory, or naming a directory
/// are dropped. Access events carry no change.
pub fn classify_event(root: &Path, event: &Event) -> ChangedFiles {
    let mut changes = ChangedFiles::default();
    let mut push = |path: &Path, change_type: ChangeType| {
        let Some(rel) = relative_str(root, path) else {
            return;
        };
        if rel.is_empty() || is_ignored(&rel) {
            return;
        }
        if change_type != ChangeType::Delete && path.is_dir() {
            return;
        }
        match change_type {
            ChangeType::Create => changes.created.insert(rel),
            ChangeType::Update => changes.updated.insert(rel),
            ChangeType::Delete => changes.deleted.insert(rel),
        };
    };

    match &event.kind {
        EventKind::Create(_) => event.paths.iter().for_each(|p| push(p, ChangeType::Create)),
        EventKind::Remove(_) => event.paths.iter().for_each(|p| push(p, ChangeType::Delete)),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().for_each(|p| push(p, ChangeType::Delete))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().for_each(|p| push(p, ChangeType::Create))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                push(from, ChangeType::Delete);
                push(to, ChangeType::Create);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Unknown rename direction: look at what is on disk now.
            for path in &event.paths {
                if path.exists() {
                    push(path, ChangeType::Create);
                } else {
                    push(path, ChangeType::Delete);
                }
            }
        }
        EventKind::Modify(_) | EventKind::Any => {
            event.paths.iter().for_each(|p| push(p, ChangeType::Update))
        }
        EventKind::Access(_) | EventKind::Other => {}
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(p.to_path_buf());
        }
        event
    }

    #[test]
    fn classifies_create_modify_remove_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("libs/a")).unwrap();
        fs::write(root.join("libs/a/new.rs"), "").unwrap();
        fs::write(root.join("libs/a/lib.rs"), "").unwrap();

        let created = classify_event(
            root,
            &event(EventKind::Create(CreateKind::File), &[&root.join("libs/a/new.rs")]),
        );
        assert!(created.created.contains("libs/a/new.rs"));

        let updated = classify_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &[&root.join("libs/a/lib.rs")],
            ),
        );
        assert!(updated.updated.contains("libs/a/lib.rs"));

        let removed = classify_event(
            root,
            &event(EventKind::Remove(RemoveKind::File), &[&root.join("libs/a/gone.rs")]),
        );
        assert!(removed.deleted.contains("libs/a/gone.rs"));

        let renamed = classify_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &[&root.join("libs/a/old.rs"), &root.join("libs/a/new.rs")],
            ),
        );
        assert!(renamed.deleted.contains("libs/a/old.rs"));
        assert!(renamed.created.contains("libs/a/new.rs"));
    }

    #[test]
    fn drops_ignored_dirs_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("node_modules/x")).unwrap();
        fs::create_dir_all(root.join("libs/a")).unwrap();
        fs::write(root.join("node_modules/x/index.js"), "").unwrap();

        let changes = classify_event(
            root,
            &event(
                EventKind::Create(CreateKind::Any),
                &[&root.join("node_modules/x/index.js"), &root.join("libs/a")],
            ),
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn merge_lets_the_latest_change_win() {
        let mut acc = ChangedFiles::default();
        acc.created.insert("a".into());
        acc.updated.insert("b".into());

        let mut later = ChangedFiles::default();
        later.deleted.insert("a".into());
        later.updated.insert("c".into());
        acc.merge(later);

        assert!(acc.created.is_empty());
        assert_eq!(acc.deleted.iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(acc.updated.iter().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(acc.to_changed_files().len(), 3);
    }
}
