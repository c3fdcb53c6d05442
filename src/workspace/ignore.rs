// src/workspace/ignore.rs

//! `.gitignore` and `.monodagignore` files. Ignored paths stay out of the
//! file map, so build outputs listed there never change a project's hash.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use tracing::debug;

use crate::fs::FileSystem;

/// Ignore file names, lowest precedence first. Both may appear in any
/// directory of the workspace.
pub const IGNORE_FILES: &[&str] = &[".gitignore", ".monodagignore"];

/// One directory's ignore rules, relative to that directory.
#[derive(Debug, Clone)]
struct Layer {
    dir: String,
    matcher: Gitignore,
}

/// Every ignore file of the workspace. The deepest directory with a
/// matching rule decides, as in git.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceIgnore {
    /// Deepest first.
    layers: Vec<Layer>,
}

impl WorkspaceIgnore {
    /// Read the ignore files found among `files` (workspace-relative).
    pub fn from_files<'a, I>(
        workspace_root: &Path,
        fs: &dyn FileSystem,
        files: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut by_dir: BTreeMap<String, Vec<(usize, &'a String)>> = BTreeMap::new();
        for file in files {
            let (dir, name) = match file.rsplit_once('/') {
                Some((dir, name)) => (dir, name),
                None => ("", file.as_str()),
            };
            if let Some(rank) = IGNORE_FILES.iter().position(|n| *n == name) {
                by_dir.entry(dir.to_string()).or_default().push((rank, file));
            }
        }

        let mut layers = Vec::new();
        for (dir, mut sources) in by_dir {
            sources.sort();
            let mut builder = GitignoreBuilder::new(workspace_root.join(&dir));
            for (_, file) in sources {
                let path = workspace_root.join(file);
                let contents = fs.read_to_string(&path)?;
                for line in contents.lines() {
                    builder.add_line(Some(path.clone()), line)?;
                }
            }
            layers.push(Layer {
                dir,
                matcher: builder.build()?,
            });
        }
        Ok(Self::from_layers(layers))
    }

    /// Rules of a single ignore file at the workspace root.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for line in contents.lines() {
            builder.add_line(None, line)?;
        }
        Ok(Self::from_layers(vec![Layer {
            dir: String::new(),
            matcher: builder.build()?,
        }]))
    }

    fn from_layers(mut layers: Vec<Layer>) -> Self {
        layers.retain(|l| !l.matcher.is_empty());
        layers.sort_by(|a, b| b.dir.len().cmp(&a.dir.len()).then_with(|| a.dir.cmp(&b.dir)));
        debug!(layers = layers.len(), "loaded workspace ignore files");
        Self { layers }
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        for layer in &self.layers {
            let local = if layer.dir.is_empty() {
                rel_path
            } else {
                match rel_path
                    .strip_prefix(layer.dir.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                {
                    Some(local) => local,
                    None => continue,
                }
            };
            match layer.matcher.matched_path_or_any_parents(local, false) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }
        false
    }

    /// Keep only the paths that are not ignored.
    pub fn retain(&self, files: &mut Vec<String>) {
        if !self.layers.is_empty() {
            files.retain(|f| !self.is_ignored(f));
        }
    }
}

/// Whether `rel_path` is an ignore file, at any depth.
pub fn is_ignore_file(rel_path: &str) -> bool {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    IGNORE_FILES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn gitignore_rules() {
        let rules = "# outputs\ndist/\n/coverage\nlibs/*/tmp\n\n*.log\n";
        let ignore = WorkspaceIgnore::parse(rules).unwrap();

        assert!(ignore.is_ignored("dist/main.js"));
        assert!(ignore.is_ignored("libs/a/dist/main.js"));
        assert!(ignore.is_ignored("coverage/lcov.info"));
        assert!(!ignore.is_ignored("libs/a/coverage/lcov.info"));
        assert!(ignore.is_ignored("libs/a/tmp/x"));
        assert!(ignore.is_ignored("libs/a/debug.log"));
        assert!(!ignore.is_ignored("libs/a/src/lib.rs"));
    }

    #[test]
    fn negation_brings_files_back() {
        let ignore = WorkspaceIgnore::parse("*.log\n!keep.log\n").unwrap();
        assert!(ignore.is_ignored("debug.log"));
        assert!(!ignore.is_ignored("keep.log"));
        assert!(!ignore.is_ignored("libs/a/keep.log"));
    }

    #[test]
    fn nested_files_apply_below_their_directory() {
        let fs = MockFileSystem::new();
        fs.add_file("/ws/.gitignore", "*.tmp\n");
        fs.add_file("/ws/.monodagignore", "scratch/\n");
        fs.add_file("/ws/libs/a/.gitignore", "out/\n!special.tmp\n");
        let files: Vec<String> = vec![
            ".gitignore".into(),
            ".monodagignore".into(),
            "libs/a/.gitignore".into(),
            "libs/a/src/lib.rs".into(),
        ];
        let ignore = WorkspaceIgnore::from_files(Path::new("/ws"), &fs, &files).unwrap();

        assert!(ignore.is_ignored("libs/a/out/x.js"));
        assert!(!ignore.is_ignored("libs/b/out/x.js"));
        assert!(ignore.is_ignored("libs/b/x.tmp"));
        assert!(!ignore.is_ignored("libs/a/special.tmp"));
        assert!(ignore.is_ignored("scratch/notes.md"));
        assert!(!ignore.is_ignored("libs/a/src/lib.rs"));
    }

    #[test]
    fn empty_ignores_nothing() {
        let ignore = WorkspaceIgnore::parse("").unwrap();
        assert!(!ignore.is_ignored("anything"));
        assert!(is_ignore_file("libs/a/.gitignore"));
        assert!(!is_ignore_file("libs/a/gitignore.rs"));
    }
}
