// src/cache/fs_ops.rs

//! Copy/remove helpers and output expansion for the cache.

use std::fs;
use std::io;
use std::path::Path;

use crate::errors::CacheError;
use crate::fs::patterns::PathMatcher;
use crate::fs::{FileSystem, RealFileSystem};

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Remove a file or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<(), CacheError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(io_error(path)),
        Ok(_) => fs::remove_file(path).map_err(io_error(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Copy a file or a directory tree to `dest`, creating parents.
pub fn copy_path(src: &Path, dest: &Path) -> Result<(), CacheError> {
    let meta = fs::metadata(src).map_err(io_error(src))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    if meta.is_dir() {
        fs::create_dir_all(dest).map_err(io_error(dest))?;
        for entry in fs::read_dir(src).map_err(io_error(src))? {
            let entry = entry.map_err(io_error(src))?;
            copy_path(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dest).map_err(io_error(src))?;
        Ok(())
    }
}

/// Resolve outputs relative to `cwd`.
///
/// Plain paths are returned when they exist. Glob outputs
/// (`dist/**/*.js`) are expanded to the files they match. Negated outputs
/// remove matches from the result.
pub fn expand_outputs(cwd: &Path, outputs: &[String]) -> Result<Vec<String>, CacheError> {
    let (negated, positive): (Vec<&String>, Vec<&String>) =
        outputs.iter().partition(|o| o.starts_with('!'));
    let exclude: Vec<&str> = negated.iter().map(|o| &o[1..]).collect();
    let excluder = PathMatcher::new(&exclude, &[]).map_err(|e| CacheError::Pattern(e.to_string()))?;
    let excluded = |p: &str| !exclude.is_empty() && excluder.matches(p);

    let mut result = Vec::new();
    for output in positive {
        if !is_glob(output) {
            if cwd.join(output).exists() && !excluded(output) {
                result.push(output.clone());
            }
            continue;
        }

        let base = glob_base(output);
        let base_path = cwd.join(&base);
        if !base_path.is_dir() {
            continue;
        }
        let matcher = PathMatcher::single(output).map_err(|e| CacheError::Pattern(e.to_string()))?;
        let files = RealFileSystem.list_files(&base_path)?;
        for file in files {
            let rel = if base.is_empty() { file } else { format!("{base}/{file}") };
            if matcher.matches(&rel) && !excluded(&rel) {
                result.push(rel);
            }
        }
    }
    result.sort();
    result.dedup();
    Ok(result)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Leading path segments without glob characters.
fn glob_base(pattern: &str) -> String {
    pattern
        .split('/')
        .take_while(|segment| !is_glob(segment))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_plain_and_glob_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("dist/a/sub")).unwrap();
        fs::write(root.join("dist/a/main.js"), "js").unwrap();
        fs::write(root.join("dist/a/sub/util.js"), "js").unwrap();
        fs::write(root.join("dist/a/main.js.map"), "map").unwrap();
        fs::write(root.join("report.txt"), "r").unwrap();

        let outputs = vec![
            "dist/a/**/*.js".to_string(),
            "!dist/a/sub/**".to_string(),
            "report.txt".to_string(),
            "missing".to_string(),
        ];
        assert_eq!(
            expand_outputs(root, &outputs).unwrap(),
            vec!["dist/a/main.js", "report.txt"]
        );
    }

    #[test]
    fn copies_and_removes_trees() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file"), "x").unwrap();

        let dest = dir.path().join("out/copy");
        copy_path(&src, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("nested/file")).unwrap(), "x");

        remove_path(&dest).unwrap();
        assert!(!dest.exists());
        remove_path(&dest).unwrap();
    }
}
