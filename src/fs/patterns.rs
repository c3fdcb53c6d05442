// src/fs/patterns.rs

use std::fmt;

use anyhow::{Context, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

/// Compiled include/exclude glob patterns evaluated against workspace-relative
/// paths such as `"libs/a/src/lib.rs"`.
///
/// Patterns prefixed with `!` in the include list are treated as excludes, so
/// a single list like `["libs/**", "!libs/**/*.md"]` works as expected.
#[derive(Clone)]
pub struct PathMatcher {
    include: GlobSet,
    exclude: Option<GlobSet>,
    include_all: bool,
}

impl fmt::Debug for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathMatcher")
            .field("include_all", &self.include_all)
            .finish_non_exhaustive()
    }
}

impl PathMatcher {
    /// Build a matcher. An empty `include` list matches everything.
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self> {
        let mut includes = Vec::new();
        let mut excludes: Vec<String> = exclude.iter().map(|s| s.as_ref().to_string()).collect();

        for pattern in include {
            match pattern.as_ref().strip_prefix('!') {
                Some(negated) => excludes.push(negated.to_string()),
                None => includes.push(pattern.as_ref().to_string()),
            }
        }

        let include_all = includes.is_empty();
        let include = build_globset(&includes).context("building include globset")?;
        let exclude = if excludes.is_empty() {
            None
        } else {
            Some(build_globset(&excludes).context("building exclude globset")?)
        };

        Ok(Self {
            include,
            exclude,
            include_all,
        })
    }

    /// Matcher for a single pattern.
    pub fn single(pattern: &str) -> Result<Self> {
        Self::new(&[pattern], &[])
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        if !self.include_all && !self.include.is_match(rel_path) {
            return false;
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(rel_path) {
                return false;
            }
        }
        true
    }

    /// Keep the paths that match, preserving order.
    pub fn filter<'a, I>(&self, paths: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        paths
            .into_iter()
            .filter(|p| self.matches(p))
            .cloned()
            .collect()
    }
}

/// Build a GlobSet where `*` does not cross `/` and dotfiles are matched.
pub fn build_globset<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        builder.add(compile_glob(pat.as_ref())?);
    }
    Ok(builder.build()?)
}

fn compile_glob(pattern: &str) -> Result<Glob> {
    let normalized = pattern.trim_start_matches("./");
    GlobBuilder::new(normalized)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid glob pattern: {pattern}"))
}

/// Join `{a,b}`-style alternatives into one pattern.
pub fn combine_glob_patterns<S: AsRef<str>>(patterns: &[S]) -> String {
    match patterns {
        [] => String::new(),
        [single] => single.as_ref().to_string(),
        many => format!(
            "{{{}}}",
            many.iter().map(|p| p.as_ref()).collect::<Vec<_>>().join(",")
        ),
    }
}
