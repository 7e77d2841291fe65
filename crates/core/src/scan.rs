//! Directory enumeration via the `ignore` crate

use std::path::{Path, PathBuf};

use color_eyre::Result;
use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use tracing::warn;

/// Lists the regular files under a root
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    /// Glob patterns to leave out, relative to the root
    excludes: Vec<String>,
    respect_gitignore: bool,
}

impl Scanner {
    /// Create a scanner for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: Vec::new(),
            respect_gitignore: false,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Leave out files matching a glob
    #[must_use]
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Honour `.gitignore`, global gitignore and `.git/info/exclude`
    #[must_use]
    pub fn respect_gitignore(mut self, yes: bool) -> Self {
        self.respect_gitignore = yes;
        self
    }

    fn exclude_matcher(&self) -> Result<Override> {
        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.excludes {
            overrides.add(&format!("!{pattern}"))?;
        }
        Ok(overrides.build()?)
    }

    fn walk_builder(&self) -> Result<WalkBuilder> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .ignore(false)
            .parents(false)
            .git_ignore(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .require_git(false)
            .follow_links(false)
            .overrides(self.exclude_matcher()?)
            .filter_entry(|e| e.file_name() != ".git");
        Ok(builder)
    }

    /// Relative paths of every regular file, sorted.
    ///
    /// Entries that cannot be read are logged and left out.
    ///
    /// # Errors
    /// Returns an error if an exclude pattern is not a valid glob
    pub fn list_regular_files(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();

        for result in self.walk_builder()?.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable entry under {}: {e}", self.root.display());
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                paths.push(relative.to_path_buf());
            }
        }

        paths.sort();
        Ok(paths)
    }
}
