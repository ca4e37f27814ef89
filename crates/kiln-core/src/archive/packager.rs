//! Build a deployable archive from a project tree.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::{relative_name, ArchiveError, ArchiveResult, TarballCodec};
use crate::descriptor::{DEPENDENCY_FILE, DESCRIPTOR_FILE};

/// File name written by [`ArtifactPackager::package_project`].
pub const DEFAULT_ARCHIVE_NAME: &str = "agent.tar.gz";

const DEFAULT_EXCLUDED_NAMES: &[&str] = &[
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "env",
    ".env",
    ".env.local",
    "node_modules",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".DS_Store",
    ".idea",
    ".vscode",
    "target",
];

const DEFAULT_EXCLUDED_SUFFIXES: &[&str] = &["pyc", "pyo", "pyd", "log", "swp", "tmp"];

/// Exclusion rules applied to every file except the required ones.
///
/// A file is excluded when any path segment equals a name, its extension
/// equals a suffix, or a token occurs anywhere in its relative path. The
/// token rule is a plain substring match: with the default tokens,
/// `environment.rhai` is excluded because it contains `env`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExcludeRules {
    pub names: BTreeSet<String>,
    /// Extensions without the leading dot.
    pub suffixes: BTreeSet<String>,
    pub tokens: Vec<String>,
    /// File names always included, at any depth.
    pub required: BTreeSet<String>,
}

impl Default for ExcludeRules {
    fn default() -> Self {
        Self {
            names: DEFAULT_EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect(),
            suffixes: DEFAULT_EXCLUDED_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tokens: DEFAULT_EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect(),
            required: [DESCRIPTOR_FILE, DEPENDENCY_FILE]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ExcludeRules {
    /// Rules with nothing excluded and only the required files pinned.
    pub fn empty() -> Self {
        Self {
            names: BTreeSet::new(),
            suffixes: BTreeSet::new(),
            tokens: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffixes
            .insert(suffix.into().trim_start_matches('.').to_string());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.push(token.into());
        self
    }

    /// Decide whether a `/`-separated relative path is left out of the archive.
    pub fn should_exclude(&self, rel_path: &str) -> bool {
        let segments: Vec<&str> = rel_path.split('/').filter(|s| !s.is_empty()).collect();
        let file_name = segments.last().copied().unwrap_or_default();

        if self.required.contains(file_name) {
            return false;
        }
        if segments.iter().any(|s| self.names.contains(*s)) {
            return true;
        }
        if let Some((_, ext)) = file_name.rsplit_once('.') {
            if self.suffixes.contains(ext) {
                return true;
            }
        }
        self.tokens.iter().any(|t| rel_path.contains(t.as_str()))
    }
}

/// Result of a packaging run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageSummary {
    pub archive_path: PathBuf,
    /// Relative paths written, in archive order.
    pub included: Vec<String>,
    pub excluded: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactPackager {
    rules: ExcludeRules,
}

impl ArtifactPackager {
    pub fn new(rules: ExcludeRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ExcludeRules {
        &self.rules
    }

    pub fn should_exclude(&self, rel_path: &str) -> bool {
        self.rules.should_exclude(rel_path)
    }

    /// Package `source_dir` into the archive at `dest_path`.
    ///
    /// Excluded directories are still walked, so a required file nested
    /// under one (e.g. `target/kiln.toml`) is included.
    pub fn package(&self, source_dir: &Path, dest_path: &Path) -> ArchiveResult<PackageSummary> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::Io {
                path: source_dir.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "source directory does not exist",
                ),
            });
        }
        let dest_abs = std::path::absolute(dest_path).map_err(|source| ArchiveError::Io {
            path: dest_path.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::new();
        let mut excluded = 0usize;
        for entry in WalkDir::new(source_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| ArchiveError::Io {
                path: e.path().unwrap_or(source_dir).to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if std::path::absolute(entry.path()).ok().as_deref() == Some(dest_abs.as_path()) {
                continue;
            }

            let rel = relative_name(source_dir, entry.path());
            if self.rules.should_exclude(&rel) {
                tracing::trace!(path = %rel, "excluded from archive");
                excluded += 1;
                continue;
            }
            entries.push((entry.into_path(), rel));
        }

        TarballCodec::create_from_entries(&entries, dest_path)?;

        let summary = PackageSummary {
            archive_path: dest_path.to_path_buf(),
            included: entries.into_iter().map(|(_, rel)| rel).collect(),
            excluded,
        };
        tracing::info!(
            archive = %summary.archive_path.display(),
            included = summary.included.len(),
            excluded = summary.excluded,
            "project packaged"
        );
        Ok(summary)
    }

    /// Package `project_root` into `<output_dir>/agent.tar.gz`.
    pub fn package_project(&self, project_root: &Path, output_dir: &Path) -> ArchiveResult<PackageSummary> {
        fs::create_dir_all(output_dir).map_err(|source| ArchiveError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        self.package(project_root, &output_dir.join(DEFAULT_ARCHIVE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excluded_segment_anywhere_in_path() {
        let rules = ExcludeRules::default();
        assert!(rules.should_exclude("node_modules/pkg/index.js"));
        assert!(rules.should_exclude("src/__pycache__/mod.pyc"));
        assert!(rules.should_exclude(".git/HEAD"));
        assert!(!rules.should_exclude("src/main.rhai"));
    }

    #[test]
    fn excluded_suffixes() {
        let rules = ExcludeRules::default();
        assert!(rules.should_exclude("debug.log"));
        assert!(rules.should_exclude("cache/blob.tmp"));
        assert!(!rules.should_exclude("catalog.rhai"));
    }

    #[test]
    fn required_files_survive_every_rule() {
        let rules = ExcludeRules::default();
        assert!(!rules.should_exclude("kiln.toml"));
        assert!(!rules.should_exclude("target/kiln.toml"));
        assert!(!rules.should_exclude(".venv/nested/dependencies.toml"));
    }

    #[test]
    fn token_rule_over_excludes_by_substring() {
        let rules = ExcludeRules::default();
        assert!(rules.should_exclude("environment.rhai"));
        assert!(rules.should_exclude("lib/targets.rhai"));
        assert!(!rules.should_exclude("lib/tar_gets.rhai"));
    }

    #[test]
    fn empty_rules_keep_everything() {
        let rules = ExcludeRules::empty().with_suffix(".bak");
        assert!(!rules.should_exclude("environment.rhai"));
        assert!(!rules.should_exclude("node_modules/x.js"));
        assert!(rules.should_exclude("old.bak"));
    }
}
