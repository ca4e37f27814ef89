//! Map a dotted module name to a source file inside an extracted artifact.

use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::descriptor::MODULE_EXTENSION;
use crate::error::{KilnError, Result};

/// Pick the candidate with the fewest path components, then the
/// lexicographically smallest component sequence.
pub fn shallowest_first(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by_cached_key(|p| {
        let parts: Vec<String> = p
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        (parts.len(), parts)
    });
    candidates.into_iter().next()
}

/// Dotted name of a module file relative to the artifact root:
/// `pkg/tools/echo.rhai` becomes `pkg.tools.echo`.
pub fn dotted_name(rel: &Path) -> String {
    let stem = rel.with_extension("");
    stem.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Find the source file for `module` under `root`.
///
/// A file matches when its dotted name equals `module` or ends with
/// `.<module>`; among several matches the shallowest wins.
pub fn resolve_module(root: &Path, module: &str) -> Result<PathBuf> {
    let suffix = format!(".{module}");
    let candidates: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == MODULE_EXTENSION))
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .filter(|rel| {
            let dotted = dotted_name(rel);
            dotted == module || dotted.ends_with(&suffix)
        })
        .collect();

    if candidates.len() > 1 {
        tracing::debug!(module, matches = candidates.len(), "ambiguous module name");
    }

    shallowest_first(candidates)
        .map(|rel| root.join(rel))
        .ok_or_else(|| KilnError::Resolution(format!("Module '{module}' not found in artifact")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn dotted_names() {
        assert_eq!(dotted_name(Path::new("pkg/tools/echo.rhai")), "pkg.tools.echo");
        assert_eq!(dotted_name(Path::new("main.rhai")), "main");
    }

    #[test]
    fn exact_and_suffix_matches() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "project/agents/main.rhai");

        let exact = resolve_module(dir.path(), "project.agents.main").unwrap();
        let suffix = resolve_module(dir.path(), "agents.main").unwrap();
        assert_eq!(exact, suffix);
        assert!(resolve_module(dir.path(), "gents.main").is_err());
    }

    #[test]
    fn ambiguity_prefers_shallow_then_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "z/main.rhai");
        touch(dir.path(), "a/b/main.rhai");
        touch(dir.path(), "b/main.rhai");

        let found = resolve_module(dir.path(), "main").unwrap();
        assert_eq!(found, dir.path().join("b/main.rhai"));
    }

    #[test]
    fn non_module_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "main.txt");
        let err = resolve_module(dir.path(), "main").unwrap_err();
        assert_eq!(err.to_string(), "Module 'main' not found in artifact");
    }
}
