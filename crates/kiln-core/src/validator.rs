//! Artifact validation: extract, locate the entrypoint, prove it is callable.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::archive::TarballCodec;
use crate::descriptor::{find_descriptor, Descriptor, Entrypoint, DESCRIPTOR_FILE};
use crate::error::{KilnError, Result};
use crate::loader::{load_module, CancelFlag};
use crate::resolve::resolve_module;

/// Outcome of validating one artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub message: Option<String>,
    pub entrypoint: Option<String>,
    /// Parsed descriptor as JSON, present when valid.
    pub descriptor: Option<serde_json::Value>,
}

impl ValidationReport {
    fn passed(entrypoint: &Entrypoint, descriptor: serde_json::Value) -> Self {
        Self {
            valid: true,
            message: None,
            entrypoint: Some(entrypoint.to_string()),
            descriptor: Some(descriptor),
        }
    }

    fn failed(err: KilnError) -> Self {
        Self {
            valid: false,
            message: Some(err.to_string()),
            entrypoint: None,
            descriptor: None,
        }
    }
}

/// Checks that an archive is a loadable agent.
///
/// Validation runs the module's top-level code. Call it off the async
/// executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactValidator;

impl ArtifactValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate the archive at `archive_path`, extracting under `scratch_dir`.
    pub fn validate(&self, archive_path: &Path, scratch_dir: &Path) -> ValidationReport {
        self.validate_with_cancel(archive_path, scratch_dir, &CancelFlag::new())
    }

    pub fn validate_with_cancel(
        &self,
        archive_path: &Path,
        scratch_dir: &Path,
        cancel: &CancelFlag,
    ) -> ValidationReport {
        let extracted = scratch_dir.join("artifact");
        let checked = TarballCodec::extract(archive_path, &extracted)
            .map_err(KilnError::from)
            .and_then(|_| self.check_tree(&extracted, cancel));
        report(checked)
    }

    /// Validate in-memory archive bytes, extracting under `scratch_dir`.
    pub fn validate_bytes(&self, bytes: &[u8], scratch_dir: &Path, cancel: &CancelFlag) -> ValidationReport {
        let extracted = scratch_dir.join("artifact");
        let checked = TarballCodec::extract_bytes(bytes, &extracted)
            .map_err(KilnError::from)
            .and_then(|_| self.check_tree(&extracted, cancel));
        report(checked)
    }

    /// Run the descriptor, entrypoint, resolution and load checks over an
    /// already-extracted tree.
    pub fn check_tree(&self, root: &Path, cancel: &CancelFlag) -> Result<(Entrypoint, Descriptor)> {
        let descriptor_path = find_descriptor(root).ok_or_else(|| {
            KilnError::Configuration(format!("{DESCRIPTOR_FILE} not found in artifact"))
        })?;
        let descriptor = Descriptor::parse(&fs::read_to_string(&descriptor_path)?)?;
        let entrypoint: Entrypoint = descriptor.entrypoint.parse()?;

        let module_file = resolve_module(root, &entrypoint.module)?;
        let namespace = format!("kiln_build_{}", uuid::Uuid::new_v4().simple());
        let loaded = load_module(root, &module_file, &entrypoint.module, &namespace, cancel)?;
        loaded.callable(&entrypoint.function)?;

        tracing::debug!(entrypoint = %entrypoint, "artifact validated");
        Ok((entrypoint, descriptor))
    }
}

fn report(checked: Result<(Entrypoint, Descriptor)>) -> ValidationReport {
    match checked.and_then(|(ep, d)| d.to_json().map(|json| (ep, json))) {
        Ok((entrypoint, json)) => ValidationReport::passed(&entrypoint, json),
        Err(err) => ValidationReport::failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, body) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        dir
    }

    #[test]
    fn nested_project_validates() {
        let dir = tree(&[
            ("proj/kiln.toml", "name = \"a\"\nentrypoint = \"agents.main:handler\"\nframework = \"rhai\"\n"),
            ("proj/agents/main.rhai", "fn handler(input) { input }"),
        ]);
        let (ep, d) = ArtifactValidator::new()
            .check_tree(dir.path(), &CancelFlag::new())
            .unwrap();
        assert_eq!(ep.to_string(), "agents.main:handler");
        assert_eq!(d.framework.as_deref(), Some("rhai"));
    }

    #[test]
    fn malformed_entrypoint_fails_before_module_search() {
        // No module files at all: the format error must still win.
        let dir = tree(&[("kiln.toml", "entrypoint = \"handler\"\n")]);
        let err = ArtifactValidator::new()
            .check_tree(dir.path(), &CancelFlag::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "entrypoint must be in format 'module:function'");
    }

    #[test]
    fn descriptor_faults_are_configuration_errors() {
        let cancel = CancelFlag::new();
        for files in [
            vec![("main.rhai", "fn handler(i) { i }")],
            vec![("kiln.toml", "entrypoint = \"handler\"\n"), ("main.rhai", "fn handler(i) { i }")],
            vec![("kiln.toml", "entrypoint = \"\"\n"), ("main.rhai", "fn handler(i) { i }")],
        ] {
            let dir = tree(&files);
            let err = ArtifactValidator::new().check_tree(dir.path(), &cancel).unwrap_err();
            assert!(matches!(err, KilnError::Configuration(_)), "{err:?}");
        }
    }

    #[test]
    fn unknown_module_is_a_resolution_error() {
        let dir = tree(&[("kiln.toml", "entrypoint = \"agent:handler\"\n")]);
        let err = ArtifactValidator::new()
            .check_tree(dir.path(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, KilnError::Resolution(_)));
    }

    #[test]
    fn extraction_failure_is_an_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TarballCodec::extract_bytes(b"not gzip", &dir.path().join("x"))
            .map_err(KilnError::from)
            .unwrap_err();
        assert!(matches!(err, KilnError::Archive(_)));
        assert!(err.to_string().starts_with("Failed to extract archive: "));
    }

    #[test]
    fn corrupt_archive_reports_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("agent.tar.gz");
        fs::write(&bogus, b"not an archive").unwrap();
        let report = ArtifactValidator::new().validate(&bogus, dir.path());
        assert!(!report.valid);
        assert!(report.message.unwrap().starts_with("Failed to extract archive"));
        assert!(report.entrypoint.is_none());
    }
}
