//! Upload acceptance: checks an uploaded archive and records a new version.

use std::sync::Arc;

use kiln_state::{AgentId, AgentVersion, BlobStore, NewAgentVersion, VersionStore};
use sha2::{Digest, Sha256};

use crate::archive::TarballCodec;
use crate::error::{KilnError, Result};

const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// SHA-256 hex digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Blob path for an uploaded archive.
pub fn artifact_path(agent_id: AgentId, label: &str, filename: &str) -> String {
    format!("agents/{agent_id}/artifacts/{label}_{filename}")
}

pub struct ArtifactIntake {
    versions: Arc<dyn VersionStore>,
    blobs: Arc<dyn BlobStore>,
    max_bytes: u64,
}

impl ArtifactIntake {
    pub fn new(versions: Arc<dyn VersionStore>, blobs: Arc<dyn BlobStore>, max_bytes: u64) -> Self {
        Self {
            versions,
            blobs,
            max_bytes,
        }
    }

    /// Accept an uploaded archive for `agent_id`, creating a QUEUED version.
    ///
    /// Labels are `v<n+1>` where `n` is the agent's existing version count.
    pub async fn accept_upload(&self, agent_id: AgentId, filename: &str, bytes: &[u8]) -> Result<AgentVersion> {
        if !filename.ends_with(ARCHIVE_SUFFIX) || filename.len() == ARCHIVE_SUFFIX.len() {
            return Err(KilnError::InvalidUpload(
                "Only .tar.gz files are allowed".into(),
            ));
        }
        if filename.contains(['/', '\\']) || filename.starts_with('.') {
            return Err(KilnError::InvalidUpload(format!(
                "Invalid archive file name: {filename}"
            )));
        }
        if bytes.len() as u64 > self.max_bytes {
            return Err(KilnError::InvalidUpload(format!(
                "File size exceeds maximum allowed size of {} bytes",
                self.max_bytes
            )));
        }
        if !TarballCodec::validate_bytes(bytes) {
            return Err(KilnError::InvalidUpload(
                "Uploaded file is not a readable gzip tar archive".into(),
            ));
        }

        let existing = self.versions.list_versions(agent_id).await?;
        let label = format!("v{}", existing.len() + 1);
        let path = artifact_path(agent_id, &label, filename);

        self.blobs.save(&path, bytes).await?;
        let version = self
            .versions
            .create_version(NewAgentVersion {
                agent_id,
                version: label,
                archive_path: path,
                archive_digest: Some(sha256_hex(bytes)),
            })
            .await?;

        tracing::info!(
            agent_id = agent_id.0,
            version_id = version.id.0,
            version = %version.version,
            size = bytes.len(),
            "upload accepted"
        );
        Ok(version)
    }
}
