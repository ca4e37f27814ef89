//! Filesystem-backed blob store.
//!
//! Layout: `<root>/<relative path>`, e.g.
//! `<root>/agents/3/artifacts/v2_agent.tar.gz`. Writes go to a temporary
//! file in the target directory and are renamed into place.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use kiln_state::{BlobStore, StorageError, StorageResult};
use tempfile::NamedTempFile;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `path`, rejecting absolute or escaping paths.
    pub fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let rel = Path::new(path);
        let clean = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(StorageError::InvalidBlobPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Backend(format!("blob task failed: {e}"))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let target = self.resolve(path)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let dir = target
                .parent()
                .ok_or_else(|| StorageError::InvalidBlobPath {
                    path: target.display().to_string(),
                })?;
            std::fs::create_dir_all(dir)?;
            let mut tmp = NamedTempFile::new_in(dir)?;
            tmp.write_all(&data)?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(join_error)??;

        tracing::debug!(path, "blob saved");
        Ok(())
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::BlobNotFound {
                    path: path.to_string(),
                }
            } else {
                StorageError::from(e)
            }
        })
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }

    async fn delete(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
