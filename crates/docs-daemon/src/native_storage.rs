//! Native storage implementation using tokio::fs.

use async_trait::async_trait;
use docs_core::document::is_plain_name;
use docs_core::storage::Result;
use docs_core::{
    ContainerLocator, ContainerRoot, DocumentId, IdentityToken, StorageBackend, StorageError,
};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

fn io_error(location: &DocumentId, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(location.to_string())
    } else {
        StorageError::Io(format!("{}: {}", location, e))
    }
}

/// Storage backend for documents addressed by absolute path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageBackend for NativeStorage {
    async fn read(&self, location: &DocumentId) -> Result<Vec<u8>> {
        fs::read(location.as_path())
            .await
            .map_err(|e| io_error(location, e))
    }

    async fn write(&self, location: &DocumentId, content: &[u8]) -> Result<()> {
        // Create parent directories if needed
        if let Some(parent) = location.as_path().parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(location, e))?;
        }

        fs::write(location.as_path(), content)
            .await
            .map_err(|e| io_error(location, e))?;
        debug!("Wrote {} bytes to {}", content.len(), location);
        Ok(())
    }

    async fn delete(&self, location: &DocumentId) -> Result<()> {
        fs::remove_file(location.as_path())
            .await
            .map_err(|e| io_error(location, e))
    }
}

/// Resolves each identity to a directory named after its token under a base
/// directory, creating it on first use.
pub struct DirectoryLocator {
    base: PathBuf,
}

impl DirectoryLocator {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl ContainerLocator for DirectoryLocator {
    async fn locate(&self, identity: &IdentityToken) -> Result<Option<ContainerRoot>> {
        if !is_plain_name(identity.as_str()) {
            warn!("Identity {:?} cannot name a container directory", identity.as_str());
            return Ok(None);
        }

        let root = self.base.join(identity.as_str());
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", root.display(), e)))?;
        Ok(Some(ContainerRoot::new(root)))
    }
}
