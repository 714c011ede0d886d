//! Storage abstractions for document bytes and container resolution.
//!
//! Implementations:
//! - `InMemoryStorage` / `FixedLocator` - For testing
//! - `NativeStorage` / `DirectoryLocator` (in docs-daemon) - Use tokio::fs
//!
//! Completion of a storage call does not mean the remote store has processed
//! it; confirmation only ever arrives through the metadata feed.

use crate::document::{ContainerRoot, DocumentId};
use crate::identity::IdentityToken;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Container unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Performs the byte-level operations on documents.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read document contents
    async fn read(&self, location: &DocumentId) -> Result<Vec<u8>>;

    /// Write document contents (creates parent directories if needed)
    async fn write(&self, location: &DocumentId, content: &[u8]) -> Result<()>;

    /// Delete a document
    async fn delete(&self, location: &DocumentId) -> Result<()>;
}

/// Resolves the document container for an account identity.
#[async_trait]
pub trait ContainerLocator: Send + Sync {
    /// `Ok(None)` means the store has no container for this identity (yet).
    async fn locate(&self, identity: &IdentityToken) -> Result<Option<ContainerRoot>>;
}

/// Which storage call a failure should be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCall {
    Read,
    Write,
    Delete,
}

/// In-memory storage for testing
#[derive(Default)]
pub struct InMemoryStorage {
    files: RwLock<HashMap<DocumentId, Vec<u8>>>,
    failures: Mutex<Vec<(StorageCall, StorageError)>>,
    calls: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of kind `call` fail with `error`.
    pub fn fail_next(&self, call: StorageCall, error: StorageError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((call, error));
    }

    /// Seed raw bytes without counting a call.
    pub fn insert(&self, location: impl Into<DocumentId>, content: &[u8]) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(location.into(), content.to_vec());
    }

    pub fn contains(&self, location: &DocumentId) -> bool {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(location)
    }

    /// Number of read/write/delete calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, call: StorageCall) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.iter().position(|(kind, _)| *kind == call) {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn read(&self, location: &DocumentId) -> Result<Vec<u8>> {
        self.record(StorageCall::Read)?;
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(location)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }

    async fn write(&self, location: &DocumentId, content: &[u8]) -> Result<()> {
        self.record(StorageCall::Write)?;
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(location.clone(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, location: &DocumentId) -> Result<()> {
        self.record(StorageCall::Delete)?;
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }
}

/// Locator that places every identity's container under one base directory,
/// in a subdirectory named after the token.
pub struct FixedLocator {
    base: ContainerRoot,
}

impl FixedLocator {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: ContainerRoot::new(base.as_ref()),
        }
    }
}

#[async_trait]
impl ContainerLocator for FixedLocator {
    async fn locate(&self, identity: &IdentityToken) -> Result<Option<ContainerRoot>> {
        Ok(Some(ContainerRoot::new(
            self.base.as_path().join(identity.as_str()),
        )))
    }
}

// Allows sharing a backend between the coordinator and test assertions
#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    async fn read(&self, location: &DocumentId) -> Result<Vec<u8>> {
        (**self).read(location).await
    }

    async fn write(&self, location: &DocumentId, content: &[u8]) -> Result<()> {
        (**self).write(location, content).await
    }

    async fn delete(&self, location: &DocumentId) -> Result<()> {
        (**self).delete(location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_storage_basic_operations() {
        let storage = InMemoryStorage::new();
        let id = DocumentId::from("/docs/a.txt");

        storage.write(&id, b"hello world").await.unwrap();
        assert_eq!(storage.read(&id).await.unwrap(), b"hello world");

        storage.delete(&id).await.unwrap();
        assert!(!storage.contains(&id));
        assert!(matches!(
            storage.read(&id).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(storage.calls(), 4);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let storage = InMemoryStorage::new();
        let id = DocumentId::from("/docs/a.txt");
        storage.fail_next(StorageCall::Write, StorageError::Io("disk full".into()));

        assert_eq!(
            storage.write(&id, b"x").await,
            Err(StorageError::Io("disk full".into()))
        );
        assert!(storage.write(&id, b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_fixed_locator_scopes_by_identity() {
        let locator = FixedLocator::new("/cloud");
        let root = locator
            .locate(&IdentityToken::new("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.as_path(), Path::new("/cloud/alice"));
    }
}
