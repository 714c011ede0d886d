//! docs-daemon library: Native collaborators for the docs engine.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod identity;
pub mod native_storage;
pub mod repl;
pub mod watcher;

use docs_core::Collaborators;
use std::path::Path;
use std::sync::Arc;

// Re-export key types for convenience
pub use config::{Args, Config, ConfigError};
pub use identity::FileIdentityMonitor;
pub use native_storage::{DirectoryLocator, NativeStorage};
pub use watcher::DirectoryFeed;

/// Wire the native collaborators for containers under `root`.
pub fn native_collaborators(root: &Path, identity: FileIdentityMonitor) -> Collaborators {
    Collaborators {
        storage: Arc::new(NativeStorage::new()),
        feed: Arc::new(DirectoryFeed::new()),
        locator: Arc::new(DirectoryLocator::new(root)),
        identity: Arc::new(identity),
    }
}
