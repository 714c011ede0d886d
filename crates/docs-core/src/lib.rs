//! docs-core: Client-side view of documents stored in an eventually-consistent
//! remote metadata store.
//!
//! This crate provides:
//! - The document cache and the batch-folding rules that keep it correct
//! - Tracking of the single in-flight local mutation
//! - The identity-scoped session lifecycle
//! - `MetadataFeed`, `StorageBackend`, `ContainerLocator` and `IdentityMonitor`
//!   abstractions, with in-memory implementations for tests
//! - A single-task `Coordinator` that serializes every state change

pub mod coordinator;
pub mod document;
pub mod engine;
pub mod feed;
pub mod fold;
pub mod identity;
pub mod pending;
pub mod storage;

pub use coordinator::{Collaborators, Coordinator, EngineHandle};
pub use document::{ContainerRoot, DocumentId, DocumentMetadata, FeedItem};
pub use engine::{EngineConfig, EngineError, EngineView, Phase, ReconciliationEngine};
pub use feed::{FeedError, FeedEvent, FeedQuery, ManualFeed, MetadataFeed, SortKey, UpdatesPaused};
pub use fold::FeedBatch;
pub use identity::{IdentityChanged, IdentityMonitor, IdentityToken, ManualIdentity};
pub use pending::{OperationKind, PendingOperation};
pub use storage::{ContainerLocator, FixedLocator, InMemoryStorage, StorageBackend, StorageError};
