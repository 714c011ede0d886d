//! ReconciliationEngine: the authoritative local cache of document metadata.
//!
//! The engine never mutates its cache speculatively. Local mutations only
//! record a pending operation; the cache changes when the metadata feed
//! reports the result, so the view never diverges from what the remote store
//! will eventually report.
//!
//! This type is a synchronous state machine with no I/O. The [`Coordinator`]
//! drives it from a single task and performs the I/O it asks for.
//!
//! [`Coordinator`]: crate::coordinator::Coordinator

use crate::document::{is_plain_name, ContainerRoot, DocumentId, DocumentMetadata, FeedItem};
use crate::feed::{FeedError, FeedQuery};
use crate::fold::{self, FeedBatch};
use crate::identity::IdentityToken;
use crate::pending::{OperationKind, PendingOperation, PendingTracker};
use crate::storage::StorageError;
use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors surfaced to callers. None of them are fatal to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Container location is not resolved")]
    ContainerUnresolved,

    #[error("Invalid document name: {0:?}")]
    InvalidName(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentId),

    #[error("Content of {0} is not valid UTF-8")]
    ContentEncodingFailed(DocumentId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("No confirmation received for {0}")]
    ConfirmationTimedOut(DocumentId),

    #[error("Unknown document: {0}")]
    UnknownDocument(DocumentId),

    #[error("Engine stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Lifecycle of one identity session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Uninitialized,
    LocatingContainer,
    /// Subscription started, initial gather in progress
    Gathering,
    /// Steady state, incremental batches
    Live,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Extension appended to every created document
    pub extension: String,
    /// Name used when a create request has a blank name
    pub default_name: String,
    /// Clear an unconfirmed pending operation after this long.
    /// `None` keeps it until a batch mentions its target.
    pub confirmation_timeout: Option<Duration>,
    /// Batching interval requested from the feed
    pub batching_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            extension: "txt".to_string(),
            default_name: "Untitled".to_string(),
            confirmation_timeout: None,
            batching_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn query(&self) -> FeedQuery {
        FeedQuery::for_extension(&self.extension, self.batching_interval)
    }
}

/// What the coordinator must do after an identity notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityTransition {
    /// Same token as before, nothing to do
    Unchanged,
    /// Tear down the old session and resolve the container for `identity`
    Locate { identity: IdentityToken, session: u64 },
    /// Tear down the old session and wait for a token
    SignedOut,
}

/// Result of folding one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Valid entries in the batch
    pub applied: usize,
    /// Pending operation confirmed by this batch
    pub confirmed: Option<PendingOperation>,
    /// Whether the selection was cleared because its document disappeared
    pub selection_cleared: bool,
}

/// Read-only snapshot of the engine for callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineView {
    pub phase: Phase,
    pub documents: Vec<DocumentMetadata>,
    pub busy: bool,
    pub pending: Option<PendingOperation>,
    pub selection: Option<DocumentMetadata>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<EngineError>,
}

fn serialize_error<S: Serializer>(
    error: &Option<EngineError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

/// The reconciliation state machine.
#[derive(Debug)]
pub struct ReconciliationEngine {
    config: EngineConfig,
    phase: Phase,
    identity: Option<IdentityToken>,
    /// Bumped on every reset so completions from an older session are ignored
    session: u64,
    container: Option<ContainerRoot>,
    /// Sorted descending by last-modified, at most one entry per id
    cache: Vec<DocumentMetadata>,
    pending: PendingTracker,
    selection: Option<DocumentId>,
    error: Option<EngineError>,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            phase: Phase::Uninitialized,
            identity: None,
            session: 0,
            container: None,
            cache: Vec::new(),
            pending: PendingTracker::new(),
            selection: None,
            error: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn identity(&self) -> Option<&IdentityToken> {
        self.identity.as_ref()
    }

    pub fn container(&self) -> Option<&ContainerRoot> {
        self.container.as_ref()
    }

    pub fn documents(&self) -> &[DocumentMetadata] {
        &self.cache
    }

    pub fn document(&self, id: &DocumentId) -> Option<&DocumentMetadata> {
        self.cache.iter().find(|doc| &doc.id == id)
    }

    pub fn pending(&self) -> Option<&PendingOperation> {
        self.pending.current()
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_busy()
    }

    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    pub fn selection(&self) -> Option<&DocumentMetadata> {
        self.selection.as_ref().and_then(|id| self.document(id))
    }

    pub fn view(&self) -> EngineView {
        EngineView {
            phase: self.phase,
            documents: self.cache.clone(),
            busy: self.is_busy(),
            pending: self.pending().cloned(),
            selection: self.selection().cloned(),
            error: self.error.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Identity session
    // ------------------------------------------------------------------

    /// React to the identity now reported by the monitor.
    ///
    /// A token equal to the current one is a redundant notification and
    /// changes nothing. Anything else resets the session.
    pub fn on_identity(&mut self, token: Option<IdentityToken>) -> IdentityTransition {
        if token == self.identity {
            debug!("Identity notification without change");
            return IdentityTransition::Unchanged;
        }

        self.reset();
        self.identity = token.clone();

        match token {
            Some(identity) => {
                info!("Identity changed, locating container");
                self.phase = Phase::LocatingContainer;
                IdentityTransition::Locate {
                    identity,
                    session: self.session,
                }
            }
            None => {
                info!("Identity absent, waiting for sign-in");
                IdentityTransition::SignedOut
            }
        }
    }

    fn reset(&mut self) {
        self.session += 1;
        self.phase = Phase::Uninitialized;
        self.container = None;
        self.cache.clear();
        self.selection = None;
        if let Some(dropped) = self.pending.clear() {
            debug!("Dropped pending {:?} on {} during reset", dropped.kind, dropped.target);
        }
    }

    /// Record the container resolved for `session`.
    ///
    /// Returns the root to subscribe to, or `None` if the result is stale or
    /// the store has no container.
    pub fn on_container_located(
        &mut self,
        session: u64,
        root: Option<ContainerRoot>,
    ) -> Option<ContainerRoot> {
        if session != self.session || self.phase != Phase::LocatingContainer {
            debug!("Ignoring container result from session {}", session);
            return None;
        }
        let Some(root) = root else {
            warn!("No container available for the current identity");
            self.record_error(EngineError::ContainerUnresolved);
            return None;
        };
        info!("Container located at {}", root.as_path().display());
        self.container = Some(root.clone());
        self.phase = Phase::Gathering;
        Some(root)
    }

    /// Record a failure belonging to `session`. Stale failures are ignored.
    pub fn on_session_error(&mut self, session: u64, error: EngineError) {
        if session == self.session {
            self.record_error(error);
        }
    }

    // ------------------------------------------------------------------
    // Feed
    // ------------------------------------------------------------------

    /// Replace the cache with the feed's full result set and go live.
    pub fn on_initial_gather_complete(&mut self, results: &[FeedItem]) {
        self.replace_with_snapshot(results);
        if self.phase == Phase::Gathering {
            self.phase = Phase::Live;
        }
    }

    /// Replace the cache with a full snapshot.
    pub fn replace_with_snapshot(&mut self, results: &[FeedItem]) {
        self.cache = fold::snapshot_to_cache(results, fold::now_millis());
        self.invalidate_selection();
        info!("Loaded {} document(s) from snapshot", self.cache.len());
    }

    /// Fold one live batch into the cache.
    pub fn apply_batch(&mut self, batch: &FeedBatch) -> BatchOutcome {
        let resolved = batch.resolve();
        let mut working = fold::fold_batch(&self.cache, &resolved);

        let selection_cleared = match &self.selection {
            Some(selected) if !working.iter().any(|doc| &doc.id == selected) => {
                self.selection = None;
                true
            }
            _ => false,
        };

        let confirmed = self.pending.confirm_with(|target| resolved.mentions(target));
        if let Some(operation) = &confirmed {
            info!("Confirmed {:?} of {}", operation.kind, operation.target);
        }

        fold::sort_by_last_modified(&mut working, fold::now_millis());
        self.cache = working;

        debug!(
            "Folded batch: {} added, {} updated, {} removed -> {} document(s)",
            resolved.added.len(),
            resolved.updated.len(),
            resolved.removed.len(),
            self.cache.len()
        );

        BatchOutcome {
            applied: resolved.len(),
            confirmed,
            selection_cleared,
        }
    }

    fn invalidate_selection(&mut self) {
        if let Some(selected) = &self.selection {
            if self.document(selected).is_none() {
                self.selection = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Validate a create request and track it.
    ///
    /// The duplicate check only sees the last confirmed state; a concurrent
    /// create elsewhere can still race past it.
    pub fn prepare_create(&mut self, name: &str) -> Result<PendingOperation> {
        let Some(container) = &self.container else {
            return Err(self.record_error(EngineError::ContainerUnresolved));
        };

        let trimmed = name.trim();
        let name = if trimmed.is_empty() {
            self.config.default_name.as_str()
        } else {
            trimmed
        };
        // The feed only reports plain entries directly under the container,
        // so any other name could never be confirmed.
        if !is_plain_name(name) {
            let name = name.to_string();
            return Err(self.record_error(EngineError::InvalidName(name)));
        }
        let target = container.document_id(name, &self.config.extension);

        if self.document(&target).is_some() {
            return Err(self.record_error(EngineError::AlreadyExists(target)));
        }

        Ok(self.track(OperationKind::Create, target))
    }

    pub fn prepare_update(&mut self, target: DocumentId) -> PendingOperation {
        self.track(OperationKind::Update, target)
    }

    pub fn prepare_delete(&mut self, target: DocumentId) -> PendingOperation {
        self.track(OperationKind::Delete, target)
    }

    fn track(&mut self, kind: OperationKind, target: DocumentId) -> PendingOperation {
        let operation = PendingOperation::new(kind, target);
        if let Some(replaced) = self.pending.begin(operation.clone()) {
            debug!("Pending {:?} of {} replaced", replaced.kind, replaced.target);
        }
        debug!("Pending {:?} of {}", operation.kind, operation.target);
        operation
    }

    /// The storage call behind `operation` failed. The cache is untouched.
    pub fn on_mutation_failed(&mut self, operation: &PendingOperation, error: EngineError) -> EngineError {
        if !self.pending.clear_if(operation) {
            debug!("Failed {:?} of {} was no longer tracked", operation.kind, operation.target);
        }
        self.record_error(error)
    }

    /// When the pending operation times out, if a timeout is configured.
    pub fn confirmation_deadline(&self) -> Option<Instant> {
        self.pending.deadline(self.config.confirmation_timeout)
    }

    /// Clear the pending operation if its confirmation is overdue at `now`.
    pub fn expire_pending(&mut self, now: Instant) -> Option<PendingOperation> {
        let expired = self.pending.expire(self.config.confirmation_timeout, now)?;
        self.record_error(EngineError::ConfirmationTimedOut(expired.target.clone()));
        Some(expired)
    }

    // ------------------------------------------------------------------
    // Caller state
    // ------------------------------------------------------------------

    /// Select a cached document, or clear the selection with `None`.
    pub fn select(&mut self, id: Option<DocumentId>) -> Result<()> {
        match id {
            Some(id) if self.document(&id).is_none() => {
                Err(self.record_error(EngineError::UnknownDocument(id)))
            }
            id => {
                self.selection = id;
                Ok(())
            }
        }
    }

    /// Remember `error` as the latest one and hand it back.
    pub fn record_error(&mut self, error: EngineError) -> EngineError {
        debug!("Engine error: {}", error);
        self.error = Some(error.clone());
        error
    }

    /// Acknowledge the latest error. The pending operation is unaffected.
    pub fn dismiss_error(&mut self) -> Option<EngineError> {
        self.error.take()
    }
}
