//! Remote metadata feed abstraction.
//!
//! A feed runs in two phases: an initial gather that collects every matching
//! document, then live updates delivered as classified batches. Events are
//! delivered over a channel so that the single coordinator task consumes them
//! in order.
//!
//! Implementations:
//! - `ManualFeed` - Scripted by tests
//! - `DirectoryFeed` (in docs-daemon) - Watches a container directory

use crate::document::{ContainerRoot, FeedItem};
use crate::fold::FeedBatch;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("Failed to start subscription: {0}")]
    StartFailed(String),

    #[error("Failed to read result snapshot: {0}")]
    SnapshotFailed(String),

    #[error("No active subscription")]
    NotStarted,
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Event delivered by a running subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The initial full gather finished; the result snapshot is complete.
    InitialGatherComplete,
    /// A live update.
    Batch(FeedBatch),
}

/// Result ordering requested from the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    LastModifiedDescending,
}

/// What a subscription observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    /// File name pattern, e.g. `*.txt`
    pub pattern: String,
    pub sort: SortKey,
    /// How long the feed may coalesce changes before delivering a batch
    pub batching_interval: Duration,
}

impl FeedQuery {
    /// Query for every document with `extension`.
    pub fn for_extension(extension: &str, batching_interval: Duration) -> Self {
        Self {
            pattern: format!("*.{extension}"),
            sort: SortKey::LastModifiedDescending,
            batching_interval,
        }
    }

    /// Whether a file name matches the pattern. Supports a single leading `*`.
    pub fn matches(&self, file_name: &str) -> bool {
        match self.pattern.strip_prefix('*') {
            Some(suffix) => file_name.len() > suffix.len() && file_name.ends_with(suffix),
            None => file_name == self.pattern,
        }
    }
}

/// Long-lived subscription to document metadata in a container.
#[async_trait]
pub trait MetadataFeed: Send + Sync {
    /// Start observing `root`. Any previous subscription is replaced.
    async fn start(
        &self,
        root: &ContainerRoot,
        query: &FeedQuery,
    ) -> Result<mpsc::UnboundedReceiver<FeedEvent>>;

    /// Stop the running subscription, if any.
    async fn stop(&self);

    /// Hold live updates; events observed meanwhile are delivered on resume.
    fn disable_updates(&self);

    fn enable_updates(&self);

    /// The full current result set.
    ///
    /// Only consistent while updates are disabled; go through [`UpdatesPaused`].
    async fn results(&self) -> Result<Vec<FeedItem>>;
}

/// Scope during which the feed holds live updates.
///
/// Updates are disabled on creation and re-enabled on drop, so every exit path
/// of a snapshot read resumes delivery.
pub struct UpdatesPaused<F: MetadataFeed + ?Sized> {
    feed: Arc<F>,
}

impl<F: MetadataFeed + ?Sized> UpdatesPaused<F> {
    pub fn new(feed: Arc<F>) -> Self {
        feed.disable_updates();
        Self { feed }
    }

    pub async fn snapshot(&self) -> Result<Vec<FeedItem>> {
        self.feed.results().await
    }
}

impl<F: MetadataFeed + ?Sized> Drop for UpdatesPaused<F> {
    fn drop(&mut self) {
        self.feed.enable_updates();
    }
}

#[derive(Default)]
struct ManualState {
    sender: Option<mpsc::UnboundedSender<FeedEvent>>,
    root: Option<ContainerRoot>,
    results: Vec<FeedItem>,
    paused: bool,
    held: Vec<FeedEvent>,
    start_failure: Option<FeedError>,
    snapshot_failure: Option<FeedError>,
}

/// Feed scripted by hand, for tests.
#[derive(Default)]
pub struct ManualFeed {
    state: Mutex<ManualState>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    pauses: AtomicUsize,
}

impl ManualFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an event, or hold it while updates are disabled.
    /// Returns false when no subscription is listening.
    pub fn emit(&self, event: FeedEvent) -> bool {
        let mut state = self.state();
        if state.paused {
            state.held.push(event);
            return state.sender.is_some();
        }
        match &state.sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn push_batch(&self, batch: FeedBatch) -> bool {
        self.emit(FeedEvent::Batch(batch))
    }

    /// Replace the result set and signal the end of the initial gather.
    pub fn finish_gathering(&self, results: Vec<FeedItem>) -> bool {
        self.set_results(results);
        self.emit(FeedEvent::InitialGatherComplete)
    }

    pub fn set_results(&self, results: Vec<FeedItem>) {
        self.state().results = results;
    }

    pub fn fail_next_start(&self, error: FeedError) {
        self.state().start_failure = Some(error);
    }

    pub fn fail_next_snapshot(&self, error: FeedError) {
        self.state().snapshot_failure = Some(error);
    }

    pub fn root(&self) -> Option<ContainerRoot> {
        self.state().root.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().sender.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of times updates were disabled.
    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataFeed for ManualFeed {
    async fn start(
        &self,
        root: &ContainerRoot,
        _query: &FeedQuery,
    ) -> Result<mpsc::UnboundedReceiver<FeedEvent>> {
        let mut state = self.state();
        if let Some(error) = state.start_failure.take() {
            return Err(error);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        state.sender = Some(tx);
        state.root = Some(root.clone());
        state.held.clear();
        state.paused = false;
        Ok(rx)
    }

    async fn stop(&self) {
        let mut state = self.state();
        if state.sender.take().is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        state.root = None;
        state.held.clear();
    }

    fn disable_updates(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.state().paused = true;
    }

    fn enable_updates(&self) {
        let mut state = self.state();
        state.paused = false;
        let held = std::mem::take(&mut state.held);
        if let Some(tx) = &state.sender {
            for event in held {
                let _ = tx.send(event);
            }
        }
    }

    async fn results(&self) -> Result<Vec<FeedItem>> {
        let mut state = self.state();
        if let Some(error) = state.snapshot_failure.take() {
            return Err(error);
        }
        if state.sender.is_none() {
            return Err(FeedError::NotStarted);
        }
        Ok(state.results.clone())
    }
}
