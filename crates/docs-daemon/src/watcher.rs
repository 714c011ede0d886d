//! Directory-backed metadata feed.
//!
//! Watches a container directory with notify-debouncer-mini and turns the
//! debounced events into classified added/updated/removed batches. The
//! debounce period is the query's batching interval, so one batch carries
//! everything that changed within it.

use async_trait::async_trait;
use docs_core::feed::Result;
use docs_core::{
    ContainerRoot, DocumentId, FeedBatch, FeedError, FeedEvent, FeedItem, FeedQuery, MetadataFeed,
};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// One running subscription.
struct Subscription {
    /// Root as handed to `start`; every reported id is built from it
    root: PathBuf,
    /// Canonical root, as reported by the OS watcher
    watched: PathBuf,
    query: FeedQuery,
    /// Last seen mtime (ms) per matching file name
    known: HashMap<String, u64>,
    sender: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct WatchState {
    subscription: Option<Subscription>,
    /// Bumped on every start/stop so a replaced debouncer's late callbacks are ignored
    generation: u64,
    paused: bool,
    held: Vec<FeedBatch>,
}

type SharedState = Arc<Mutex<WatchState>>;

/// Metadata feed over a local directory.
#[derive(Default)]
pub struct DirectoryFeed {
    state: SharedState,
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher>>>,
}

impl DirectoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, WatchState> {
        lock(&self.state)
    }

    fn replace_debouncer(&self, debouncer: Option<Debouncer<RecommendedWatcher>>) {
        let previous = std::mem::replace(
            &mut *self.debouncer.lock().unwrap_or_else(|e| e.into_inner()),
            debouncer,
        );
        // Dropped outside the lock; the debouncer shuts its threads down on drop
        drop(previous);
    }
}

fn lock(state: &SharedState) -> MutexGuard<'_, WatchState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl MetadataFeed for DirectoryFeed {
    async fn start(
        &self,
        root: &ContainerRoot,
        query: &FeedQuery,
    ) -> Result<mpsc::UnboundedReceiver<FeedEvent>> {
        self.stop().await;

        let root = root.as_path().to_path_buf();
        // On macOS /var/folders/... is really /private/var/folders/..., and
        // FSEvents reports the real path.
        let watched = root.canonicalize().unwrap_or_else(|_| root.clone());

        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.generation
        };

        let shared = Arc::clone(&self.state);
        let mut debouncer = new_debouncer(
            query.batching_interval,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => on_debounced(&shared, generation, &events),
                Err(e) => error!("Directory watcher error: {}", e),
            },
        )
        .map_err(|e| FeedError::StartFailed(e.to_string()))?;

        // Watch before scanning so nothing created in between is missed
        debouncer
            .watcher()
            .watch(&watched, RecursiveMode::NonRecursive)
            .map_err(|e| FeedError::StartFailed(e.to_string()))?;

        let known = scan(&watched, query)
            .await
            .map_err(|e| FeedError::StartFailed(e.to_string()))?;
        info!(
            "Watching {} ({} matching documents)",
            root.display(),
            known.len()
        );

        let (sender, events) = mpsc::unbounded_channel();
        // The gather is complete as soon as the scan is
        let _ = sender.send(FeedEvent::InitialGatherComplete);

        {
            let mut state = self.state();
            state.subscription = Some(Subscription {
                root,
                watched,
                query: query.clone(),
                known,
                sender,
            });
            state.paused = false;
            state.held.clear();
        }
        self.replace_debouncer(Some(debouncer));
        Ok(events)
    }

    async fn stop(&self) {
        let stopped = {
            let mut state = self.state();
            state.generation += 1;
            state.held.clear();
            state.subscription.take()
        };
        self.replace_debouncer(None);
        if let Some(subscription) = stopped {
            debug!("Stopped watching {}", subscription.root.display());
        }
    }

    fn disable_updates(&self) {
        self.state().paused = true;
    }

    fn enable_updates(&self) {
        let mut state = self.state();
        state.paused = false;
        let held = std::mem::take(&mut state.held);
        if let Some(subscription) = &state.subscription {
            for batch in held {
                let _ = subscription.sender.send(FeedEvent::Batch(batch));
            }
        }
    }

    async fn results(&self) -> Result<Vec<FeedItem>> {
        let state = self.state();
        let subscription = state.subscription.as_ref().ok_or(FeedError::NotStarted)?;
        Ok(subscription
            .known
            .iter()
            .map(|(name, mtime)| item(&subscription.root, name, Some(*mtime)))
            .collect())
    }
}

/// Initial gather: every matching regular file directly under `dir`.
async fn scan(dir: &Path, query: &FeedQuery) -> std::io::Result<HashMap<String, u64>> {
    let mut known = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_candidate(&name, query) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            known.insert(name, mtime_millis(&metadata));
        }
    }
    Ok(known)
}

/// Classify a debounced set of events against the known results and deliver
/// the resulting batch, or hold it while updates are disabled.
fn on_debounced(shared: &SharedState, generation: u64, events: &[DebouncedEvent]) {
    let mut state = lock(shared);
    if state.generation != generation {
        return;
    }
    let Some(subscription) = state.subscription.as_mut() else {
        return;
    };

    let mut batch = FeedBatch::default();
    for event in events {
        let Some(name) = relative_name(&event.path, &subscription.watched) else {
            continue;
        };
        if !is_candidate(&name, &subscription.query) {
            continue;
        }

        match std::fs::metadata(&event.path) {
            Ok(metadata) if metadata.is_file() => {
                let mtime = mtime_millis(&metadata);
                match subscription.known.insert(name.clone(), mtime) {
                    // Mtime unchanged - spurious event, skip it
                    Some(previous) if previous == mtime => {}
                    Some(_) => batch
                        .updated
                        .push(item(&subscription.root, &name, Some(mtime))),
                    None => batch.added.push(item(&subscription.root, &name, Some(mtime))),
                }
            }
            _ => {
                if subscription.known.remove(&name).is_some() {
                    batch.removed.push(item(&subscription.root, &name, None));
                }
            }
        }
    }

    if batch.is_empty() {
        return;
    }
    debug!(
        "Directory batch: {} added, {} updated, {} removed",
        batch.added.len(),
        batch.updated.len(),
        batch.removed.len()
    );
    if state.paused {
        state.held.push(batch);
    } else if let Some(subscription) = &state.subscription {
        let _ = subscription.sender.send(FeedEvent::Batch(batch));
    }
}

/// File name of a direct child of `dir`.
fn relative_name(path: &Path, dir: &Path) -> Option<String> {
    let relative = path.strip_prefix(dir).ok()?;
    let mut components = relative.components();
    let name = components.next()?.as_os_str().to_str()?.to_string();
    components.next().is_none().then_some(name)
}

fn is_candidate(name: &str, query: &FeedQuery) -> bool {
    // Skip hidden files (including the identity file and editor temp files)
    !name.starts_with('.') && query.matches(name)
}

fn item(root: &Path, name: &str, last_modified: Option<u64>) -> FeedItem {
    FeedItem::at(DocumentId::new(root.join(name)), last_modified)
}

fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .unwrap_or(SystemTime::now())
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn query() -> FeedQuery {
        FeedQuery::for_extension("txt", Duration::from_millis(50))
    }

    #[test]
    fn test_relative_name_only_direct_children() {
        let dir = Path::new("/docs/alice");
        assert_eq!(
            relative_name(Path::new("/docs/alice/a.txt"), dir).as_deref(),
            Some("a.txt")
        );
        assert_eq!(relative_name(Path::new("/docs/alice/sub/a.txt"), dir), None);
        assert_eq!(relative_name(Path::new("/docs/bob/a.txt"), dir), None);
    }

    #[test]
    fn test_candidates_skip_hidden_and_foreign() {
        let query = query();
        assert!(is_candidate("plan.txt", &query));
        assert!(!is_candidate(".plan.txt", &query));
        assert!(!is_candidate("plan.md", &query));
    }

    #[tokio::test]
    async fn test_start_scans_existing_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.md"), "b").unwrap();
        std::fs::write(dir.path().join(".identity"), "alice").unwrap();

        let feed = DirectoryFeed::new();
        let mut events = feed
            .start(&ContainerRoot::new(dir.path()), &query())
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(FeedEvent::InitialGatherComplete));

        let results = feed.results().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].location,
            Some(DocumentId::new(dir.path().join("a.txt")))
        );
        assert!(results[0].last_modified.is_some());

        feed.stop().await;
        assert_eq!(feed.results().await, Err(FeedError::NotStarted));
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let feed = DirectoryFeed::new();
        let result = feed
            .start(&ContainerRoot::new(dir.path().join("missing")), &query())
            .await;
        assert!(matches!(result, Err(FeedError::StartFailed(_))));
    }

    #[test]
    fn test_classifies_against_known_results() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (sender, mut events) = mpsc::unbounded_channel();
        std::fs::write(root.join("new.txt"), "n").unwrap();
        std::fs::write(root.join("old.txt"), "o").unwrap();

        let shared: SharedState = Arc::new(Mutex::new(WatchState {
            subscription: Some(Subscription {
                root: root.clone(),
                watched: root.clone(),
                query: query(),
                // Stale mtime forces an update; gone.txt no longer exists
                known: HashMap::from([("old.txt".to_string(), 1), ("gone.txt".to_string(), 1)]),
                sender,
            }),
            generation: 1,
            paused: false,
            held: Vec::new(),
        }));

        let debounced = |name: &str| DebouncedEvent {
            path: root.join(name),
            kind: notify_debouncer_mini::DebouncedEventKind::Any,
        };
        on_debounced(
            &shared,
            1,
            &[debounced("new.txt"), debounced("old.txt"), debounced("gone.txt")],
        );

        let Ok(FeedEvent::Batch(batch)) = events.try_recv() else {
            panic!("expected a batch");
        };
        assert_eq!(batch.added[0].location, Some(DocumentId::new(root.join("new.txt"))));
        assert_eq!(batch.updated[0].location, Some(DocumentId::new(root.join("old.txt"))));
        assert_eq!(batch.removed[0].location, Some(DocumentId::new(root.join("gone.txt"))));

        // Same events again: mtimes match, nothing is gone any more
        on_debounced(&shared, 1, &[debounced("new.txt"), debounced("gone.txt")]);
        assert!(events.try_recv().is_err());

        // Late callbacks from a replaced watcher are ignored
        std::fs::write(root.join("late.txt"), "l").unwrap();
        on_debounced(&shared, 0, &[debounced("late.txt")]);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_holds_batches_while_paused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (sender, mut events) = mpsc::unbounded_channel();
        std::fs::write(root.join("a.txt"), "a").unwrap();

        let feed = DirectoryFeed::new();
        {
            let mut state = feed.state();
            state.generation = 1;
            state.subscription = Some(Subscription {
                root: root.clone(),
                watched: root.clone(),
                query: query(),
                known: HashMap::new(),
                sender,
            });
        }

        feed.disable_updates();
        on_debounced(
            &feed.state,
            1,
            &[DebouncedEvent {
                path: root.join("a.txt"),
                kind: notify_debouncer_mini::DebouncedEventKind::Any,
            }],
        );
        assert!(events.try_recv().is_err());

        feed.enable_updates();
        assert!(matches!(events.try_recv(), Ok(FeedEvent::Batch(b)) if b.added.len() == 1));
    }
}
