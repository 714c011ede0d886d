//! Coordinator: the single task that owns the engine.
//!
//! Every input (caller commands, feed events, identity notifications and the
//! completions of spawned storage/locator/snapshot work) arrives over a
//! channel and is handled one at a time, so the cache and the pending slot
//! have exactly one writer. Slow calls never run on the loop itself: they are
//! spawned, and their results come back as completions tagged with the
//! identity session that issued them.

use crate::document::{ContainerRoot, DocumentId, FeedItem};
use crate::engine::{
    EngineConfig, EngineError, EngineView, IdentityTransition, ReconciliationEngine, Result,
};
use crate::feed::{self, FeedEvent, MetadataFeed, UpdatesPaused};
use crate::identity::{IdentityChanged, IdentityMonitor, IdentityToken};
use crate::pending::{OperationKind, PendingOperation};
use crate::storage::{self, ContainerLocator, StorageBackend};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// External collaborators, constructed by the embedder.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn StorageBackend>,
    pub feed: Arc<dyn MetadataFeed>,
    pub locator: Arc<dyn ContainerLocator>,
    pub identity: Arc<dyn IdentityMonitor>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Request from an [`EngineHandle`].
enum Command {
    Create {
        name: String,
        content: String,
        reply: Reply<DocumentId>,
    },
    Update {
        target: DocumentId,
        content: String,
        reply: Reply<DocumentId>,
    },
    Delete {
        target: DocumentId,
        reply: Reply<DocumentId>,
    },
    Read {
        target: DocumentId,
        reply: Reply<String>,
    },
    ReloadAll {
        reply: Reply<()>,
    },
    Select {
        id: Option<DocumentId>,
        reply: Reply<()>,
    },
    DismissError,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotPurpose {
    InitialGather,
    Reload,
}

/// Result of work spawned off the loop.
enum Completion {
    ContainerLocated {
        session: u64,
        result: storage::Result<Option<ContainerRoot>>,
    },
    MutationFinished {
        session: u64,
        operation: PendingOperation,
        result: storage::Result<()>,
        reply: Reply<DocumentId>,
    },
    ReadFinished {
        session: u64,
        target: DocumentId,
        result: storage::Result<Vec<u8>>,
        reply: Reply<String>,
    },
    SnapshotCaptured {
        session: u64,
        purpose: SnapshotPurpose,
        result: feed::Result<Vec<FeedItem>>,
        reply: Option<Reply<()>>,
    },
}

/// Cloneable caller-side handle to a running coordinator.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<EngineView>,
}

impl EngineHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::Stopped)?;
        response.await.unwrap_or(Err(EngineError::Stopped))
    }

    /// Create a document named `name` in the container.
    ///
    /// Resolves once the storage backend has written the bytes; the document
    /// shows up in the view only after the feed confirms it.
    pub async fn create(&self, name: impl Into<String>, content: impl Into<String>) -> Result<DocumentId> {
        let (name, content) = (name.into(), content.into());
        self.request(|reply| Command::Create {
            name,
            content,
            reply,
        })
        .await
    }

    pub async fn update(&self, target: DocumentId, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.request(|reply| Command::Update {
            target,
            content,
            reply,
        })
        .await
        .map(|_| ())
    }

    pub async fn delete(&self, target: DocumentId) -> Result<()> {
        self.request(|reply| Command::Delete { target, reply })
            .await
            .map(|_| ())
    }

    /// Read a document's content as UTF-8 text.
    pub async fn read(&self, target: DocumentId) -> Result<String> {
        self.request(|reply| Command::Read { target, reply }).await
    }

    /// Replace the cache with a full snapshot of the feed's results.
    pub async fn reload_all(&self) -> Result<()> {
        self.request(|reply| Command::ReloadAll { reply }).await
    }

    pub async fn select(&self, id: Option<DocumentId>) -> Result<()> {
        self.request(|reply| Command::Select { id, reply }).await
    }

    pub fn dismiss_error(&self) {
        let _ = self.commands.send(Command::DismissError);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Latest published view.
    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineView> {
        self.view.clone()
    }

    /// Wait until the published view satisfies `predicate`.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&EngineView) -> bool) -> Result<EngineView> {
        let mut view = self.view.clone();
        let matched = view
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok(matched.clone())
    }
}

/// Owner of the engine and its event loop.
pub struct Coordinator {
    engine: ReconciliationEngine,
    storage: Arc<dyn StorageBackend>,
    feed: Arc<dyn MetadataFeed>,
    locator: Arc<dyn ContainerLocator>,
    identity: Arc<dyn IdentityMonitor>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    identity_rx: mpsc::UnboundedReceiver<IdentityChanged>,
    feed_rx: Option<mpsc::UnboundedReceiver<FeedEvent>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    view_tx: watch::Sender<EngineView>,
}

impl Coordinator {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let engine = ReconciliationEngine::new(config);
        let (view_tx, view_rx) = watch::channel(engine.view());
        let identity_rx = collaborators.identity.subscribe();

        let coordinator = Self {
            engine,
            storage: collaborators.storage,
            feed: collaborators.feed,
            locator: collaborators.locator,
            identity: collaborators.identity,
            command_rx,
            identity_rx,
            feed_rx: None,
            completion_tx,
            completion_rx,
            view_tx,
        };
        let handle = EngineHandle {
            commands: command_tx,
            view: view_rx,
        };
        (coordinator, handle)
    }

    /// Build a coordinator and run it on the current tokio runtime.
    pub fn spawn(config: EngineConfig, collaborators: Collaborators) -> (EngineHandle, JoinHandle<()>) {
        let (coordinator, handle) = Self::new(config, collaborators);
        (handle, tokio::spawn(coordinator.run()))
    }

    /// Run until shutdown is requested or every handle is dropped.
    pub async fn run(mut self) {
        info!("Coordinator started");
        self.on_identity_changed().await;
        self.publish();

        loop {
            tokio::select! {
                // Completions first: a snapshot completion must be applied
                // before the feed events held back while it was captured.
                biased;

                Some(completion) = self.completion_rx.recv() => {
                    self.on_completion(completion).await;
                }

                Some(IdentityChanged) = self.identity_rx.recv() => {
                    self.on_identity_changed().await;
                }

                command = self.command_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },

                event = next_feed_event(&mut self.feed_rx) => {
                    self.on_feed_event(event);
                }

                _ = wait_for_deadline(self.engine.confirmation_deadline()) => {
                    if let Some(expired) = self.engine.expire_pending(Instant::now()) {
                        warn!("No confirmation for {:?} of {}", expired.kind, expired.target);
                    }
                }
            }

            self.publish();
        }

        self.feed.stop().await;
        self.feed_rx = None;
        info!("Coordinator stopped");
    }

    /// Publish the current view, then answer the caller, so that a caller
    /// reading the view after its reply sees the effect of its request.
    fn respond<T>(&self, reply: Reply<T>, outcome: Result<T>) {
        self.publish();
        let _ = reply.send(outcome);
    }

    fn publish(&self) {
        let view = self.engine.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    async fn on_identity_changed(&mut self) {
        let token = self.identity.current();
        match self.engine.on_identity(token) {
            IdentityTransition::Unchanged => {}
            IdentityTransition::Locate { identity, session } => {
                self.stop_feed().await;
                self.spawn_locate(identity, session);
            }
            IdentityTransition::SignedOut => {
                self.stop_feed().await;
            }
        }
    }

    fn spawn_locate(&self, identity: IdentityToken, session: u64) {
        let locator = Arc::clone(&self.locator);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = locator.locate(&identity).await;
            let _ = completions.send(Completion::ContainerLocated { session, result });
        });
    }

    // ------------------------------------------------------------------
    // Feed
    // ------------------------------------------------------------------

    async fn start_feed(&mut self, root: ContainerRoot) {
        let query = self.engine.config().query();
        match self.feed.start(&root, &query).await {
            Ok(events) => {
                info!(
                    "Subscription started for {} ({})",
                    root.as_path().display(),
                    query.pattern
                );
                self.feed_rx = Some(events);
            }
            Err(e) => {
                error!("Failed to start subscription: {}", e);
                self.engine.record_error(e.into());
            }
        }
    }

    async fn stop_feed(&mut self) {
        if self.feed_rx.take().is_some() {
            info!("Subscription stopped");
        }
        self.feed.stop().await;
    }

    fn on_feed_event(&mut self, event: Option<FeedEvent>) {
        match event {
            Some(FeedEvent::InitialGatherComplete) => {
                info!("Initial gather complete");
                self.spawn_snapshot(SnapshotPurpose::InitialGather, None);
            }
            Some(FeedEvent::Batch(batch)) => {
                let outcome = self.engine.apply_batch(&batch);
                if outcome.selection_cleared {
                    info!("Selected document was removed");
                }
            }
            None => {
                warn!("Feed subscription ended");
                self.feed_rx = None;
            }
        }
    }

    /// Capture the feed's full result set with live updates held.
    ///
    /// The completion is sent before the pause guard drops, so it is queued
    /// ahead of any event the feed releases on resume.
    fn spawn_snapshot(&self, purpose: SnapshotPurpose, reply: Option<Reply<()>>) {
        let feed = Arc::clone(&self.feed);
        let completions = self.completion_tx.clone();
        let session = self.engine.session();
        tokio::spawn(async move {
            let paused = UpdatesPaused::new(feed);
            let result = paused.snapshot().await;
            let _ = completions.send(Completion::SnapshotCaptured {
                session,
                purpose,
                result,
                reply,
            });
            drop(paused);
        });
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Create {
                name,
                content,
                reply,
            } => match self.engine.prepare_create(&name) {
                Ok(operation) => self.spawn_mutation(operation, content.into_bytes(), reply),
                Err(e) => {
                    debug!("Rejected create of {:?}: {}", name, e);
                    self.respond(reply, Err(e));
                }
            },
            Command::Update {
                target,
                content,
                reply,
            } => {
                let operation = self.engine.prepare_update(target);
                self.spawn_mutation(operation, content.into_bytes(), reply);
            }
            Command::Delete { target, reply } => {
                let operation = self.engine.prepare_delete(target);
                self.spawn_mutation(operation, Vec::new(), reply);
            }
            Command::Read { target, reply } => self.spawn_read(target, reply),
            Command::ReloadAll { reply } => {
                if self.feed_rx.is_none() {
                    let error = self.engine.record_error(EngineError::ContainerUnresolved);
                    self.respond(reply, Err(error));
                    return;
                }
                info!("Reloading all documents");
                self.spawn_snapshot(SnapshotPurpose::Reload, Some(reply));
            }
            Command::Select { id, reply } => {
                let outcome = self.engine.select(id);
                self.respond(reply, outcome);
            }
            Command::DismissError => {
                self.engine.dismiss_error();
            }
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn spawn_mutation(&self, operation: PendingOperation, content: Vec<u8>, reply: Reply<DocumentId>) {
        let storage = Arc::clone(&self.storage);
        let completions = self.completion_tx.clone();
        let session = self.engine.session();
        tokio::spawn(async move {
            let result = match operation.kind {
                OperationKind::Create | OperationKind::Update => {
                    storage.write(&operation.target, &content).await
                }
                OperationKind::Delete => storage.delete(&operation.target).await,
            };
            let _ = completions.send(Completion::MutationFinished {
                session,
                operation,
                result,
                reply,
            });
        });
    }

    fn spawn_read(&self, target: DocumentId, reply: Reply<String>) {
        let storage = Arc::clone(&self.storage);
        let completions = self.completion_tx.clone();
        let session = self.engine.session();
        tokio::spawn(async move {
            let result = storage.read(&target).await;
            let _ = completions.send(Completion::ReadFinished {
                session,
                target,
                result,
                reply,
            });
        });
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    async fn on_completion(&mut self, completion: Completion) {
        let current = self.engine.session();
        match completion {
            Completion::ContainerLocated { session, result } => match result {
                Ok(root) => {
                    if let Some(root) = self.engine.on_container_located(session, root) {
                        self.start_feed(root).await;
                    }
                }
                Err(e) => {
                    warn!("Failed to locate container: {}", e);
                    self.engine.on_session_error(session, e.into());
                }
            },

            Completion::MutationFinished {
                session,
                operation,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => {
                        debug!("Storage accepted {:?} of {}", operation.kind, operation.target);
                        Ok(operation.target)
                    }
                    Err(e) => {
                        warn!("Storage failed {:?} of {}: {}", operation.kind, operation.target, e);
                        let error = EngineError::Storage(e);
                        if session == current {
                            Err(self.engine.on_mutation_failed(&operation, error))
                        } else {
                            Err(error)
                        }
                    }
                };
                self.respond(reply, outcome);
            }

            Completion::ReadFinished {
                session,
                target,
                result,
                reply,
            } => {
                let outcome = result.map_err(EngineError::from).and_then(|bytes| {
                    String::from_utf8(bytes).map_err(|_| EngineError::ContentEncodingFailed(target))
                });
                if let Err(e) = &outcome {
                    self.engine.on_session_error(session, e.clone());
                }
                self.respond(reply, outcome);
            }

            Completion::SnapshotCaptured {
                session,
                purpose,
                result,
                reply,
            } => {
                let outcome = if session != current {
                    debug!("Discarding snapshot from session {}", session);
                    Ok(())
                } else {
                    match result {
                        Ok(items) => {
                            match purpose {
                                SnapshotPurpose::InitialGather => {
                                    self.engine.on_initial_gather_complete(&items)
                                }
                                SnapshotPurpose::Reload => self.engine.replace_with_snapshot(&items),
                            }
                            Ok(())
                        }
                        Err(e) => {
                            error!("Failed to read result snapshot: {}", e);
                            Err(self.engine.record_error(e.into()))
                        }
                    }
                };
                if let Some(reply) = reply {
                    self.respond(reply, outcome);
                }
            }
        }
    }
}

async fn next_feed_event(events: &mut Option<mpsc::UnboundedReceiver<FeedEvent>>) -> Option<FeedEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
