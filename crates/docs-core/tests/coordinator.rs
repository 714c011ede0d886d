//! Coordinator tests against the in-memory collaborators.
//!
//! Each test drives the feed and identity by hand and observes the engine only
//! through its handle, the way a UI would.

use std::sync::Arc;
use std::time::Duration;

use docs_core::{
    Collaborators, Coordinator, DocumentId, EngineConfig, EngineError, EngineHandle, EngineView,
    FeedBatch, FeedItem, FixedLocator, IdentityToken, InMemoryStorage, ManualFeed, ManualIdentity,
    OperationKind, PendingOperation, Phase, StorageError,
};
use docs_core::storage::StorageCall;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    handle: EngineHandle,
    feed: Arc<ManualFeed>,
    storage: Arc<InMemoryStorage>,
    identity: Arc<ManualIdentity>,
}

impl Harness {
    fn start(token: Option<&str>, config: EngineConfig) -> Self {
        let feed = Arc::new(ManualFeed::new());
        let storage = Arc::new(InMemoryStorage::new());
        let identity = Arc::new(ManualIdentity::new(token.map(IdentityToken::new)));
        let collaborators = Collaborators {
            storage: storage.clone(),
            feed: feed.clone(),
            locator: Arc::new(FixedLocator::new("/cloud")),
            identity: identity.clone(),
        };
        let (handle, _task) = Coordinator::spawn(config, collaborators);
        Self {
            handle,
            feed,
            storage,
            identity,
        }
    }

    /// Start signed in as `t1` and finish the initial gather with `results`.
    async fn live(results: Vec<FeedItem>) -> Self {
        let harness = Self::start(Some("t1"), EngineConfig::default());
        harness.wait(|v| v.phase == Phase::Gathering).await;
        assert!(harness.feed.finish_gathering(results));
        harness.wait(|v| v.phase == Phase::Live).await;
        harness
    }

    async fn wait(&self, predicate: impl FnMut(&EngineView) -> bool) -> EngineView {
        timeout(WAIT, self.handle.wait_until(predicate))
            .await
            .expect("Timed out waiting for view")
            .expect("Coordinator stopped")
    }
}

fn item(path: &str, ts: u64) -> FeedItem {
    FeedItem::at(path, Some(ts))
}

fn names(view: &EngineView) -> Vec<&str> {
    view.documents.iter().map(|d| d.display_name.as_str()).collect()
}

#[tokio::test]
async fn test_startup_subscribes_to_identity_container() {
    let harness = Harness::live(vec![item("/cloud/t1/a.txt", 1), item("/cloud/t1/b.txt", 2)]).await;

    assert_eq!(harness.feed.starts(), 1);
    assert_eq!(
        harness.feed.root().unwrap().as_path(),
        std::path::Path::new("/cloud/t1")
    );
    assert_eq!(names(&harness.handle.view()), vec!["b", "a"]);
    assert!(!harness.feed.is_paused());
}

#[tokio::test]
async fn test_signed_out_start_stays_uninitialized() {
    let harness = Harness::start(None, EngineConfig::default());
    assert_eq!(
        harness.handle.create("A", "").await,
        Err(EngineError::ContainerUnresolved)
    );
    assert_eq!(harness.handle.view().phase, Phase::Uninitialized);
    assert_eq!(harness.feed.starts(), 0);
    assert_eq!(harness.storage.calls(), 0);
}

#[tokio::test]
async fn test_create_stays_pending_until_feed_confirms() {
    let harness = Harness::live(vec![]).await;

    let id = harness.handle.create("  Plan ", "hello").await.unwrap();
    assert_eq!(id, DocumentId::from("/cloud/t1/Plan.txt"));
    assert!(harness.storage.contains(&id));

    let view = harness.handle.view();
    assert!(view.busy);
    assert!(view.documents.is_empty(), "cache must not change speculatively");
    assert_eq!(
        view.pending,
        Some(PendingOperation::new(OperationKind::Create, id.clone()))
    );

    harness.feed.push_batch(FeedBatch {
        added: vec![item("/cloud/t1/Plan.txt", 10)],
        ..Default::default()
    });
    let view = harness.wait(|v| !v.busy).await;
    assert_eq!(names(&view), vec!["Plan"]);
}

#[tokio::test]
async fn test_unrelated_batch_keeps_create_pending() {
    let harness = Harness::live(vec![]).await;
    harness.handle.create("X", "").await.unwrap();

    harness.feed.push_batch(FeedBatch {
        added: vec![item("/cloud/t1/Y.txt", 1)],
        ..Default::default()
    });
    let view = harness.wait(|v| v.documents.len() == 1).await;
    assert_eq!(
        view.pending,
        Some(PendingOperation::new(
            OperationKind::Create,
            "/cloud/t1/X.txt".into()
        ))
    );
}

#[tokio::test]
async fn test_duplicate_create_makes_no_storage_call() {
    let harness = Harness::live(vec![item("/cloud/t1/A.txt", 1)]).await;
    harness
        .handle
        .update("/cloud/t1/A.txt".into(), "edit")
        .await
        .unwrap();
    let calls = harness.storage.calls();

    let result = harness.handle.create("A", "").await;
    assert_eq!(
        result,
        Err(EngineError::AlreadyExists("/cloud/t1/A.txt".into()))
    );
    assert_eq!(harness.storage.calls(), calls);

    let view = harness.handle.view();
    assert_eq!(
        view.pending,
        Some(PendingOperation::new(
            OperationKind::Update,
            "/cloud/t1/A.txt".into()
        ))
    );
    assert!(view.error.is_some());
}

#[tokio::test]
async fn test_create_rejects_names_the_feed_cannot_report() {
    let harness = Harness::live(vec![]).await;

    for name in ["/tmp/x/escaped", "../escaped", "a/b", ".notes"] {
        assert_eq!(
            harness.handle.create(name, "").await,
            Err(EngineError::InvalidName(name.to_string()))
        );
    }
    assert_eq!(harness.storage.calls(), 0);
    assert!(!harness.handle.view().busy);
}

#[tokio::test]
async fn test_storage_failure_clears_pending_and_keeps_cache() {
    let harness = Harness::live(vec![item("/cloud/t1/A.txt", 1)]).await;
    harness.storage.fail_next(
        StorageCall::Delete,
        StorageError::Io("permission denied".into()),
    );

    let result = harness.handle.delete("/cloud/t1/A.txt".into()).await;
    assert_eq!(
        result,
        Err(EngineError::Storage(StorageError::Io(
            "permission denied".into()
        )))
    );

    let view = harness.handle.view();
    assert!(!view.busy);
    assert_eq!(names(&view), vec!["A"]);
    assert_eq!(view.error, result.err());

    harness.handle.dismiss_error();
    harness.wait(|v| v.error.is_none()).await;
}

#[tokio::test]
async fn test_delete_confirmed_by_removal() {
    let harness =
        Harness::live(vec![item("/cloud/t1/A.txt", 1), item("/cloud/t1/B.txt", 2)]).await;
    harness.handle.select(Some("/cloud/t1/A.txt".into())).await.unwrap();
    harness.handle.delete("/cloud/t1/A.txt".into()).await.unwrap();
    assert!(harness.handle.view().busy);

    harness.feed.push_batch(FeedBatch {
        removed: vec![FeedItem::at("/cloud/t1/A.txt", None)],
        ..Default::default()
    });
    let view = harness.wait(|v| !v.busy).await;
    assert_eq!(names(&view), vec!["B"]);
    assert!(view.selection.is_none());
}

#[tokio::test]
async fn test_identity_change_restarts_subscription() {
    let harness = Harness::live(vec![item("/cloud/t1/a.txt", 1)]).await;
    harness
        .handle
        .update("/cloud/t1/a.txt".into(), "x")
        .await
        .unwrap();

    harness.identity.set(Some(IdentityToken::new("t2")));
    let view = harness.wait(|v| v.phase == Phase::Gathering).await;

    assert!(view.documents.is_empty());
    assert!(view.pending.is_none());
    assert_eq!(harness.feed.starts(), 2);
    assert_eq!(harness.feed.stops(), 1);
    assert_eq!(
        harness.feed.root().unwrap().as_path(),
        std::path::Path::new("/cloud/t2")
    );
}

#[tokio::test]
async fn test_redundant_identity_notification_is_ignored() {
    let harness = Harness::live(vec![item("/cloud/t1/a.txt", 1)]).await;

    harness.identity.notify();
    // Identity notifications are handled before commands queued after them.
    harness.handle.select(None).await.unwrap();

    assert_eq!(harness.feed.starts(), 1);
    assert_eq!(harness.feed.stops(), 0);
    assert_eq!(names(&harness.handle.view()), vec!["a"]);
}

#[tokio::test]
async fn test_sign_out_tears_down_until_sign_in() {
    let harness = Harness::live(vec![item("/cloud/t1/a.txt", 1)]).await;

    harness.identity.set(None);
    let view = harness
        .wait(|v| v.phase == Phase::Uninitialized && v.documents.is_empty())
        .await;
    assert!(view.pending.is_none());
    assert!(!harness.feed.is_running());

    harness.identity.set(Some(IdentityToken::new("t1")));
    harness.wait(|v| v.phase == Phase::Gathering).await;
    assert_eq!(harness.feed.starts(), 2);
}

#[tokio::test]
async fn test_reload_all_reads_snapshot_with_updates_paused() {
    let harness = Harness::live(vec![item("/cloud/t1/a.txt", 1)]).await;
    harness
        .feed
        .set_results(vec![item("/cloud/t1/b.txt", 5), item("/cloud/t1/c.txt", 7)]);

    harness.handle.reload_all().await.unwrap();

    assert_eq!(names(&harness.handle.view()), vec!["c", "b"]);
    assert_eq!(harness.feed.pauses(), 2);
    assert!(!harness.feed.is_paused());
}

#[tokio::test]
async fn test_reload_failure_resumes_updates() {
    let harness = Harness::live(vec![item("/cloud/t1/a.txt", 1)]).await;
    harness
        .feed
        .fail_next_snapshot(docs_core::FeedError::SnapshotFailed("busy".into()));

    assert!(harness.handle.reload_all().await.is_err());
    assert!(!harness.feed.is_paused());
    assert_eq!(names(&harness.handle.view()), vec!["a"]);
}

#[tokio::test]
async fn test_read_rejects_invalid_utf8() {
    let harness = Harness::live(vec![item("/cloud/t1/a.txt", 1)]).await;
    harness.storage.insert("/cloud/t1/a.txt", &[0xff, 0xfe]);
    harness.storage.insert("/cloud/t1/b.txt", b"fine");

    assert_eq!(
        harness.handle.read("/cloud/t1/a.txt".into()).await,
        Err(EngineError::ContentEncodingFailed("/cloud/t1/a.txt".into()))
    );
    assert_eq!(
        harness.handle.read("/cloud/t1/b.txt".into()).await.unwrap(),
        "fine"
    );
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_timeout_clears_pending() {
    let harness = Harness::start(
        Some("t1"),
        EngineConfig {
            confirmation_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        },
    );
    harness.wait(|v| v.phase == Phase::Gathering).await;
    harness.feed.finish_gathering(vec![]);
    harness.wait(|v| v.phase == Phase::Live).await;

    harness.handle.create("slow", "").await.unwrap();
    let view = harness.wait(|v| !v.busy).await;
    assert_eq!(
        view.error,
        Some(EngineError::ConfirmationTimedOut(
            "/cloud/t1/slow.txt".into()
        ))
    );
}

#[tokio::test]
async fn test_handle_after_shutdown_reports_stopped() {
    let harness = Harness::live(vec![]).await;
    harness.handle.shutdown();

    let result = timeout(WAIT, async {
        loop {
            match harness.handle.select(None).await {
                Err(EngineError::Stopped) => break,
                _ => tokio::task::yield_now().await,
            }
        }
    })
    .await;
    assert!(result.is_ok());
    assert!(!harness.feed.is_running());
}
