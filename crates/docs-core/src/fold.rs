//! Folding feed batches into the document cache.

use crate::document::{DocumentId, DocumentMetadata, FeedItem};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// One delivery from the metadata feed, classified into add/update/remove sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedBatch {
    pub added: Vec<FeedItem>,
    pub updated: Vec<FeedItem>,
    pub removed: Vec<FeedItem>,
}

impl FeedBatch {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Drop items that cannot be resolved to both an id and a name.
    pub fn resolve(&self) -> ResolvedBatch {
        let total = self.added.len() + self.updated.len() + self.removed.len();
        let resolved = ResolvedBatch {
            added: resolve_all(&self.added),
            updated: resolve_all(&self.updated),
            removed: resolve_all(&self.removed),
        };
        let dropped = total - resolved.len();
        if dropped > 0 {
            debug!("Dropped {} unresolvable feed item(s)", dropped);
        }
        resolved
    }
}

fn resolve_all(items: &[FeedItem]) -> Vec<DocumentMetadata> {
    items.iter().filter_map(FeedItem::resolve).collect()
}

/// A batch whose items all resolved to cache metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedBatch {
    pub added: Vec<DocumentMetadata>,
    pub updated: Vec<DocumentMetadata>,
    pub removed: Vec<DocumentMetadata>,
}

impl ResolvedBatch {
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` appears in any of the three buckets.
    pub fn mentions(&self, id: &DocumentId) -> bool {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .any(|item| &item.id == id)
    }
}

/// Apply `batch` on top of `cache`, returning the new, unsorted working set.
///
/// - added items are appended unless their id is already present
/// - updated items replace any cached copy, even one with a newer timestamp
/// - removed ids are dropped
pub fn fold_batch(cache: &[DocumentMetadata], batch: &ResolvedBatch) -> Vec<DocumentMetadata> {
    let mut working = cache.to_vec();

    for item in &batch.added {
        if !working.iter().any(|existing| existing.id == item.id) {
            working.push(item.clone());
        }
    }

    for item in &batch.updated {
        working.retain(|existing| existing.id != item.id);
        working.push(item.clone());
    }

    working.retain(|existing| !batch.removed.iter().any(|removed| removed.id == existing.id));

    working
}

/// Sort descending by last-modified time. Missing timestamps count as `now_ms`.
///
/// The sort is stable, so documents with equal timestamps keep their relative order.
pub fn sort_by_last_modified(documents: &mut [DocumentMetadata], now_ms: u64) {
    documents.sort_by_key(|doc| Reverse(doc.last_modified.unwrap_or(now_ms)));
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolve a full result set into a sorted cache, collapsing duplicate ids
/// (the last reported copy wins).
pub fn snapshot_to_cache(items: &[FeedItem], now_ms: u64) -> Vec<DocumentMetadata> {
    let mut documents: Vec<DocumentMetadata> = Vec::with_capacity(items.len());
    for item in items.iter().filter_map(FeedItem::resolve) {
        documents.retain(|existing| existing.id != item.id);
        documents.push(item);
    }
    sort_by_last_modified(&mut documents, now_ms);
    documents
}
