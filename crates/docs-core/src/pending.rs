//! Tracking for the single in-flight local mutation.
//!
//! At most one mutation is tracked at a time. A new request replaces whatever
//! was tracked before; the slot is cleared when any feed batch mentions the
//! tracked target, whatever bucket it lands in, since another client may have
//! changed the document differently in the meantime.

use crate::document::DocumentId;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A locally issued mutation awaiting confirmation from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub target: DocumentId,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, target: DocumentId) -> Self {
        Self { kind, target }
    }
}

/// Holder for the pending slot and the time it was filled.
#[derive(Debug, Default)]
pub struct PendingTracker {
    slot: Option<(PendingOperation, Instant)>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `operation`, replacing anything tracked before.
    pub fn begin(&mut self, operation: PendingOperation) -> Option<PendingOperation> {
        self.slot
            .replace((operation, Instant::now()))
            .map(|(previous, _)| previous)
    }

    pub fn current(&self) -> Option<&PendingOperation> {
        self.slot.as_ref().map(|(operation, _)| operation)
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_some()
    }

    pub fn clear(&mut self) -> Option<PendingOperation> {
        self.slot.take().map(|(operation, _)| operation)
    }

    /// Clear the slot only if it still tracks exactly `operation`.
    pub fn clear_if(&mut self, operation: &PendingOperation) -> bool {
        if self.current() == Some(operation) {
            self.slot = None;
            true
        } else {
            false
        }
    }

    /// Clear the slot if `mentioned` reports the tracked target.
    ///
    /// There is no request/response correlation beyond the id: an older batch
    /// that happens to mention the target also confirms a newer mutation.
    pub fn confirm_with(&mut self, mentioned: impl Fn(&DocumentId) -> bool) -> Option<PendingOperation> {
        match self.current() {
            Some(operation) if mentioned(&operation.target) => self.clear(),
            _ => None,
        }
    }

    /// Instant at which the tracked operation times out, if any.
    pub fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        let timeout = timeout?;
        self.slot.as_ref().map(|(_, issued_at)| *issued_at + timeout)
    }

    /// Clear and return the tracked operation if it is older than `timeout` at `now`.
    pub fn expire(&mut self, timeout: Option<Duration>, now: Instant) -> Option<PendingOperation> {
        match self.deadline(timeout) {
            Some(deadline) if now >= deadline => self.clear(),
            _ => None,
        }
    }
}
