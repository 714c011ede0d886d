//! Account identity as reported by the platform.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Opaque token identifying the active account session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification that the identity may have changed.
///
/// Carries no token: receivers re-read [`IdentityMonitor::current`] and compare,
/// since platforms post these redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityChanged;

/// Source of the current account identity.
pub trait IdentityMonitor: Send + Sync {
    /// Current token, `None` when no account is signed in.
    fn current(&self) -> Option<IdentityToken>;

    /// Stream of change notifications.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<IdentityChanged>;
}

/// Identity monitor driven by hand, for tests and embedding.
#[derive(Default)]
pub struct ManualIdentity {
    token: Mutex<Option<IdentityToken>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<IdentityChanged>>>,
}

impl ManualIdentity {
    pub fn new(token: Option<IdentityToken>) -> Self {
        Self {
            token: Mutex::new(token),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Replace the token and notify subscribers.
    pub fn set(&self, token: Option<IdentityToken>) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token;
        self.notify();
    }

    /// Post a notification without changing the token.
    pub fn notify(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(IdentityChanged).is_ok());
    }
}

impl IdentityMonitor for ManualIdentity {
    fn current(&self) -> Option<IdentityToken> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<IdentityChanged> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}
