//! File-backed identity monitor.
//!
//! The active account is whatever token the identity file holds; an absent or
//! blank file means signed out. Changes are picked up with a debounced watch
//! on the file's directory.

use anyhow::{Context, Result};
use docs_core::{IdentityChanged, IdentityMonitor, IdentityToken};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<IdentityChanged>>>>;

/// Read the token from `path`. Missing, unreadable or blank files are `None`.
pub fn read_token(path: &Path) -> Option<IdentityToken> {
    let contents = std::fs::read_to_string(path).ok()?;
    let token = contents.trim();
    (!token.is_empty()).then(|| IdentityToken::new(token))
}

pub struct FileIdentityMonitor {
    path: PathBuf,
    subscribers: Subscribers,
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl FileIdentityMonitor {
    /// Start watching `path`. Its parent directory must exist.
    pub fn watch(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let parent = parent.canonicalize().unwrap_or(parent);
        let file_name = path
            .file_name()
            .with_context(|| format!("Identity file {} has no file name", path.display()))?
            .to_os_string();

        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let notify_to = Arc::clone(&subscribers);

        let mut debouncer = new_debouncer(
            Duration::from_millis(100),
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    if events
                        .iter()
                        .any(|event| event.path.file_name() == Some(file_name.as_os_str()))
                    {
                        debug!("Identity file changed");
                        notify_all(&notify_to);
                    }
                }
                Err(e) => error!("Identity watcher error: {}", e),
            },
        )?;

        debouncer
            .watcher()
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", parent.display()))?;

        info!("Watching identity file {}", path.display());
        Ok(Self {
            path,
            subscribers,
            _debouncer: debouncer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn notify_all(subscribers: &Subscribers) {
    subscribers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|tx| tx.send(IdentityChanged).is_ok());
}

impl IdentityMonitor for FileIdentityMonitor {
    fn current(&self) -> Option<IdentityToken> {
        read_token(&self.path)
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
