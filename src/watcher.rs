//! # File System Watcher
//!
//! Bridges `notify` events into a running client. Every event path is
//! handed to [`ClientHandle::notify_change`], which folds repeated changes to
//! the same path into a single pending entry, so no separate debounce stage
//! is needed here.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use treesync::client::Client;
//! use treesync::config::ClientConfig;
//! use treesync::events::NullObserver;
//! use treesync::watcher::FsWatcher;
//!
//! async fn watch_root() -> anyhow::Result<()> {
//!     let mut client = Client::new(ClientConfig::default(), Arc::new(NullObserver));
//!     client.connect().await?;
//!
//!     let handle = client.handle();
//!     let _watcher = FsWatcher::start(handle.root(), handle.clone())?;
//!     tokio::signal::ctrl_c().await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::client::{ChangeKind, ClientHandle};

/// Watches a sync root until dropped.
pub struct FsWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    pub fn start(root: &Path, handle: ClientHandle) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let Some(kind) = event_kind_to_change_kind(&event.kind) else {
                    debug!("Ignoring file event: {:?}", event.kind);
                    return;
                };
                for path in &event.paths {
                    handle.notify_change(path, kind);
                }
            }
            Err(e) => warn!("File watcher error: {}", e),
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        info!("Watching {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        debug!("Stopped watching {}", self.root.display());
    }
}

/// Map a notify event kind onto a pending change. Access and metadata-only
/// events carry no content change and map to `None`.
pub fn event_kind_to_change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}
