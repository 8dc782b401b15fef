//! Change notifications for the snapshot record.
//!
//! Another process sharing the record (a second window, another CLI run)
//! rewrites or deletes it on login/logout. The watcher forwards those
//! changes so every process converges on the same identity.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Keeps the OS watch alive; dropping it closes the change channel.
pub struct SnapshotWatcher {
    _watcher: RecommendedWatcher,
}

impl SnapshotWatcher {
    /// Watch the directory holding `record` and signal on `tx` whenever the
    /// record itself changes.
    pub fn start(record: &Path, tx: mpsc::UnboundedSender<()>) -> Result<Self> {
        let dir = record
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create snapshot directory {}", dir.display()))?;

        let record = record.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_record_change(&event, &record) => {
                debug!(kind = ?event.kind, "Snapshot record changed");
                // Receiver gone means the session manager was dropped
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Snapshot watch error"),
        })
        .context("Failed to create snapshot watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        Ok(Self { _watcher: watcher })
    }
}

/// The watch covers the whole directory; only events touching the record
/// (by file name) count. Temp files written before the atomic rename do not.
fn is_record_change(event: &Event, record: &Path) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    let Some(name) = record.file_name() else {
        return false;
    };
    event.paths.iter().any(|path| path.file_name() == Some(name))
}
