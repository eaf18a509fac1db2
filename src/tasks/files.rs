use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Error;
use crate::events::{ChangeEvent, ChangeKind};
use crate::notifications::ClientRegistry;

/// Watches the content tree and broadcasts file additions and removals.
///
/// Files already present at startup produce nothing; only later changes do.
/// Paths more than `max_depth` directory levels below `root` are ignored.
#[instrument(skip(registry, cancel), fields(root = %root.display()))]
pub async fn run(
    root: PathBuf,
    max_depth: usize,
    registry: Arc<ClientRegistry>,
    cancel: CancellationToken,
) -> Result<()> {
    if !root.is_dir() {
        warn!(error = %Error::WatchTargetMissing(root), "content watcher skipped");
        return Ok(());
    }
    let root = match root.canonicalize() {
        Ok(root) => root,
        Err(err) => {
            warn!(error = %err, "content watcher skipped");
            return Ok(());
        }
    };

    // Bridge notify callback -> async channel
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Result<Event>>(128);
    let mut _watcher = match recommended_watcher(move |res| {
        let _ = watch_tx.blocking_send(res);
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(error = %err, "failed to create content watcher; skipped");
            return Ok(());
        }
    };
    if let Err(err) = _watcher.watch(&root, RecursiveMode::Recursive) {
        warn!(error = %err, "content watcher skipped");
        return Ok(());
    }
    info!(watching = %root.display(), max_depth, "content watcher initialized (recursive)");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cancel received; exiting content watcher");
                break;
            }

            Some(res) = watch_rx.recv() => match res {
                Ok(event) => {
                    debug!(kind = ?event.kind, paths = ?event.paths, "notify event");
                    let changes = classify(&event, &root, max_depth);
                    if changes.is_empty() {
                        debug!(kind = ?event.kind, "fs: ignored");
                    }
                    for change in changes {
                        match change.kind {
                            ChangeKind::Added => info!(path = %change.path.display(), "fs: add"),
                            ChangeKind::Removed => info!(path = %change.path.display(), "fs: remove"),
                        }
                        registry.broadcast(&change);
                    }
                }
                Err(err) => error!("watch error: {err}"),
            }
        }
    }
    Ok(())
}

/// Maps one notify event to the file changes clients care about.
pub fn classify(event: &Event, root: &Path, max_depth: usize) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();
    match &event.kind {
        EventKind::Create(CreateKind::File) => {
            for p in event.paths.iter().filter(|p| within_depth(p, root, max_depth)) {
                changes.push(ChangeEvent::added(p));
            }
        }
        EventKind::Create(CreateKind::Any | CreateKind::Other) => {
            for p in event
                .paths
                .iter()
                .filter(|p| within_depth(p, root, max_depth) && p.is_file())
            {
                changes.push(ChangeEvent::added(p));
            }
        }
        EventKind::Remove(RemoveKind::File | RemoveKind::Any | RemoveKind::Other) => {
            for p in event.paths.iter().filter(|p| within_depth(p, root, max_depth)) {
                changes.push(ChangeEvent::removed(p));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for p in event.paths.iter().filter(|p| within_depth(p, root, max_depth)) {
                changes.push(ChangeEvent::removed(p));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for p in event
                .paths
                .iter()
                .filter(|p| within_depth(p, root, max_depth) && p.is_file())
            {
                changes.push(ChangeEvent::added(p));
            }
        }
        // inotify reports a rename as From, To and then Both; the halves already covered it.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {}
        EventKind::Modify(ModifyKind::Name(_)) => {
            // macOS often reports moves as Name(Any). Decide per-path by existence.
            for p in event.paths.iter().filter(|p| within_depth(p, root, max_depth)) {
                if p.is_file() {
                    changes.push(ChangeEvent::added(p));
                } else if !p.exists() {
                    changes.push(ChangeEvent::removed(p));
                }
            }
        }
        _ => {}
    }
    changes
}

fn within_depth(path: &Path, root: &Path, max_depth: usize) -> bool {
    match path.strip_prefix(root) {
        Ok(rel) => rel.components().count().saturating_sub(1) <= max_depth,
        Err(_) => false,
    }
}
