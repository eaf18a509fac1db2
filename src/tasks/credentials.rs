use std::ffi::OsStr;
use std::path::PathBuf;

use anyhow::Result;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher, recommended_watcher};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Error;
use crate::pipeline::{Step, SyncPipeline};

/// Progress of one credential-change chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    RunningFullSync,
    RunningSetupSync,
    RunningRegister,
    Restarting,
    Done,
}

impl ChainState {
    fn step(self) -> Option<Step> {
        match self {
            Self::RunningFullSync => Some(Step::FullSync),
            Self::RunningSetupSync => Some(Step::SetupSync),
            Self::RunningRegister => Some(Step::RegisterDevice),
            Self::Restarting => Some(Step::Restart),
            Self::Idle | Self::Done => None,
        }
    }

    fn advance(self) -> Self {
        match self {
            Self::Idle => Self::RunningFullSync,
            Self::RunningFullSync => Self::RunningSetupSync,
            Self::RunningSetupSync => Self::RunningRegister,
            Self::RunningRegister => Self::Restarting,
            Self::Restarting | Self::Done => Self::Done,
        }
    }
}

#[derive(Debug)]
pub enum ChainOutcome {
    /// All steps succeeded and the restart command was accepted.
    Restarted,
    /// `step` failed; nothing after it ran.
    Failed { step: Step, error: Error },
}

/// Full sync, setup sync, device registration, then restart, one at a time.
///
/// The first failing step ends the chain. The restart only happens when the
/// three sync steps all succeeded.
pub async fn run_chain(pipeline: &SyncPipeline) -> ChainOutcome {
    let mut state = ChainState::Idle.advance();
    while let Some(step) = state.step() {
        debug!(?state, "credential chain advancing");
        let report = pipeline.run(step).await;
        if let Err(error) = report.check() {
            error!(%step, error = %error, "credential chain aborted");
            return ChainOutcome::Failed { step, error };
        }
        state = state.advance();
    }
    info!("credential chain complete; service restart requested");
    ChainOutcome::Restarted
}

/// Watches `credentials_path` and runs [`run_chain`] once per observed write.
///
/// Content is never compared, so rewriting identical bytes still counts.
/// Chains from separate writes run independently of each other and of the
/// scheduler.
#[instrument(skip_all, fields(path = %credentials_path.display()))]
pub async fn run(
    credentials_path: PathBuf,
    pipeline: SyncPipeline,
    cancel: CancellationToken,
) -> Result<()> {
    let (dir, file_name) = match (credentials_path.parent(), credentials_path.file_name()) {
        (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_os_string()),
        _ => {
            warn!("credentials path has no parent directory; watcher skipped");
            return Ok(());
        }
    };
    if !dir.is_dir() {
        warn!(error = %Error::WatchTargetMissing(dir), "credential watcher skipped");
        return Ok(());
    }

    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Result<Event>>(64);
    let mut watcher = match recommended_watcher(move |res| {
        let _ = watch_tx.blocking_send(res);
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(error = %err, "failed to create credential watcher; skipped");
            return Ok(());
        }
    };
    if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        warn!(error = %err, dir = %dir.display(), "credential watcher skipped");
        return Ok(());
    }
    info!("watching credentials for changes");

    loop {
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; exiting credential watcher");
                break;
            }
            Some(res) = watch_rx.recv() => match res {
                Ok(event) => {
                    if is_write_to(&event, &file_name) {
                        info!(kind = ?event.kind, "credentials changed; starting sync chain");
                        let pipeline = pipeline.clone();
                        tokio::spawn(async move {
                            let _ = run_chain(&pipeline).await;
                        });
                    } else {
                        debug!(kind = ?event.kind, paths = ?event.paths, "config dir: ignored");
                    }
                }
                Err(err) => error!("watch error: {err}"),
            }
        }
    }
    Ok(())
}

/// A completed write to the file, or a rename that put a new file in its place.
fn is_write_to(event: &Event, file_name: &OsStr) -> bool {
    let targets_file = event
        .paths
        .last()
        .and_then(|p| p.file_name())
        .is_some_and(|name| name == file_name);
    if !targets_file {
        return false;
    }
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        // A rename also arrives as Both after its To half; count it once.
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => true,
        // Backends without close events only report the data change itself.
        #[cfg(not(target_os = "linux"))]
        EventKind::Modify(
            ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Name(RenameMode::Any),
        ) => true,
        _ => false,
    }
}
