use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::Step;

/// Failures of the sync and live-update core.
///
/// Every variant is handled where it occurs (logged, then fall back or skip);
/// none of them is allowed to take the service down.
#[derive(Debug, Error)]
pub enum Error {
    /// A JSON document the service depends on does not exist.
    #[error("config document missing: {}", .0.display())]
    ConfigMissing(PathBuf),

    /// A JSON document exists but could not be read or parsed.
    #[error("config document invalid: {}: {source}", path.display())]
    ConfigInvalid {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An external sync step could not be started.
    #[error("step {step} failed to launch: {source}")]
    StepLaunch {
        step: Step,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// An external sync step ran and reported failure.
    #[error("step {step} exited with {}", exit_label(*.exit_code))]
    StepExit { step: Step, exit_code: Option<i32> },

    /// A path that should be watched does not exist.
    #[error("watch target missing: {}", .0.display())]
    WatchTargetMissing(PathBuf),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|c| format!("status {c}"))
        .unwrap_or_else(|| "signal".to_string())
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
