use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::error::{Error, Result};

/// One external operation the pipeline knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    FullSync,
    SetupSync,
    RegisterDevice,
    MarkDeleted,
    Restart,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullSync => "full-sync",
            Self::SetupSync => "setup-sync",
            Self::RegisterDevice => "register-device",
            Self::MarkDeleted => "mark-deleted",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved invocation of a step.
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub step: Step,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: PathBuf,
}

/// What happened when a step ran. Produced for every invocation, including
/// ones that never started.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: Step,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub launch_error: Option<Arc<std::io::Error>>,
}

impl StepReport {
    pub fn launch_failed(step: Step, err: std::io::Error) -> Self {
        Self {
            step,
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            launch_error: Some(Arc::new(err)),
        }
    }

    pub fn check(&self) -> Result<()> {
        if let Some(err) = &self.launch_error {
            return Err(Error::StepLaunch {
                step: self.step,
                source: Arc::clone(err),
            });
        }
        if !self.success {
            return Err(Error::StepExit {
                step: self.step,
                exit_code: self.exit_code,
            });
        }
        Ok(())
    }
}

/// Launches external steps. The only place processes are started, so retry or
/// timeout policy belongs in an implementation of this trait.
#[async_trait]
pub trait StepRunner: Send + Sync + 'static {
    async fn run(&self, command: StepCommand) -> StepReport;
}

/// Runs steps as child processes and captures their output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl StepRunner for ProcessRunner {
    async fn run(&self, command: StepCommand) -> StepReport {
        let StepCommand {
            step,
            program,
            args,
            current_dir,
        } = command;
        debug!(%step, program = %program.display(), ?args, "launching step");

        let output = Command::new(&program)
            .args(&args)
            .current_dir(&current_dir)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => StepReport {
                step,
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                launch_error: None,
            },
            Err(err) => StepReport::launch_failed(step, err),
        }
    }
}

/// Entry points for the external sync steps.
///
/// Best effort by construction: every call returns a [`StepReport`] and logs
/// it, nothing is retried, and callers decide whether a failure matters.
#[derive(Clone)]
pub struct SyncPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    runner: Arc<dyn StepRunner>,
    interpreter: PathBuf,
    working_dir: PathBuf,
    full_sync: PathBuf,
    setup_sync: PathBuf,
    register_device: PathBuf,
    mark_deleted: PathBuf,
    restart_command: Vec<String>,
}

impl fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("interpreter", &self.inner.interpreter)
            .field("working_dir", &self.inner.working_dir)
            .field("restart_command", &self.inner.restart_command)
            .finish_non_exhaustive()
    }
}

impl SyncPipeline {
    pub fn new(cfg: &Configuration) -> Self {
        Self::with_runner(cfg, Arc::new(ProcessRunner))
    }

    pub fn with_runner(cfg: &Configuration, runner: Arc<dyn StepRunner>) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                runner,
                interpreter: resolve_interpreter(cfg),
                working_dir: cfg.base_dir.clone(),
                full_sync: cfg.script_path(&cfg.steps.full_sync),
                setup_sync: cfg.script_path(&cfg.steps.setup_sync),
                register_device: cfg.script_path(&cfg.steps.register_device),
                mark_deleted: cfg.script_path(&cfg.steps.mark_deleted),
                restart_command: cfg.restart_command.clone(),
            }),
        }
    }

    pub fn interpreter(&self) -> &Path {
        &self.inner.interpreter
    }

    /// Fetches all content into the content directory.
    pub async fn run_full_sync(&self) -> StepReport {
        self.run(Step::FullSync).await
    }

    /// Fetches the display configuration into `setup.json`.
    pub async fn run_setup_sync(&self) -> StepReport {
        self.run(Step::SetupSync).await
    }

    pub async fn run_register_device(&self) -> StepReport {
        self.run(Step::RegisterDevice).await
    }

    /// Tells the remote that a locally deleted file should not come back.
    pub async fn mark_deleted(&self, file_name: &str) -> StepReport {
        let command = self.script_command(
            Step::MarkDeleted,
            &self.inner.mark_deleted,
            vec![OsString::from(file_name)],
        );
        self.execute(command).await
    }

    /// Asks the service manager to restart this process.
    pub async fn restart_service(&self) -> StepReport {
        self.run(Step::Restart).await
    }

    /// Runs a step that takes no arguments. [`Step::MarkDeleted`] needs a file
    /// name and is refused here; call [`mark_deleted`](Self::mark_deleted).
    pub async fn run(&self, step: Step) -> StepReport {
        let inner = &self.inner;
        let command = match step {
            Step::FullSync => self.script_command(step, &inner.full_sync, Vec::new()),
            Step::SetupSync => self.script_command(step, &inner.setup_sync, Vec::new()),
            Step::RegisterDevice => {
                self.script_command(step, &inner.register_device, Vec::new())
            }
            Step::MarkDeleted => {
                warn!(%step, "refusing to run without a file name; use mark_deleted");
                return StepReport::launch_failed(
                    step,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "mark-deleted needs the deleted file's name",
                    ),
                );
            }
            Step::Restart => {
                let (program, args) = match inner.restart_command.split_first() {
                    Some((program, args)) => (program.as_str(), args),
                    None => ("", &[][..]),
                };
                StepCommand {
                    step,
                    program: PathBuf::from(program),
                    args: args.iter().map(OsString::from).collect(),
                    current_dir: inner.working_dir.clone(),
                }
            }
        };
        self.execute(command).await
    }

    fn script_command(&self, step: Step, script: &Path, extra: Vec<OsString>) -> StepCommand {
        let mut args = Vec::with_capacity(extra.len() + 1);
        args.push(script.as_os_str().to_os_string());
        args.extend(extra);
        StepCommand {
            step,
            program: self.inner.interpreter.clone(),
            args,
            current_dir: self.inner.working_dir.clone(),
        }
    }

    async fn execute(&self, command: StepCommand) -> StepReport {
        let step = command.step;
        info!(%step, "starting sync step");
        let report = self.inner.runner.run(command).await;
        log_report(&report);
        report
    }
}

fn log_report(report: &StepReport) {
    let step = report.step;
    if !report.stdout.trim().is_empty() {
        info!(%step, stdout = report.stdout.trim_end(), "step output");
    }
    if !report.stderr.trim().is_empty() {
        warn!(%step, stderr = report.stderr.trim_end(), "step stderr");
    }
    match report.check() {
        Ok(()) => info!(%step, "sync step succeeded"),
        Err(err) => error!(%step, error = %err, "sync step failed"),
    }
}

/// Picks the project-local interpreter when it exists, otherwise the fallback.
pub fn resolve_interpreter(cfg: &Configuration) -> PathBuf {
    let local = cfg.resolve(&cfg.interpreter.project_local);
    if local.exists() {
        debug!(interpreter = %local.display(), "using project-local interpreter");
        local
    } else {
        warn!(
            missing = %local.display(),
            fallback = %cfg.interpreter.fallback.display(),
            "project-local interpreter not found; using system interpreter"
        );
        cfg.interpreter.fallback.clone()
    }
}
