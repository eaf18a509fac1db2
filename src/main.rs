use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use kiosk_sync::config::Configuration;
use kiosk_sync::media::ContentDir;
use kiosk_sync::notifications::{self, ClientRegistry};
use kiosk_sync::pipeline::{Step, SyncPipeline};
use kiosk_sync::store::{ConfigStore, system_hostname};
use kiosk_sync::{logging, tasks, web};

#[derive(Debug, Parser)]
#[command(
    name = "kiosk-sync",
    version,
    about = "Content sync and live-update service for kiosk displays"
)]
struct Cli {
    /// Path to YAML config; built-in defaults when omitted
    #[arg(long, short, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler, watchers and HTTP endpoints (default)
    Serve,
    /// Run a single sync step once and exit with its status
    Sync {
        #[arg(value_enum)]
        step: SyncStep,
    },
    /// Print the device identity, creating it if needed
    Device,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyncStep {
    Full,
    Setup,
    Register,
}

impl From<SyncStep> for Step {
    fn from(step: SyncStep) -> Self {
        match step {
            SyncStep::Full => Step::FullSync,
            SyncStep::Setup => Step::SetupSync,
            SyncStep::Register => Step::RegisterDevice,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = match &cli.config {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Configuration::default(),
    }
    .validated()
    .context("invalid configuration values")?;
    tracing::debug!(?cfg, "configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::Sync { step } => {
            let pipeline = SyncPipeline::new(&cfg);
            let report = pipeline.run(step.into()).await;
            report.check().context("sync step failed")?;
            Ok(())
        }
        Command::Device => {
            let store = ConfigStore::new(cfg.config_dir());
            let (identity, _) = store.ensure_device_identity(&system_hostname())?;
            let json = serde_json::to_string_pretty(&identity)?;
            println!("{json}");
            Ok(())
        }
    }
}

async fn serve(cfg: Configuration) -> Result<()> {
    let store = ConfigStore::new(cfg.config_dir());
    let identity = store
        .bootstrap(&system_hostname())
        .context("failed to provision config directory")?;
    if let Some(identity) = identity {
        tracing::info!(device_id = %identity.device_id, hostname = %identity.hostname, "device ready");
    }

    let content = ContentDir::new(cfg.content_dir());
    content
        .ensure_layout()
        .with_context(|| format!("failed to create {}", content.root().display()))?;

    match store.load_credentials() {
        Ok(creds) if creds.is_complete() => tracing::debug!("credentials present"),
        Ok(_) => tracing::info!("no account linked yet; waiting for credentials"),
        Err(err) => tracing::warn!(error = %err, "credentials unreadable"),
    }

    let pipeline = SyncPipeline::new(&cfg);
    tracing::info!(interpreter = %pipeline.interpreter().display(), "sync pipeline ready");
    let registry = Arc::new(ClientRegistry::new());

    let http_addr = cfg.http.socket_addr();
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind http api on {http_addr}"))?;
    let ws_addr = cfg.notifications.socket_addr();
    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("failed to bind notifications on {ws_addr}"))?;

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sigterm.recv() => {
                            tracing::info!("SIGTERM received; initiating shutdown");
                            cancel.cancel();
                        }
                    }
                }
                Err(err) => tracing::warn!("failed to register SIGTERM handler: {err}"),
            }
        });
    }

    let mut tasks = JoinSet::new();

    // Scheduler
    tasks.spawn({
        let store = store.clone();
        let pipeline = pipeline.clone();
        let period = cfg.setup_sync_interval;
        let cancel = cancel.clone();
        async move {
            tasks::scheduler::run(store, pipeline, period, cancel)
                .await
                .context("scheduler task failed")
        }
    });

    // Credential watcher
    tasks.spawn({
        let path = store.credentials_path();
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        async move {
            tasks::credentials::run(path, pipeline, cancel)
                .await
                .context("credential watcher failed")
        }
    });

    // Content watcher -> notification clients
    tasks.spawn({
        let root = content.root().to_path_buf();
        let depth = cfg.watch_depth;
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        async move {
            tasks::files::run(root, depth, registry, cancel)
                .await
                .context("content watcher failed")
        }
    });

    tasks.spawn({
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        async move {
            notifications::serve(ws_listener, registry, cancel)
                .await
                .context("notification channel failed")
        }
    });

    tasks.spawn({
        let router = web::router(store.clone(), content.clone(), pipeline.clone());
        let cancel = cancel.clone();
        async move { web::serve(http_listener, router, cancel).await }
    });

    let mut failed = false;
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("task error: {e:?}");
                failed = true;
                cancel.cancel();
            }
            Err(e) => {
                tracing::error!("join error: {e:?}");
                failed = true;
                cancel.cancel();
            }
        }
    }
    if failed {
        bail!("kiosk-sync stopped after a task failure");
    }
    tracing::info!("shutdown complete");
    Ok(())
}
