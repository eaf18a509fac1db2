use std::time::Duration;

use anyhow::Result;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::pipeline::{Step, SyncPipeline};
use crate::store::ConfigStore;

/// Drives the two sync cadences until `cancel` fires.
///
/// - Content loop: `setup.json`'s `sync_interval`, read once here. Runs
///   `run_full_sync` right away and then every period. Not started at all if
///   `setup.json` is missing or unparsable.
/// - Setup loop: fixed `setup_period`, always started, first run one period in.
///
/// Every tick launches its step as its own task and moves on, so a run that
/// outlasts the period overlaps the next one.
#[instrument(skip_all, fields(setup_period = %humantime::format_duration(setup_period)))]
pub async fn run(
    store: ConfigStore,
    pipeline: SyncPipeline,
    setup_period: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut loops = JoinSet::new();

    if let Some(period) = content_period(&store) {
        loops.spawn(content_loop(pipeline.clone(), period, cancel.clone()));
    }
    loops.spawn(setup_loop(pipeline, setup_period, cancel));

    while let Some(res) = loops.join_next().await {
        if let Err(err) = res {
            warn!(error = %err, "sync loop ended abnormally");
        }
    }
    Ok(())
}

/// Content loop period from `setup.json`, or `None` when the loop must not run.
pub fn content_period(store: &ConfigStore) -> Option<Duration> {
    match store.load_setup() {
        Ok(setup) => {
            let period = setup.sync_period();
            if !setup
                .sync_interval
                .is_some_and(|secs| secs.is_finite() && secs > 0.0)
            {
                debug!(
                    raw = ?setup.sync_interval,
                    "sync_interval missing or not positive; using default"
                );
            }
            Some(period)
        }
        Err(err) => {
            warn!(error = %err, "no usable setup config; content sync loop not started");
            None
        }
    }
}

async fn content_loop(pipeline: SyncPipeline, period: Duration, cancel: CancellationToken) {
    info!(
        period = %humantime::format_duration(period),
        "content sync loop started"
    );
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => launch(&pipeline, Step::FullSync),
        }
    }
    debug!("content sync loop stopped");
}

async fn setup_loop(pipeline: SyncPipeline, period: Duration, cancel: CancellationToken) {
    info!(
        period = %humantime::format_duration(period),
        "setup sync loop started"
    );
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => launch(&pipeline, Step::SetupSync),
        }
    }
    debug!("setup sync loop stopped");
}

fn launch(pipeline: &SyncPipeline, step: Step) {
    let pipeline = pipeline.clone();
    tokio::spawn(async move {
        // The report is logged by the pipeline; a failed run waits for the next tick.
        let _ = pipeline.run(step).await;
    });
}
