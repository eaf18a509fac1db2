use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiosk_sync::config::Configuration;
use kiosk_sync::pipeline::{Step, StepCommand, StepReport, StepRunner, SyncPipeline};
use kiosk_sync::store::ConfigStore;
use kiosk_sync::tasks::scheduler;
use tempfile::{TempDir, tempdir};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Records when each step starts and finishes; steps take `duration` of (paused) time.
#[derive(Default)]
struct TimedRunner {
    duration: Duration,
    log: Mutex<RunLog>,
}

#[derive(Default)]
struct RunLog {
    started: Vec<(Step, Instant)>,
    finished: Vec<Step>,
    in_flight: usize,
    max_in_flight: usize,
}

#[async_trait]
impl StepRunner for TimedRunner {
    async fn run(&self, command: StepCommand) -> StepReport {
        {
            let mut log = self.log.lock().unwrap();
            log.started.push((command.step, Instant::now()));
            log.in_flight += 1;
            log.max_in_flight = log.max_in_flight.max(log.in_flight);
        }
        tokio::time::sleep(self.duration).await;
        {
            let mut log = self.log.lock().unwrap();
            log.in_flight -= 1;
            log.finished.push(command.step);
        }
        StepReport {
            step: command.step,
            success: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            launch_error: None,
        }
    }
}

impl TimedRunner {
    fn starts(&self, step: Step) -> Vec<Instant> {
        let log = self.log.lock().unwrap();
        log.started
            .iter()
            .filter(|(s, _)| *s == step)
            .map(|(_, at)| *at)
            .collect()
    }
}

fn setup(setup_json: Option<&str>, runner: Arc<TimedRunner>) -> (TempDir, ConfigStore, SyncPipeline) {
    let tmp = tempdir().unwrap();
    let cfg = Configuration {
        base_dir: tmp.path().to_path_buf(),
        ..Configuration::default()
    };
    let store = ConfigStore::new(cfg.config_dir());
    fs::create_dir_all(store.dir()).unwrap();
    if let Some(raw) = setup_json {
        fs::write(store.setup_path(), raw).unwrap();
    }
    let pipeline = SyncPipeline::with_runner(&cfg, runner);
    (tmp, store, pipeline)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn content_loop_runs_immediately_then_every_period() {
    let runner = Arc::new(TimedRunner::default());
    let (_tmp, store, pipeline) = setup(Some(r#"{"sync_interval": 10}"#), runner.clone());
    let cancel = CancellationToken::new();
    let start = Instant::now();

    let handle = tokio::spawn(scheduler::run(
        store,
        pipeline,
        Duration::from_secs(300),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(runner.starts(Step::FullSync).len(), 1, "first run is immediate");

    tokio::time::sleep(Duration::from_secs(34)).await;
    settle().await;
    let starts = runner.starts(Step::FullSync);
    assert_eq!(starts.len(), 4, "runs at 0s, 10s, 20s, 30s");
    for (i, at) in starts.iter().enumerate() {
        assert_eq!(at.duration_since(start), Duration::from_secs(10 * i as u64));
    }
    assert!(runner.starts(Step::SetupSync).is_empty());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_interval_falls_back_to_five_minutes() {
    let runner = Arc::new(TimedRunner::default());
    let (_tmp, store, pipeline) = setup(Some(r#"{"sync_interval": -4}"#), runner.clone());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(scheduler::run(
        store,
        pipeline,
        Duration::from_secs(3600),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_secs(299)).await;
    settle().await;
    assert_eq!(runner.starts(Step::FullSync).len(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(runner.starts(Step::FullSync).len(), 2);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn sub_millisecond_interval_still_runs() {
    let runner = Arc::new(TimedRunner::default());
    let (_tmp, store, pipeline) = setup(Some(r#"{"sync_interval": 1e-10}"#), runner.clone());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(scheduler::run(
        store,
        pipeline,
        Duration::from_secs(300),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(5)).await;
    settle().await;
    let runs = runner.starts(Step::FullSync).len();
    assert!(runs >= 2, "content loop ran {runs} times");

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn setup_loop_waits_one_period_and_runs_without_setup_file() {
    let runner = Arc::new(TimedRunner::default());
    let (_tmp, store, pipeline) = setup(None, runner.clone());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(scheduler::run(
        store,
        pipeline,
        Duration::from_secs(30),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_secs(29)).await;
    settle().await;
    assert!(runner.starts(Step::SetupSync).is_empty());

    tokio::time::sleep(Duration::from_secs(36)).await;
    settle().await;
    assert_eq!(runner.starts(Step::SetupSync).len(), 2, "runs at 30s and 60s");
    assert!(
        runner.starts(Step::FullSync).is_empty(),
        "content loop must not start without setup.json"
    );

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_runs_overlap_the_next_tick() {
    let runner = Arc::new(TimedRunner {
        duration: Duration::from_secs(25),
        ..TimedRunner::default()
    });
    let (_tmp, store, pipeline) = setup(Some(r#"{"sync_interval": "10"}"#), runner.clone());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(scheduler::run(
        store,
        pipeline,
        Duration::from_secs(300),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_secs(34)).await;
    settle().await;
    {
        let log = runner.log.lock().unwrap();
        assert_eq!(log.started.len(), 4);
        assert_eq!(log.finished.len(), 1, "only the 0s run has finished");
        assert!(log.max_in_flight >= 3, "max in flight {}", log.max_in_flight);
    }

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
