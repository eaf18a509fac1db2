use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiosk_sync::config::Configuration;
use kiosk_sync::pipeline::{Step, StepCommand, StepReport, StepRunner, SyncPipeline};
use kiosk_sync::store::ConfigStore;
use kiosk_sync::tasks::credentials::{self, ChainOutcome};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mark {
    Start(Step),
    End(Step),
}

/// Fails `fail_on` with exit status 1; everything else succeeds after a short pause.
struct ScriptedRunner {
    fail_on: Option<Step>,
    marks: Mutex<Vec<Mark>>,
}

impl ScriptedRunner {
    fn new(fail_on: Option<Step>) -> Arc<Self> {
        Arc::new(Self {
            fail_on,
            marks: Mutex::new(Vec::new()),
        })
    }

    fn marks(&self) -> Vec<Mark> {
        self.marks.lock().unwrap().clone()
    }

    fn started(&self, step: Step) -> usize {
        self.marks()
            .iter()
            .filter(|m| **m == Mark::Start(step))
            .count()
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(&self, command: StepCommand) -> StepReport {
        let step = command.step;
        self.marks.lock().unwrap().push(Mark::Start(step));
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.marks.lock().unwrap().push(Mark::End(step));
        let success = self.fail_on != Some(step);
        StepReport {
            step,
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            stdout: String::new(),
            stderr: String::new(),
            launch_error: None,
        }
    }
}

fn pipeline_with(runner: Arc<ScriptedRunner>) -> (tempfile::TempDir, Configuration, SyncPipeline) {
    let tmp = tempdir().unwrap();
    let cfg = Configuration {
        base_dir: tmp.path().to_path_buf(),
        ..Configuration::default()
    };
    let pipeline = SyncPipeline::with_runner(&cfg, runner);
    (tmp, cfg, pipeline)
}

#[tokio::test]
async fn chain_runs_steps_strictly_in_order_then_restarts() {
    let runner = ScriptedRunner::new(None);
    let (_tmp, _cfg, pipeline) = pipeline_with(runner.clone());

    let outcome = credentials::run_chain(&pipeline).await;
    assert!(matches!(outcome, ChainOutcome::Restarted));

    use Mark::*;
    assert_eq!(
        runner.marks(),
        vec![
            Start(Step::FullSync),
            End(Step::FullSync),
            Start(Step::SetupSync),
            End(Step::SetupSync),
            Start(Step::RegisterDevice),
            End(Step::RegisterDevice),
            Start(Step::Restart),
            End(Step::Restart),
        ]
    );
}

#[tokio::test]
async fn failed_full_sync_stops_the_chain_without_restart() {
    let runner = ScriptedRunner::new(Some(Step::FullSync));
    let (_tmp, _cfg, pipeline) = pipeline_with(runner.clone());

    let outcome = credentials::run_chain(&pipeline).await;
    assert!(matches!(
        outcome,
        ChainOutcome::Failed {
            step: Step::FullSync,
            ..
        }
    ));
    assert_eq!(
        runner.marks(),
        vec![Mark::Start(Step::FullSync), Mark::End(Step::FullSync)]
    );
    assert_eq!(runner.started(Step::Restart), 0);
}

#[tokio::test]
async fn failed_registration_skips_restart() {
    let runner = ScriptedRunner::new(Some(Step::RegisterDevice));
    let (_tmp, _cfg, pipeline) = pipeline_with(runner.clone());

    let outcome = credentials::run_chain(&pipeline).await;
    assert!(matches!(
        outcome,
        ChainOutcome::Failed {
            step: Step::RegisterDevice,
            ..
        }
    ));
    assert_eq!(runner.started(Step::SetupSync), 1);
    assert_eq!(runner.started(Step::Restart), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rapid_writes_start_at_least_one_chain_each_bounded_by_writes() {
    const WRITES: usize = 5;
    let runner = ScriptedRunner::new(None);
    let (_tmp, cfg, pipeline) = pipeline_with(runner.clone());
    let store = ConfigStore::new(cfg.config_dir());
    store.ensure_credentials().unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(credentials::run(
        store.credentials_path(),
        pipeline,
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..WRITES {
        fs::write(
            store.credentials_path(),
            format!(r#"{{"client_id":"id-{i}","client_secret":"s"}}"#),
        )
        .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.started(Step::Restart) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no chain completed after credential writes");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let chains = runner.started(Step::FullSync);
    assert!((1..=WRITES).contains(&chains), "chains started: {chains}");

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn atomic_rename_onto_credentials_starts_one_chain() {
    let runner = ScriptedRunner::new(None);
    let (_tmp, cfg, pipeline) = pipeline_with(runner.clone());
    let store = ConfigStore::new(cfg.config_dir());
    store.ensure_credentials().unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(credentials::run(
        store.credentials_path(),
        pipeline,
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let staged = store.dir().join(".credentials.tmp");
    fs::write(&staged, r#"{"client_id":"id","client_secret":"s"}"#).unwrap();
    fs::rename(&staged, store.credentials_path()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.started(Step::Restart) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("rename did not start a chain");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(runner.started(Step::FullSync), 1);
    assert_eq!(runner.started(Step::Restart), 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_config_dir_is_not_fatal() {
    let runner = ScriptedRunner::new(None);
    let (tmp, _cfg, pipeline) = pipeline_with(runner.clone());
    let cancel = CancellationToken::new();

    let path = tmp.path().join("absent").join("credentials.json");
    tokio::time::timeout(
        Duration::from_secs(1),
        credentials::run(path, pipeline, cancel),
    )
    .await
    .expect("watcher should return immediately")
    .unwrap();
    assert!(runner.marks().is_empty());
}
