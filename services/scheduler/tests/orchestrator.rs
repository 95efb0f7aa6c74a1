mod common;

use std::sync::Arc;
use std::time::Duration;

use lookout_id::PipelineId;
use lookout_model::CheckState;
use lookout_pacing::{notifier, MaxChecksPerSecond, RateCalculator};
use lookout_scheduler::lidar::{
    Checker, CheckerConfig, Orchestrator, OrchestratorConfig, Scanner, ScannerConfig,
};
use lookout_scheduler::store::{CheckStore, MemoryCheckStore};
use tokio::sync::{mpsc, watch};

use common::{resource, RecordingEngine};

fn orchestrator(store: &MemoryCheckStore, engine: RecordingEngine, rx: mpsc::Receiver<()>) -> Orchestrator {
    let store: Arc<dyn CheckStore> = Arc::new(store.clone());
    let scanner = Scanner::new(store.clone(), ScannerConfig::default());
    let checker = Checker::new(
        store.clone(),
        Arc::new(engine),
        RateCalculator::new(MaxChecksPerSecond::Auto, Duration::from_secs(60), store),
        CheckerConfig::default(),
    );
    Orchestrator::new(scanner, checker, OrchestratorConfig::default(), rx)
}

#[tokio::test(start_paused = true)]
async fn test_scan_wakes_checker_and_check_runs_once() {
    let (notify, rx) = notifier();
    let store = MemoryCheckStore::new().with_checker_notifier(notify);
    let id = store.add_resource(resource(PipelineId::new(), "repo", "git"));
    let engine = RecordingEngine::finishing(Arc::new(store.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(orchestrator(&store, engine.clone(), rx).run(shutdown_rx));

    // Well short of either loop interval, so only the first scan and the
    // notification can have triggered a check run.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let checks = store.checks_for(id);
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].state, CheckState::Succeeded);
    assert_eq!(engine.ran(), vec![checks[0].id]);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator did not stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_both_loops() {
    let (notify, rx) = notifier();
    let store = MemoryCheckStore::new().with_checker_notifier(notify.clone());
    let engine = RecordingEngine::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(orchestrator(&store, engine, rx).run(shutdown_rx));
    tokio::time::sleep(Duration::from_secs(1)).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator did not stop")
        .unwrap();

    assert!(!store.is_scan_locked());
    // The check loop dropped its receiver.
    assert!(!notify.notify());
}

#[tokio::test(start_paused = true)]
async fn test_scans_repeat_on_interval() {
    let (_notify, rx) = notifier();
    let store = MemoryCheckStore::new();
    let engine = RecordingEngine::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(orchestrator(&store, engine, rx).run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.notifications(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.notifications(), 2);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
