//! Shared test doubles for the scheduler integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lookout_id::{CheckId, PipelineId};
use lookout_model::{CheckEvery, CheckableRef, ResourceTypeConfig, Version};
use lookout_scheduler::engine::{ExecutionEngine, Runnable};
use lookout_scheduler::store::{
    Check, CheckOutcome, CheckStore, Checkable, CheckableRecord, Lock, MemoryCheckStore,
    ResourceTypeSet, StoreError,
};
use tokio::sync::Semaphore;

pub const PIPELINE: &str = "main";

pub fn resource(pipeline: PipelineId, name: &str, type_name: &str) -> CheckableRecord {
    CheckableRecord::resource(pipeline, PIPELINE, name, type_name)
}

pub fn resource_type(pipeline: PipelineId, name: &str, type_name: &str) -> CheckableRecord {
    CheckableRecord::resource_type(pipeline, PIPELINE, name, type_name)
}

/// A memory store with switchable failures and call counters.
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: MemoryCheckStore,
    pub fail_lock: Arc<AtomicBool>,
    pub fail_resources: Arc<AtomicBool>,
    pub fail_resource_types: Arc<AtomicBool>,
    /// Fails both reading and claiming started checks.
    pub fail_started_checks: Arc<AtomicBool>,
    pub fail_count: Arc<AtomicBool>,
    pub fail_create_for: Arc<Mutex<Option<String>>>,
    pub panic_on: Arc<Mutex<Option<String>>>,
    pub resource_reads: Arc<AtomicUsize>,
    pub count_reads: Arc<AtomicUsize>,
    pub create_calls: Arc<Mutex<Vec<String>>>,
}

impl FaultyStore {
    pub fn new(inner: MemoryCheckStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Make every accessor of the named resource panic.
    pub fn panic_on(&self, name: &str) {
        *self.panic_on.lock().unwrap() = Some(name.to_string());
    }

    pub fn fail_create_for(&self, name: &str) {
        *self.fail_create_for.lock().unwrap() = Some(name.to_string());
    }

    pub fn create_calls(&self) -> Vec<String> {
        self.create_calls.lock().unwrap().clone()
    }
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable(format!("{what} failed"))
}

#[async_trait]
impl CheckStore for FaultyStore {
    async fn acquire_scanning_lock(&self) -> Result<Option<Box<dyn Lock>>, StoreError> {
        if self.fail_lock.load(Ordering::SeqCst) {
            return Err(unavailable("lock"));
        }
        self.inner.acquire_scanning_lock().await
    }

    async fn resources(&self) -> Result<Vec<Arc<dyn Checkable>>, StoreError> {
        self.resource_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_resources.load(Ordering::SeqCst) {
            return Err(unavailable("resources"));
        }

        let panic_on = self.panic_on.lock().unwrap().clone();
        let resources = self.inner.resources().await?;
        Ok(resources
            .into_iter()
            .map(|r| match &panic_on {
                Some(name) if r.name() == name => {
                    Arc::new(PanickingCheckable(r)) as Arc<dyn Checkable>
                }
                _ => r,
            })
            .collect())
    }

    async fn resource_types(&self) -> Result<ResourceTypeSet, StoreError> {
        if self.fail_resource_types.load(Ordering::SeqCst) {
            return Err(unavailable("resource types"));
        }
        self.inner.resource_types().await
    }

    async fn try_create_check(
        &self,
        checkable: &dyn Checkable,
        resource_types: Vec<ResourceTypeConfig>,
        from_version: Option<Version>,
        timeout: Duration,
        manually_triggered: bool,
        persist: bool,
    ) -> Result<(Check, bool), StoreError> {
        self.create_calls
            .lock()
            .unwrap()
            .push(checkable.name().to_string());

        let fail_for = self.fail_create_for.lock().unwrap().clone();
        if fail_for.as_deref() == Some(checkable.name()) {
            return Err(unavailable("create check"));
        }

        self.inner
            .try_create_check(
                checkable,
                resource_types,
                from_version,
                timeout,
                manually_triggered,
                persist,
            )
            .await
    }

    async fn notify_checker(&self) -> Result<(), StoreError> {
        self.inner.notify_checker().await
    }

    async fn started_checks(&self) -> Result<Vec<Check>, StoreError> {
        if self.fail_started_checks.load(Ordering::SeqCst) {
            return Err(unavailable("started checks"));
        }
        self.inner.started_checks().await
    }

    async fn claim_started_checks(&self, lease: Duration) -> Result<Vec<Check>, StoreError> {
        if self.fail_started_checks.load(Ordering::SeqCst) {
            return Err(unavailable("claim started checks"));
        }
        self.inner.claim_started_checks(lease).await
    }

    async fn release_claim(&self, id: CheckId) -> Result<(), StoreError> {
        self.inner.release_claim(id).await
    }

    async fn finish_check(&self, id: CheckId, outcome: CheckOutcome) -> Result<(), StoreError> {
        self.inner.finish_check(id, outcome).await
    }

    async fn checkable_count(&self) -> Result<u64, StoreError> {
        self.count_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_count.load(Ordering::SeqCst) {
            return Err(unavailable("count"));
        }
        CheckStore::checkable_count(&self.inner).await
    }
}

/// Panics when asked how often it should be checked.
#[derive(Debug)]
struct PanickingCheckable(Arc<dyn Checkable>);

#[async_trait]
impl Checkable for PanickingCheckable {
    fn id(&self) -> CheckableRef {
        self.0.id()
    }

    fn name(&self) -> &str {
        self.0.name()
    }

    fn type_name(&self) -> &str {
        self.0.type_name()
    }

    fn pipeline_id(&self) -> PipelineId {
        self.0.pipeline_id()
    }

    fn pipeline_name(&self) -> &str {
        self.0.pipeline_name()
    }

    fn check_every(&self) -> &CheckEvery {
        panic!("something went wrong")
    }

    fn has_webhook(&self) -> bool {
        self.0.has_webhook()
    }

    fn last_check_end_time(&self) -> DateTime<Utc> {
        self.0.last_check_end_time()
    }

    fn current_pinned_version(&self) -> Option<Version> {
        self.0.current_pinned_version()
    }

    fn source(&self) -> &serde_json::Value {
        self.0.source()
    }

    async fn set_check_setup_error(&self, error: Option<String>) -> Result<(), StoreError> {
        self.0.set_check_setup_error(error).await
    }
}

/// Engine that records the checks it runs. Runs block on `gate` when one is
/// set, so tests can hold checks in flight.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    pub ran: Arc<Mutex<Vec<CheckId>>>,
    pub created: Arc<AtomicUsize>,
    pub gate: Option<Arc<Semaphore>>,
    pub finish_in: Option<Arc<dyn CheckStore>>,
}

impl RecordingEngine {
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }

    /// Finish every check it runs as succeeded in `store`.
    pub fn finishing(store: Arc<dyn CheckStore>) -> Self {
        Self {
            finish_in: Some(store),
            ..Default::default()
        }
    }

    pub fn ran(&self) -> Vec<CheckId> {
        self.ran.lock().unwrap().clone()
    }
}

impl ExecutionEngine for RecordingEngine {
    fn new_check(&self, check: Check) -> Box<dyn Runnable> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(RecordingRunnable {
            engine: self.clone(),
            check,
        })
    }
}

struct RecordingRunnable {
    engine: RecordingEngine,
    check: Check,
}

#[async_trait]
impl Runnable for RecordingRunnable {
    async fn run(self: Box<Self>) {
        if let Some(gate) = &self.engine.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.engine.ran.lock().unwrap().push(self.check.id);
        if let Some(store) = &self.engine.finish_in {
            store
                .finish_check(self.check.id, CheckOutcome::Succeeded)
                .await
                .unwrap();
        }
    }
}

/// Let spawned tasks make progress.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - chrono::TimeDelta::hours(hours)
}
