//! In-process check store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lookout_id::CheckId;
use lookout_model::{CheckState, CheckableRef, ResourceTypeConfig, Version};
use lookout_pacing::NotifySender;

use super::{
    claimable, Check, CheckOutcome, CheckStore, Checkable, CheckableRecord, Lock, ResourceType,
    ResourceTypeSet, SetupErrorWriter, StoreError, StoredCheckable,
};

/// Finished checks kept for inspection by default.
pub const DEFAULT_FINISHED_HISTORY: usize = 1000;

/// Check store that keeps all state in process.
///
/// The scanning lock is a process-local flag, so this store only coordinates
/// scanners that share it. Finished checks leave the pending set at once; only
/// the most recent ones are kept, in a bounded history.
#[derive(Clone, Default)]
pub struct MemoryCheckStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    scan_locked: Arc<AtomicBool>,
    notifications: AtomicU64,
    checker: Mutex<Option<NotifySender>>,
}

struct Pending {
    check: Check,
    claimed_at: Option<DateTime<Utc>>,
}

struct State {
    resources: Vec<CheckableRecord>,
    resource_types: Vec<CheckableRecord>,
    setup_errors: HashMap<CheckableRef, String>,
    pending: HashMap<CheckableRef, Pending>,
    pending_ids: HashMap<CheckId, CheckableRef>,
    finished: VecDeque<Check>,
    history_limit: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            resource_types: Vec::new(),
            setup_errors: HashMap::new(),
            pending: HashMap::new(),
            pending_ids: HashMap::new(),
            finished: VecDeque::new(),
            history_limit: DEFAULT_FINISHED_HISTORY,
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn record_mut(&mut self, id: CheckableRef) -> Option<&mut CheckableRecord> {
        match id {
            CheckableRef::Resource(_) => self.resources.iter_mut().find(|r| r.id == id),
            CheckableRef::ResourceType(_) => self.resource_types.iter_mut().find(|r| r.id == id),
        }
    }

    fn pending_by_id(&mut self, id: CheckId) -> Option<&mut Pending> {
        let checkable = self.pending_ids.get(&id)?;
        self.pending.get_mut(checkable)
    }

    /// Pending checks oldest first.
    fn pending_sorted(&mut self) -> Vec<&mut Pending> {
        let mut pending: Vec<_> = self.pending.values_mut().collect();
        pending.sort_by_key(|p| (p.check.create_time, p.check.id));
        pending
    }

    fn remember(&mut self, check: Check) {
        if self.history_limit == 0 {
            return;
        }
        while self.finished.len() >= self.history_limit {
            self.finished.pop_front();
        }
        self.finished.push_back(check);
    }
}

impl MemoryCheckStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` finished checks for [`Self::checks`].
    pub fn with_finished_history(self, limit: usize) -> Self {
        let mut state = self.inner.state();
        state.history_limit = limit;
        while state.finished.len() > limit {
            state.finished.pop_front();
        }
        drop(state);
        self
    }

    /// Wake `checker` whenever [`CheckStore::notify_checker`] is called.
    pub fn with_checker_notifier(self, checker: NotifySender) -> Self {
        *self
            .inner
            .checker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(checker);
        self
    }

    /// Add a resource. Returns its ID.
    pub fn add_resource(&self, record: CheckableRecord) -> CheckableRef {
        let id = record.id;
        self.inner.state().resources.push(record);
        id
    }

    /// Add a custom resource type. Returns its ID.
    pub fn add_resource_type(&self, record: CheckableRecord) -> CheckableRef {
        let id = record.id;
        self.inner.state().resource_types.push(record);
        id
    }

    /// Current snapshot of a checkable.
    pub fn checkable(&self, id: CheckableRef) -> Option<CheckableRecord> {
        self.inner.state().record_mut(id).map(|r| r.clone())
    }

    /// The recorded setup error of a checkable, if any.
    pub fn setup_error(&self, id: CheckableRef) -> Option<String> {
        self.inner.state().setup_errors.get(&id).cloned()
    }

    /// Recently finished checks followed by pending ones, oldest first.
    pub fn checks(&self) -> Vec<Check> {
        let mut state = self.inner.state();
        let mut checks: Vec<Check> = state.finished.iter().cloned().collect();
        checks.extend(state.pending_sorted().into_iter().map(|p| p.check.clone()));
        checks
    }

    /// [`Self::checks`] for one checkable.
    pub fn checks_for(&self, id: CheckableRef) -> Vec<Check> {
        self.checks()
            .into_iter()
            .filter(|c| c.checkable == id)
            .collect()
    }

    /// Number of checks not yet finished.
    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Number of [`CheckStore::notify_checker`] calls.
    pub fn notifications(&self) -> u64 {
        self.inner.notifications.load(Ordering::SeqCst)
    }

    /// Whether a scanner currently holds the scanning lock.
    pub fn is_scan_locked(&self) -> bool {
        self.inner.scan_locked.load(Ordering::SeqCst)
    }

    fn stored(&self, record: CheckableRecord) -> Arc<dyn Checkable> {
        Arc::new(StoredCheckable::new(record, self.inner.clone()))
    }
}

#[async_trait]
impl SetupErrorWriter for Inner {
    async fn write_setup_error(
        &self,
        checkable: CheckableRef,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        match error {
            Some(message) => state.setup_errors.insert(checkable, message),
            None => state.setup_errors.remove(&checkable),
        };
        Ok(())
    }
}

struct MemoryLock {
    held: Arc<AtomicBool>,
}

#[async_trait]
impl Lock for MemoryLock {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CheckStore for MemoryCheckStore {
    async fn acquire_scanning_lock(&self) -> Result<Option<Box<dyn Lock>>, StoreError> {
        let held = &self.inner.scan_locked;
        if held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }

        Ok(Some(Box::new(MemoryLock { held: held.clone() })))
    }

    async fn resources(&self) -> Result<Vec<Arc<dyn Checkable>>, StoreError> {
        let records = self.inner.state().resources.clone();
        Ok(records.into_iter().map(|r| self.stored(r)).collect())
    }

    async fn resource_types(&self) -> Result<ResourceTypeSet, StoreError> {
        let records = self.inner.state().resource_types.clone();
        Ok(ResourceTypeSet::new(
            records
                .into_iter()
                .map(|r| ResourceType {
                    version: r.version.clone(),
                    checkable: self.stored(r),
                })
                .collect(),
        ))
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
        let id = checkable.id();
        let mut state = self.inner.state();

        if let Some(pending) = state.pending.get(&id) {
            return Ok((pending.check.clone(), false));
        }

        let check = Check::started(
            checkable,
            resource_types,
            from_version,
            timeout,
            manually_triggered,
            persist,
        );
        state.pending_ids.insert(check.id, id);
        state.pending.insert(
            id,
            Pending {
                check: check.clone(),
                claimed_at: None,
            },
        );

        Ok((check, true))
    }

    async fn notify_checker(&self) -> Result<(), StoreError> {
        self.inner.notifications.fetch_add(1, Ordering::SeqCst);
        if let Some(checker) = self
            .inner
            .checker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            checker.notify();
        }
        Ok(())
    }

    async fn started_checks(&self) -> Result<Vec<Check>, StoreError> {
        Ok(self
            .inner
            .state()
            .pending_sorted()
            .into_iter()
            .filter(|p| p.check.state == CheckState::Started)
            .map(|p| p.check.clone())
            .collect())
    }

    async fn claim_started_checks(&self, lease: Duration) -> Result<Vec<Check>, StoreError> {
        let now = Utc::now();
        let mut state = self.inner.state();
        let mut claimed = Vec::new();
        for pending in state.pending_sorted() {
            if pending.check.state != CheckState::Started {
                continue;
            }
            if !claimable(pending.claimed_at, now, lease) {
                continue;
            }
            pending.claimed_at = Some(now);
            claimed.push(pending.check.clone());
        }

        Ok(claimed)
    }

    async fn release_claim(&self, id: CheckId) -> Result<(), StoreError> {
        let mut state = self.inner.state();
        let pending = state
            .pending_by_id(id)
            .ok_or(StoreError::CheckNotFound(id))?;
        pending.claimed_at = None;
        Ok(())
    }

    async fn finish_check(&self, id: CheckId, outcome: CheckOutcome) -> Result<(), StoreError> {
        let mut state = self.inner.state();

        let Some(checkable) = state.pending_ids.remove(&id) else {
            return Err(StoreError::CheckNotFound(id));
        };
        let Some(Pending { mut check, .. }) = state.pending.remove(&checkable) else {
            return Err(StoreError::CheckNotFound(id));
        };
        check.state = outcome.state();
        state.remember(check);

        if let Some(record) = state.record_mut(checkable) {
            record.last_check_end_time = Utc::now();
        }

        Ok(())
    }

    async fn checkable_count(&self) -> Result<u64, StoreError> {
        let state = self.inner.state();
        Ok((state.resources.len() + state.resource_types.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use lookout_id::PipelineId;
    use lookout_model::CheckableKind;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(600);

    fn store_with_resource() -> (MemoryCheckStore, CheckableRef) {
        let store = MemoryCheckStore::new();
        let id = store.add_resource(CheckableRecord::resource(
            PipelineId::new(),
            "main",
            "repo",
            "git",
        ));
        (store, id)
    }

    #[tokio::test]
    async fn test_scanning_lock_is_exclusive() {
        let store = MemoryCheckStore::new();

        let lock = store.acquire_scanning_lock().await.unwrap().unwrap();
        assert!(store.is_scan_locked());
        assert!(store.acquire_scanning_lock().await.unwrap().is_none());

        lock.release().await.unwrap();
        assert!(!store.is_scan_locked());
        assert!(store.acquire_scanning_lock().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_one_pending_check_per_checkable() {
        let (store, _) = store_with_resource();
        let resource = store.resources().await.unwrap().remove(0);

        let (first, created) = store
            .try_create_check(resource.as_ref(), Vec::new(), None, TIMEOUT, false, true)
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.state, CheckState::Started);
        assert_eq!(first.plan.timeout, TIMEOUT);
        assert_eq!(first.plan.checkable.kind(), CheckableKind::Resource);

        let (second, created) = store
            .try_create_check(resource.as_ref(), Vec::new(), None, TIMEOUT, true, true)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_finish_check_allows_new_check_and_stamps_end_time() {
        let (store, id) = store_with_resource();
        let resource = store.resources().await.unwrap().remove(0);
        let (check, _) = store
            .try_create_check(resource.as_ref(), Vec::new(), None, TIMEOUT, false, false)
            .await
            .unwrap();
        assert!(!check.durable);

        let before = Utc::now();
        store
            .finish_check(check.id, CheckOutcome::Errored("exit status 1".to_string()))
            .await
            .unwrap();

        assert!(store.started_checks().await.unwrap().is_empty());
        assert!(store.checkable(id).unwrap().last_check_end_time >= before);
        assert!(matches!(
            store.finish_check(check.id, CheckOutcome::Succeeded).await,
            Err(StoreError::CheckNotFound(_))
        ));

        let (_, created) = store
            .try_create_check(resource.as_ref(), Vec::new(), None, TIMEOUT, false, false)
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_setup_error_round_trip() {
        let (store, id) = store_with_resource();
        let resource = store.resources().await.unwrap().remove(0);

        resource
            .set_check_setup_error(Some("bad interval".to_string()))
            .await
            .unwrap();
        assert_eq!(store.setup_error(id).as_deref(), Some("bad interval"));

        resource.set_check_setup_error(None).await.unwrap();
        assert_eq!(store.setup_error(id), None);
    }

    #[tokio::test]
    async fn test_notify_checker_wakes_notifier() {
        let (notify, mut rx) = lookout_pacing::notifier();
        let store = MemoryCheckStore::new().with_checker_notifier(notify);

        store.notify_checker().await.unwrap();
        store.notify_checker().await.unwrap();

        assert_eq!(store.notifications(), 2);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_checkable_count_includes_types() {
        let (store, _) = store_with_resource();
        store.add_resource_type(CheckableRecord::resource_type(
            PipelineId::new(),
            "main",
            "custom",
            "registry-image",
        ));

        assert_eq!(CheckStore::checkable_count(&store).await.unwrap(), 2);
    }

    /// A store with `n` resources and a started check for each.
    async fn store_with_started_checks(n: usize) -> MemoryCheckStore {
        let store = MemoryCheckStore::new();
        let pipeline = PipelineId::new();
        for i in 0..n {
            store.add_resource(CheckableRecord::resource(
                pipeline,
                "main",
                &format!("repo-{i}"),
                "git",
            ));
        }
        for resource in store.resources().await.unwrap() {
            store
                .try_create_check(resource.as_ref(), Vec::new(), None, TIMEOUT, false, true)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_finished_checks_leave_pending_set() {
        let store = store_with_started_checks(5).await.with_finished_history(2);

        for check in store.started_checks().await.unwrap() {
            store
                .finish_check(check.id, CheckOutcome::Succeeded)
                .await
                .unwrap();
        }

        assert_eq!(store.pending_count(), 0);
        let kept = store.checks();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|c| c.state == CheckState::Succeeded));
    }

    #[tokio::test]
    async fn test_no_history_keeps_only_pending() {
        let store = store_with_started_checks(3).await.with_finished_history(0);
        let first = store.started_checks().await.unwrap().remove(0);

        store
            .finish_check(first.id, CheckOutcome::Succeeded)
            .await
            .unwrap();

        let ids: Vec<_> = store.checks().iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&first.id));
    }

    #[tokio::test]
    async fn test_claims_are_exclusive() {
        let store = store_with_started_checks(3).await;
        let lease = Duration::from_secs(60);

        let first = store.claim_started_checks(lease).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].create_time <= w[1].create_time));

        assert!(store.claim_started_checks(lease).await.unwrap().is_empty());
        assert_eq!(store.started_checks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_released_claim_can_be_claimed_again() {
        let store = store_with_started_checks(2).await;
        let lease = Duration::from_secs(60);
        let claimed = store.claim_started_checks(lease).await.unwrap();

        store.release_claim(claimed[1].id).await.unwrap();

        let again = store.claim_started_checks(lease).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, claimed[1].id);
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_claimed_again() {
        let store = store_with_started_checks(1).await;

        assert_eq!(store.claim_started_checks(Duration::ZERO).await.unwrap().len(), 1);
        assert_eq!(store.claim_started_checks(Duration::ZERO).await.unwrap().len(), 1);
        assert!(store
            .claim_started_checks(Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_release_claim_of_finished_check() {
        let store = store_with_started_checks(1).await;
        let check = store.claim_started_checks(TIMEOUT).await.unwrap().remove(0);
        store
            .finish_check(check.id, CheckOutcome::Succeeded)
            .await
            .unwrap();

        assert!(matches!(
            store.release_claim(check.id).await,
            Err(StoreError::CheckNotFound(_))
        ));
    }
}
