//! Postgres check store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lookout_id::{CheckId, PipelineId};
use lookout_model::{
    CheckEvery, CheckPlan, CheckState, CheckableKind, CheckableRef, ResourceTypeConfig, Version,
};
use lookout_pacing::NotifySender;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::{Postgres, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    claimable, Check, CheckOutcome, CheckStore, Checkable, CheckableRecord, Lock, ResourceType,
    ResourceTypeSet, SetupErrorWriter, StoreError, StoredCheckable,
};

/// Channel the scanner notifies after creating checks.
pub const CHECKER_CHANNEL: &str = "lookout_checker";

/// Advisory lock key held by the instance that is scanning.
const SCANNING_LOCK_ID: i64 = 0x6c6f_6f6b_6f75_7401;

/// A row from `resources` or `resource_types` joined with its pipeline.
#[derive(Debug, Clone)]
struct CheckableRow {
    id: String,
    name: String,
    type_name: String,
    pipeline_id: String,
    pipeline_name: String,
    source: serde_json::Value,
    check_every: Option<String>,
    has_webhook: bool,
    last_check_end_time: DateTime<Utc>,
    pinned_version: Option<serde_json::Value>,
    version: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CheckableRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            type_name: row.try_get("type")?,
            pipeline_id: row.try_get("pipeline_id")?,
            pipeline_name: row.try_get("pipeline_name")?,
            source: row.try_get("source")?,
            check_every: row.try_get("check_every")?,
            has_webhook: row.try_get("has_webhook")?,
            last_check_end_time: row.try_get("last_check_end_time")?,
            pinned_version: row.try_get("pinned_version")?,
            version: row.try_get("version")?,
        })
    }
}

impl CheckableRow {
    fn into_record(self, kind: CheckableKind) -> Result<CheckableRecord, StoreError> {
        Ok(CheckableRecord {
            id: CheckableRef::from_parts(kind.as_str(), &self.id)?,
            name: self.name,
            type_name: self.type_name,
            pipeline_id: PipelineId::parse(&self.pipeline_id)?,
            pipeline_name: self.pipeline_name,
            check_every: CheckEvery::from(self.check_every),
            has_webhook: self.has_webhook,
            last_check_end_time: self.last_check_end_time,
            pinned_version: self.pinned_version.map(serde_json::from_value).transpose()?,
            source: self.source,
            version: self.version.map(serde_json::from_value).transpose()?,
        })
    }
}

/// A row from `checks`.
#[derive(Debug, Clone)]
struct CheckRow {
    id: String,
    checkable_kind: String,
    checkable_id: String,
    checkable_name: String,
    pipeline_id: String,
    plan: serde_json::Value,
    manually_triggered: bool,
    state: String,
    create_time: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CheckRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            checkable_kind: row.try_get("checkable_kind")?,
            checkable_id: row.try_get("checkable_id")?,
            checkable_name: row.try_get("checkable_name")?,
            pipeline_id: row.try_get("pipeline_id")?,
            plan: row.try_get("plan")?,
            manually_triggered: row.try_get("manually_triggered")?,
            state: row.try_get("state")?,
            create_time: row.try_get("create_time")?,
        })
    }
}

impl TryFrom<CheckRow> for Check {
    type Error = StoreError;

    fn try_from(row: CheckRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: CheckId::parse(&row.id)?,
            checkable: CheckableRef::from_parts(&row.checkable_kind, &row.checkable_id)?,
            checkable_name: row.checkable_name,
            pipeline_id: PipelineId::parse(&row.pipeline_id)?,
            plan: serde_json::from_value::<CheckPlan>(row.plan)?,
            manually_triggered: row.manually_triggered,
            durable: true,
            state: row.state.parse::<CheckState>()?,
            create_time: row.create_time,
        })
    }
}

const CHECK_COLUMNS: &str = "id, checkable_kind, checkable_id, checkable_name, pipeline_id, \
                             plan, manually_triggered, state, create_time";

/// Check store backed by Postgres.
///
/// Durable checks live in the `checks` table. Checks created with
/// `persist = false` are kept in this instance only and are lost on restart.
#[derive(Clone)]
pub struct PgCheckStore {
    inner: Arc<PgInner>,
}

struct PgInner {
    pool: PgPool,
    ephemeral: Mutex<HashMap<CheckableRef, EphemeralCheck>>,
}

/// A check kept only in this instance, with its claim.
struct EphemeralCheck {
    check: Check,
    claimed_at: Option<DateTime<Utc>>,
}

impl PgInner {
    fn ephemeral(&self) -> MutexGuard<'_, HashMap<CheckableRef, EphemeralCheck>> {
        self.ephemeral.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PgCheckStore {
    /// Create a new Postgres check store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            inner: Arc::new(PgInner {
                pool,
                ephemeral: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    fn stored(&self, record: CheckableRecord) -> Arc<dyn Checkable> {
        Arc::new(StoredCheckable::new(record, self.inner.clone()))
    }

    /// Forward notifications on [`CHECKER_CHANNEL`] to `checker` until
    /// shutdown, so every instance's check loop wakes when any instance
    /// creates checks.
    pub async fn listen_checker(
        &self,
        checker: NotifySender,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, StoreError> {
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(CHECKER_CHANNEL).await?;
        info!(channel = CHECKER_CHANNEL, "Listening for checker notifications");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = listener.recv() => match notification {
                        Ok(_) => {
                            checker.notify();
                        }
                        Err(e) => {
                            warn!(error = %e, "Checker notification listener failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Checker notification listener shutting down");
                            break;
                        }
                    }
                }
            }
        }))
    }

    async fn pending_durable_check(&self, id: CheckableRef) -> Result<Option<Check>, StoreError> {
        let row = sqlx::query_as::<_, CheckRow>(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks \
             WHERE checkable_kind = $1 AND checkable_id = $2 AND state IN ('created', 'started')"
        ))
        .bind(id.kind().as_str())
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(Check::try_from).transpose()
    }

    async fn insert_check(&self, check: &Check) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO checks (
                id, checkable_kind, checkable_id, checkable_name, pipeline_id,
                plan, manually_triggered, state, create_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (checkable_kind, checkable_id) WHERE state IN ('created', 'started')
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(check.id.to_string())
        .bind(check.checkable.kind().as_str())
        .bind(check.checkable.to_string())
        .bind(&check.checkable_name)
        .bind(check.pipeline_id.to_string())
        .bind(serde_json::to_value(&check.plan)?)
        .bind(check.manually_triggered)
        .bind(check.state.as_str())
        .bind(check.create_time)
        .fetch_optional(self.pool())
        .await?;

        Ok(inserted.is_some())
    }

    async fn stamp_last_check_end_time(&self, checkable: CheckableRef) -> Result<(), StoreError> {
        let query = match checkable.kind() {
            CheckableKind::Resource => {
                "UPDATE resources SET last_check_end_time = now() WHERE id = $1"
            }
            CheckableKind::ResourceType => {
                "UPDATE resource_types SET last_check_end_time = now() WHERE id = $1"
            }
        };

        sqlx::query(query)
            .bind(checkable.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SetupErrorWriter for PgInner {
    async fn write_setup_error(
        &self,
        checkable: CheckableRef,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let query = match checkable.kind() {
            CheckableKind::Resource => "UPDATE resources SET check_setup_error = $2 WHERE id = $1",
            CheckableKind::ResourceType => {
                "UPDATE resource_types SET check_setup_error = $2 WHERE id = $1"
            }
        };

        sqlx::query(query)
            .bind(checkable.to_string())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Session-level advisory lock pinned to one pooled connection.
///
/// Dropped without [`Lock::release`], the connection is closed instead of
/// returned to the pool, which ends the session and frees the lock.
struct PgScanningLock {
    conn: Option<PoolConnection<Postgres>>,
}

impl Drop for PgScanningLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Scanning lock dropped without release, closing its connection");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl Lock for PgScanningLock {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        let mut lock = self;
        let Some(mut conn) = lock.conn.take() else {
            return Ok(());
        };
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(SCANNING_LOCK_ID)
            .fetch_one(&mut *conn)
            .await;

        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                // Closing the session drops any advisory lock it still holds.
                drop(conn.detach());
                Err(StoreError::Unavailable(
                    "scanning lock was not held by this session".to_string(),
                ))
            }
            Err(e) => {
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl CheckStore for PgCheckStore {
    async fn acquire_scanning_lock(&self) -> Result<Option<Box<dyn Lock>>, StoreError> {
        let mut conn = self.pool().acquire().await?;
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(SCANNING_LOCK_ID)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(PgScanningLock { conn: Some(conn) })))
    }

    async fn resources(&self) -> Result<Vec<Arc<dyn Checkable>>, StoreError> {
        let rows = sqlx::query_as::<_, CheckableRow>(
            r#"
            SELECT
                r.id,
                r.name,
                r.type,
                r.pipeline_id,
                p.name AS pipeline_name,
                r.source,
                r.check_every,
                r.webhook_token IS NOT NULL AS has_webhook,
                r.last_check_end_time,
                r.pinned_version,
                NULL::jsonb AS version
            FROM resources r
            JOIN pipelines p ON p.id = r.pipeline_id
            WHERE r.active AND NOT p.paused
            ORDER BY r.id
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| Ok(self.stored(row.into_record(CheckableKind::Resource)?)))
            .collect()
    }

    async fn resource_types(&self) -> Result<ResourceTypeSet, StoreError> {
        let rows = sqlx::query_as::<_, CheckableRow>(
            r#"
            SELECT
                t.id,
                t.name,
                t.type,
                t.pipeline_id,
                p.name AS pipeline_name,
                t.source,
                t.check_every,
                FALSE AS has_webhook,
                t.last_check_end_time,
                NULL::jsonb AS pinned_version,
                t.version
            FROM resource_types t
            JOIN pipelines p ON p.id = t.pipeline_id
            WHERE t.active AND NOT p.paused
            ORDER BY t.id
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let types = rows
            .into_iter()
            .map(|row| {
                let record = row.into_record(CheckableKind::ResourceType)?;
                Ok(ResourceType {
                    version: record.version.clone(),
                    checkable: self.stored(record),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(ResourceTypeSet::new(types))
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

        if let Some(pending) = self.inner.ephemeral().get(&id) {
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

        if !persist {
            if let Some(pending) = self.pending_durable_check(id).await? {
                return Ok((pending, false));
            }

            let mut ephemeral = self.inner.ephemeral();
            if let Some(pending) = ephemeral.get(&id) {
                return Ok((pending.check.clone(), false));
            }
            ephemeral.insert(
                id,
                EphemeralCheck {
                    check: check.clone(),
                    claimed_at: None,
                },
            );
            return Ok((check, true));
        }

        // A pending check can finish between the failed insert and the
        // lookup; one retry covers that window.
        for _ in 0..2 {
            if self.insert_check(&check).await? {
                return Ok((check, true));
            }
            if let Some(pending) = self.pending_durable_check(id).await? {
                return Ok((pending, false));
            }
        }

        Err(StoreError::Unavailable(format!(
            "could not create or find a pending check for {}",
            checkable.name()
        )))
    }

    async fn notify_checker(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(CHECKER_CHANNEL)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn started_checks(&self) -> Result<Vec<Check>, StoreError> {
        let rows = sqlx::query_as::<_, CheckRow>(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks WHERE state = 'started' ORDER BY create_time, id"
        ))
        .fetch_all(self.pool())
        .await?;

        let mut checks = rows
            .into_iter()
            .map(Check::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        checks.extend(self.inner.ephemeral().values().map(|e| e.check.clone()));
        checks.sort_by_key(|c| c.create_time);
        Ok(checks)
    }

    async fn claim_started_checks(&self, lease: Duration) -> Result<Vec<Check>, StoreError> {
        // Rows another instance is claiming right now are skipped, not waited on.
        let rows = sqlx::query_as::<_, CheckRow>(&format!(
            r#"
            UPDATE checks SET claimed_at = now()
            WHERE id IN (
                SELECT id FROM checks
                WHERE state = 'started'
                  AND (claimed_at IS NULL OR claimed_at <= now() - make_interval(secs => $1))
                ORDER BY create_time, id
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {CHECK_COLUMNS}
            "#
        ))
        .bind(lease.as_secs_f64())
        .fetch_all(self.pool())
        .await?;

        let mut checks = rows
            .into_iter()
            .map(Check::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let now = Utc::now();
        {
            let mut ephemeral = self.inner.ephemeral();
            for pending in ephemeral.values_mut() {
                if claimable(pending.claimed_at, now, lease) {
                    pending.claimed_at = Some(now);
                    checks.push(pending.check.clone());
                }
            }
        }

        checks.sort_by_key(|c| (c.create_time, c.id));
        Ok(checks)
    }

    async fn release_claim(&self, id: CheckId) -> Result<(), StoreError> {
        let was_ephemeral = {
            let mut pending = self.inner.ephemeral();
            match pending.values_mut().find(|e| e.check.id == id) {
                Some(e) => {
                    e.claimed_at = None;
                    true
                }
                None => false,
            }
        };
        if was_ephemeral {
            return Ok(());
        }

        let released = sqlx::query(
            "UPDATE checks SET claimed_at = NULL WHERE id = $1 AND state = 'started'",
        )
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if released.rows_affected() == 0 {
            return Err(StoreError::CheckNotFound(id));
        }
        Ok(())
    }

    async fn finish_check(&self, id: CheckId, outcome: CheckOutcome) -> Result<(), StoreError> {
        let ephemeral = {
            let mut pending = self.inner.ephemeral();
            let key = pending
                .iter()
                .find(|(_, e)| e.check.id == id)
                .map(|(key, _)| *key);
            key.and_then(|key| pending.remove(&key))
        };

        let checkable = match ephemeral {
            Some(e) => e.check.checkable,
            None => {
                let row = sqlx::query(
                    r#"
                    UPDATE checks
                    SET state = $2, end_time = now(), error = $3
                    WHERE id = $1 AND state IN ('created', 'started')
                    RETURNING checkable_kind, checkable_id
                    "#,
                )
                .bind(id.to_string())
                .bind(outcome.state().as_str())
                .bind(outcome.error())
                .fetch_optional(self.pool())
                .await?
                .ok_or(StoreError::CheckNotFound(id))?;

                let kind: String = row.try_get("checkable_kind")?;
                let checkable_id: String = row.try_get("checkable_id")?;
                CheckableRef::from_parts(&kind, &checkable_id)?
            }
        };

        self.stamp_last_check_end_time(checkable).await
    }

    async fn checkable_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT
                (SELECT count(*) FROM resources r
                    JOIN pipelines p ON p.id = r.pipeline_id
                    WHERE r.active AND NOT p.paused)
              + (SELECT count(*) FROM resource_types t
                    JOIN pipelines p ON p.id = t.pipeline_id
                    WHERE t.active AND NOT p.paused)
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
