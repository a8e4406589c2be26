//! Control-plane operations: submit, read, cancel, redrive, tenants.

use crate::context::CoreContext;
use crate::errors::{Error, Result};
use crate::schema::{DEFAULT_QUEUE, EventKind, Job, JobState, Tenant};
use crate::store;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

/// A job submission.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Owning tenant. Must exist.
    pub tenant_id: String,
    /// Target queue.
    pub queue: String,
    /// Claim precedence; higher goes first.
    pub priority: i32,
    /// Opaque JSON payload handed to the worker.
    pub payload: Value,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Earliest instant the job may run. Defaults to "now".
    pub run_after: Option<DateTime<Utc>>,
    /// Makes the submission replay-safe per tenant.
    pub idempotency_key: Option<String>,
}

impl NewJob {
    /// A submission to the default queue with default priority and three
    /// attempts.
    pub fn new(tenant_id: impl Into<String>, payload: Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue: DEFAULT_QUEUE.into(),
            priority: 0,
            payload,
            max_attempts: 3,
            run_after: None,
            idempotency_key: None,
        }
    }

    /// Sets the target queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt budget.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delays the job until `run_after`.
    pub fn run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    /// Attaches a creation idempotency key.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Whether an existing job is a faithful replay of this submission.
    fn matches(&self, job: &Job) -> bool {
        job.queue == self.queue
            && job.priority == self.priority
            && job.payload == self.payload
            && job.max_attempts == self.max_attempts
    }
}

/// Outcome of [`submit`].
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    /// The inserted or replayed job.
    pub job: Job,
    /// `false` when an idempotency key matched a prior submission.
    pub created: bool,
}

/// Tenant registration parameters.
#[derive(Debug, Clone)]
pub struct TenantSpec {
    /// Unique tenant identifier.
    pub tenant_id: String,
    /// Claim share relative to other tenants.
    pub weight: i32,
    /// Concurrent lease ceiling; `0` is unlimited.
    pub inflight_cap: i32,
    /// Hash of the tenant's API key, stored for the API boundary.
    pub api_key_hash: Option<String>,
}

impl TenantSpec {
    /// A tenant with weight 1 and no in-flight cap.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            weight: 1,
            inflight_cap: 0,
            api_key_hash: None,
        }
    }

    /// Sets the claim weight.
    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the concurrent lease ceiling.
    pub fn inflight_cap(mut self, cap: i32) -> Self {
        self.inflight_cap = cap;
        self
    }

    /// Stores the API key hash.
    pub fn api_key_hash(mut self, hash: impl Into<String>) -> Self {
        self.api_key_hash = Some(hash.into());
        self
    }
}

/// Registers or updates a tenant.
pub async fn upsert_tenant(ctx: &CoreContext, spec: TenantSpec) -> Result<Tenant> {
    if spec.weight <= 0 {
        return Err(Error::BadRequest("tenant weight must be positive".into()));
    }
    if spec.inflight_cap < 0 {
        return Err(Error::BadRequest("inflight_cap must not be negative".into()));
    }
    let tenant = store::upsert_tenant(
        &ctx.pool,
        &spec.tenant_id,
        spec.weight,
        spec.inflight_cap,
        spec.api_key_hash.as_deref(),
        ctx.now(),
    )
    .await?;
    Ok(tenant)
}

/// Submits a job.
///
/// Inserts a `pending` row and its `created` outbox event in one
/// transaction. A duplicate `(tenant_id, idempotency_key)` with equal
/// parameters returns the original job with `created = false`; divergent
/// parameters fail with [`Error::IdempotencyConflict`].
#[instrument(name = "foreman.submit", skip(ctx, new_job), fields(tenant_id = %new_job.tenant_id, queue = %new_job.queue))]
pub async fn submit(ctx: &CoreContext, new_job: NewJob) -> Result<SubmitReceipt> {
    if new_job.max_attempts < 1 {
        return Err(Error::BadRequest("max_attempts must be at least 1".into()));
    }
    let now = ctx.now();
    let available_at = new_job.run_after.unwrap_or(now).max(now);

    let mut tx = ctx.pool.begin().await?;

    if let Some(key) = new_job.idempotency_key.as_deref() {
        if let Some(existing) =
            store::fetch_job_by_creation_key(&mut tx, &new_job.tenant_id, key).await?
        {
            tx.rollback().await?;
            if new_job.matches(&existing) {
                return Ok(SubmitReceipt {
                    job: existing,
                    created: false,
                });
            }
            return Err(Error::IdempotencyConflict(format!(
                "creation key {key} was used with different parameters"
            )));
        }
    }

    if let Some(cap) = ctx.config.max_pending_per_tenant {
        let pending =
            store::count_tenant_jobs(&mut tx, &new_job.tenant_id, JobState::Pending).await?;
        if pending >= cap {
            tx.rollback().await?;
            return Err(Error::TenantCapExceeded {
                tenant_id: new_job.tenant_id,
                cap,
            });
        }
    }

    let inserted = store::insert_job(
        &mut tx,
        Uuid::new_v4(),
        &new_job.tenant_id,
        &new_job.queue,
        new_job.priority,
        &new_job.payload,
        new_job.max_attempts,
        available_at,
        new_job.idempotency_key.as_deref(),
        now,
    )
    .await;
    let job = match inserted {
        Ok(job) => job,
        // A concurrent submission with the same creation key won the insert.
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            tx.rollback().await?;
            let key = new_job.idempotency_key.as_deref().unwrap_or_default();
            let mut tx = ctx.pool.begin().await?;
            let existing = store::fetch_job_by_creation_key(&mut tx, &new_job.tenant_id, key)
                .await?
                .ok_or_else(|| {
                    Error::IdempotencyConflict(format!("creation key {key} raced and vanished"))
                })?;
            tx.rollback().await?;
            if new_job.matches(&existing) {
                return Ok(SubmitReceipt {
                    job: existing,
                    created: false,
                });
            }
            return Err(Error::IdempotencyConflict(format!(
                "creation key {key} was used with different parameters"
            )));
        }
        Err(error) => return Err(error.into()),
    };
    store::append_event(
        &mut tx,
        job.job_id,
        EventKind::Created,
        &store::event_body(&job, None),
        now,
    )
    .await?;
    tx.commit().await?;

    info!(job_id = %job.job_id, "Job submitted");
    Ok(SubmitReceipt { job, created: true })
}

/// Reads a job.
pub async fn get(ctx: &CoreContext, job_id: Uuid) -> Result<Job> {
    store::fetch_job(&ctx.pool, job_id)
        .await?
        .ok_or(Error::NotFound(job_id))
}

/// Cancels a job.
///
/// Allowed from `pending` and `leased`; canceling a leased job clears the
/// lease so any later heartbeat or completion from the holder fails with
/// [`Error::LeaseInvalid`]. When a completion races a cancel, whichever
/// transaction commits first wins; the row lock serializes them.
#[instrument(name = "foreman.cancel", skip(ctx))]
pub async fn cancel(ctx: &CoreContext, job_id: Uuid) -> Result<Job> {
    let now = ctx.now();
    let mut tx = ctx.pool.begin().await?;

    let job = store::fetch_job_for_update(&mut tx, job_id)
        .await?
        .ok_or(Error::NotFound(job_id))?;
    match job.state {
        JobState::Pending | JobState::Leased => {}
        other => {
            tx.rollback().await?;
            return Err(Error::BadRequest(format!(
                "cannot cancel a job in state {}",
                other.as_str()
            )));
        }
    }

    let job = store::mark_canceled(&mut tx, job_id, now).await?;
    store::append_event(
        &mut tx,
        job_id,
        EventKind::Canceled,
        &store::event_body(&job, None),
        now,
    )
    .await?;
    tx.commit().await?;

    info!(job_id = %job_id, "Job canceled");
    Ok(job)
}

/// Moves a dead-lettered job back to `pending` with a fresh attempt budget.
///
/// Appends no outbox event of its own; the next claim emits `leased`.
#[instrument(name = "foreman.redrive", skip(ctx))]
pub async fn redrive(ctx: &CoreContext, job_id: Uuid) -> Result<Job> {
    let now = ctx.now();
    let mut tx = ctx.pool.begin().await?;

    let job = store::fetch_job_for_update(&mut tx, job_id)
        .await?
        .ok_or(Error::NotFound(job_id))?;
    if job.state != JobState::Dlq {
        tx.rollback().await?;
        return Err(Error::BadRequest(format!(
            "cannot redrive a job in state {}",
            job.state.as_str()
        )));
    }

    let job = store::redrive_job(&mut tx, job_id, now).await?;
    tx.commit().await?;

    ctx.metrics.record_redrive();
    info!(job_id = %job_id, "Job redriven from DLQ");
    Ok(job)
}
