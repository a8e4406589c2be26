//! Worker-facing operations: heartbeat, complete, fail.
//!
//! All three authenticate with the `(job_id, lease_token)` pair. The job row
//! is locked `FOR UPDATE` first, so a racing cancel, reaper pass, or second
//! completion serializes behind the lock; any token or state mismatch
//! mutates nothing.

use crate::context::CoreContext;
use crate::errors::{Error, Result};
use crate::schema::{EventKind, Job, JobState};
use crate::store;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Where a failed job went.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Requeued `pending`; claimable again at the contained instant.
    Retried {
        /// The updated job.
        job: Job,
        /// When the next attempt becomes claimable.
        available_at: DateTime<Utc>,
    },
    /// Attempt budget exhausted; routed to the dead-letter queue.
    DeadLettered {
        /// The updated job.
        job: Job,
    },
}

/// Locks the job row and verifies the caller still holds the lease.
async fn lock_leased_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    lease_token: Uuid,
) -> Result<Job> {
    let job = store::fetch_job_for_update(tx, job_id)
        .await?
        .ok_or(Error::NotFound(job_id))?;
    if job.state != JobState::Leased || job.lease_token != Some(lease_token) {
        return Err(Error::LeaseInvalid(job_id));
    }
    Ok(job)
}

/// Extends a lease.
///
/// The new expiry is `now + lease_duration`, clamped to the job's execution
/// deadline. Past the deadline the heartbeat fails with
/// [`Error::ExecutionDeadlineExceeded`] and extends nothing; the reaper
/// performs the terminal disposition on its next pass. Heartbeats never
/// touch `attempts`.
#[instrument(name = "foreman.heartbeat", skip(ctx, lease_token))]
pub async fn heartbeat(
    ctx: &CoreContext,
    job_id: Uuid,
    lease_token: Uuid,
) -> Result<DateTime<Utc>> {
    let now = ctx.now();
    let mut tx = ctx.pool.begin().await?;

    let job = lock_leased_job(&mut tx, job_id, lease_token).await?;
    if let Some(deadline) = job.execution_deadline
        && now > deadline
    {
        tx.rollback().await?;
        return Err(Error::ExecutionDeadlineExceeded(job_id));
    }
    // An expired lease belongs to the reaper; a late heartbeat cannot
    // resurrect it.
    if job.lease_expires_at.is_some_and(|expires| expires < now) {
        tx.rollback().await?;
        return Err(Error::LeaseInvalid(job_id));
    }

    let mut expires_at = now
        + chrono::Duration::from_std(ctx.config.lease_duration)
            .unwrap_or(chrono::Duration::seconds(30));
    if let Some(deadline) = job.execution_deadline {
        expires_at = expires_at.min(deadline);
    }

    store::extend_lease(&mut tx, job_id, expires_at, now).await?;
    if ctx.config.heartbeat_events {
        store::append_event(
            &mut tx,
            job_id,
            EventKind::Heartbeat,
            &store::event_body(&job, None),
            now,
        )
        .await?;
    }
    tx.commit().await?;

    Ok(expires_at)
}

/// Records a successful completion.
///
/// Exactly-once effects: the completion row is unique per job, and a replay
/// with the same `idempotency_key` returns the stored result unchanged
/// without touching any state. The same job completed under a different key
/// fails with [`Error::IdempotencyConflict`].
#[instrument(name = "foreman.complete", skip(ctx, lease_token, result))]
pub async fn complete(
    ctx: &CoreContext,
    job_id: Uuid,
    lease_token: Uuid,
    result: Value,
    idempotency_key: &str,
) -> Result<Value> {
    let now = ctx.now();
    let mut tx = ctx.pool.begin().await?;

    if let Some(prior) = store::fetch_completion(&mut tx, job_id).await? {
        tx.rollback().await?;
        if prior.idempotency_key_complete == idempotency_key {
            return Ok(prior.result);
        }
        return Err(Error::IdempotencyConflict(format!(
            "job {job_id} already completed under key {}",
            prior.idempotency_key_complete
        )));
    }

    match lock_leased_job(&mut tx, job_id, lease_token).await {
        Ok(_) => {}
        Err(Error::LeaseInvalid(_)) => {
            // A concurrent completion may have just committed; waiting on the
            // row lock means the record is visible now if it did.
            let prior = store::fetch_completion(&mut tx, job_id).await?;
            tx.rollback().await?;
            return match prior {
                Some(prior) if prior.idempotency_key_complete == idempotency_key => {
                    Ok(prior.result)
                }
                Some(prior) => Err(Error::IdempotencyConflict(format!(
                    "job {job_id} already completed under key {}",
                    prior.idempotency_key_complete
                ))),
                None => Err(Error::LeaseInvalid(job_id)),
            };
        }
        Err(error) => return Err(error),
    };
    store::insert_completion(&mut tx, job_id, idempotency_key, &result, now).await?;
    let job = store::mark_succeeded(&mut tx, job_id, now).await?;
    store::append_event(
        &mut tx,
        job_id,
        EventKind::Succeeded,
        &store::event_body(&job, None),
        now,
    )
    .await?;
    tx.commit().await?;

    ctx.metrics.record_completion(&job.tenant_id, "succeeded");
    info!(job_id = %job_id, tenant_id = %job.tenant_id, "Job succeeded");
    Ok(result)
}

/// Records a failure reported by the lease holder.
///
/// Retryable failures below the attempt budget requeue with backoff; the
/// rest dead-letter. Both paths record `last_error` and emit the matching
/// outbox event in the same transaction.
#[instrument(name = "foreman.fail", skip(ctx, lease_token, error))]
pub async fn fail(
    ctx: &CoreContext,
    job_id: Uuid,
    lease_token: Uuid,
    error: &str,
    retryable: bool,
) -> Result<FailOutcome> {
    let now = ctx.now();
    let mut tx = ctx.pool.begin().await?;

    let job = lock_leased_job(&mut tx, job_id, lease_token).await?;
    let outcome = route_failure(ctx, &mut tx, &job, error, retryable, true, now).await?;
    tx.commit().await?;

    match &outcome {
        FailOutcome::Retried { job, available_at } => {
            ctx.metrics.record_completion(&job.tenant_id, "failed_retry");
            info!(job_id = %job_id, attempts = job.attempts, %available_at, "Job failed, retrying");
        }
        FailOutcome::DeadLettered { job } => {
            ctx.metrics.record_completion(&job.tenant_id, "dlq");
            warn!(job_id = %job_id, attempts = job.attempts, "Job dead-lettered");
        }
    }
    Ok(outcome)
}

/// Shared failure routing used by [`fail`] and the reaper.
///
/// Expects the job row to be locked by the caller's transaction.
/// `count_attempt` is false when a reaped lease should not consume an
/// attempt (see `Config::expiry_counts_as_attempt`).
pub(crate) async fn route_failure(
    ctx: &CoreContext,
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    error: &str,
    retryable: bool,
    count_attempt: bool,
    now: DateTime<Utc>,
) -> Result<FailOutcome> {
    let attempts = if count_attempt {
        job.attempts + 1
    } else {
        job.attempts
    };

    if retryable && attempts < job.max_attempts {
        let backoff_attempts = attempts.max(1);
        let available_at = ctx.with_rng(|rng| {
            ctx.config.retry.next_available_at(now, backoff_attempts, rng)
        });
        let job = store::requeue_job(tx, job.job_id, attempts, available_at, error, now).await?;
        store::append_event(
            tx,
            job.job_id,
            EventKind::FailedRetry,
            &store::event_body(&job, Some(error)),
            now,
        )
        .await?;
        Ok(FailOutcome::Retried { job, available_at })
    } else {
        let job = store::mark_dlq(tx, job.job_id, attempts, error, now).await?;
        store::append_event(
            tx,
            job.job_id,
            EventKind::Dlq,
            &store::event_body(&job, Some(error)),
            now,
        )
        .await?;
        Ok(FailOutcome::DeadLettered { job })
    }
}
