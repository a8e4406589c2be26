//! Narrow repository over the orchestrator tables.
//!
//! Every mutation here runs inside a caller-owned transaction so state
//! changes, completion records, and outbox events commit atomically. The
//! claim and reaper paths rely on `FOR UPDATE SKIP LOCKED` so concurrent
//! replicas select disjoint rows instead of blocking on each other.

use crate::schema::{Completion, EventKind, Job, JobState, OutboxEvent, Tenant};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const JOB_COLUMNS: &str = "job_id, tenant_id, queue, priority, payload, state, attempts, \
     max_attempts, available_at, run_after, created_at, updated_at, idempotency_key_create, \
     lease_token, worker_id, lease_expires_at, last_heartbeat_at, started_at, \
     execution_deadline, last_error";

const EVENT_COLUMNS: &str =
    "event_id, aggregate_id, sequence, kind, payload, visible_at, locked_until, delivered_at, attempts";

/// Inserts or updates a tenant record.
pub(crate) async fn upsert_tenant(
    pool: &PgPool,
    tenant_id: &str,
    weight: i32,
    inflight_cap: i32,
    api_key_hash: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Tenant, sqlx::Error> {
    sqlx::query_as::<_, Tenant>(
        r"
        INSERT INTO tenants (tenant_id, weight, inflight_cap, api_key_hash, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $5)
        ON CONFLICT (tenant_id) DO UPDATE
        SET weight = EXCLUDED.weight,
            inflight_cap = EXCLUDED.inflight_cap,
            api_key_hash = EXCLUDED.api_key_hash,
            updated_at = EXCLUDED.updated_at
        RETURNING tenant_id, weight, inflight_cap, api_key_hash, created_at, updated_at
        ",
    )
    .bind(tenant_id)
    .bind(weight)
    .bind(inflight_cap)
    .bind(api_key_hash)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// Inserts a new pending job.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn insert_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    tenant_id: &str,
    queue: &str,
    priority: i32,
    payload: &Value,
    max_attempts: i32,
    available_at: DateTime<Utc>,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        INSERT INTO jobs (job_id, tenant_id, queue, priority, payload, state, attempts,
                          max_attempts, available_at, run_after, created_at, updated_at,
                          idempotency_key_create)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $7, $8, $8, $9)
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(job_id)
    .bind(tenant_id)
    .bind(queue)
    .bind(priority)
    .bind(payload)
    .bind(max_attempts)
    .bind(available_at)
    .bind(now)
    .bind(idempotency_key)
    .fetch_one(&mut **tx)
    .await
}

/// Fetches a job without locking it.
pub(crate) async fn fetch_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Fetches a job under a row lock, blocking concurrent mutators until the
/// surrounding transaction finishes.
pub(crate) async fn fetch_job_for_update(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1 FOR UPDATE"
    ))
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Looks up a prior submission with the same creation idempotency key.
pub(crate) async fn fetch_job_by_creation_key(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    idempotency_key: &str,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND idempotency_key_create = $2"
    ))
    .bind(tenant_id)
    .bind(idempotency_key)
    .fetch_optional(&mut **tx)
    .await
}

/// Number of jobs a tenant has in the given state.
pub(crate) async fn count_tenant_jobs(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    state: JobState,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM jobs WHERE tenant_id = $1 AND state = $2",
    )
    .bind(tenant_id)
    .bind(state.as_str())
    .fetch_one(&mut **tx)
    .await
}

/// Tenants with at least one claimable job whose in-flight count is below
/// their cap, intersected with an optional scope. Returns `(tenant_id,
/// weight)` pairs for weighted sampling.
pub(crate) async fn eligible_tenants(
    pool: &PgPool,
    now: DateTime<Utc>,
    tenant_scope: Option<&[String]>,
    queues: Option<&[String]>,
) -> Result<Vec<(String, i32)>, sqlx::Error> {
    sqlx::query_as::<_, (String, i32)>(
        r"
        SELECT t.tenant_id, t.weight
        FROM tenants t
        WHERE EXISTS (
            SELECT 1 FROM jobs j
            WHERE j.tenant_id = t.tenant_id
              AND j.state = 'pending'
              AND j.available_at <= $1
              AND ($2::text[] IS NULL OR j.queue = ANY($2))
        )
        AND (
            t.inflight_cap = 0
            OR (SELECT COUNT(*) FROM jobs l
                WHERE l.tenant_id = t.tenant_id AND l.state = 'leased') < t.inflight_cap
        )
        AND ($3::text[] IS NULL OR t.tenant_id = ANY($3))
        ORDER BY t.tenant_id
        ",
    )
    .bind(now)
    .bind(queues)
    .bind(tenant_scope)
    .fetch_all(pool)
    .await
}

/// Selects and row-locks the best claimable job of a tenant, skipping rows
/// another poller already holds.
pub(crate) async fn lock_candidate(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    queues: Option<&[String]>,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE tenant_id = $1
          AND state = 'pending'
          AND available_at <= $2
          AND ($3::text[] IS NULL OR queue = ANY($3))
        ORDER BY priority DESC, created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        ",
    ))
    .bind(tenant_id)
    .bind(now)
    .bind(queues)
    .fetch_optional(&mut **tx)
    .await
}

/// Promotes a locked pending job to leased.
pub(crate) async fn promote_to_leased(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    lease_token: Uuid,
    worker_id: &str,
    lease_expires_at: DateTime<Utc>,
    execution_deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET state = 'leased',
            lease_token = $2,
            worker_id = $3,
            lease_expires_at = $4,
            started_at = COALESCE(started_at, $6),
            execution_deadline = COALESCE(execution_deadline, $5),
            last_heartbeat_at = $6,
            updated_at = $6
        WHERE job_id = $1
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(job_id)
    .bind(lease_token)
    .bind(worker_id)
    .bind(lease_expires_at)
    .bind(execution_deadline)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Extends the lease of a locked job.
pub(crate) async fn extend_lease(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    lease_expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE jobs SET lease_expires_at = $2, last_heartbeat_at = $3, updated_at = $3 WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(lease_expires_at)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Marks a locked leased job succeeded and clears the lease triple.
pub(crate) async fn mark_succeeded(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET state = 'succeeded',
            lease_token = NULL,
            worker_id = NULL,
            lease_expires_at = NULL,
            updated_at = $2
        WHERE job_id = $1
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(job_id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Returns a locked job to `pending` with a new attempt count and backoff.
pub(crate) async fn requeue_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    attempts: i32,
    available_at: DateTime<Utc>,
    last_error: &str,
    now: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET state = 'pending',
            attempts = $2,
            available_at = $3,
            last_error = $4,
            lease_token = NULL,
            worker_id = NULL,
            lease_expires_at = NULL,
            last_heartbeat_at = NULL,
            updated_at = $5
        WHERE job_id = $1
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(job_id)
    .bind(attempts)
    .bind(available_at)
    .bind(last_error)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Dead-letters a locked job.
pub(crate) async fn mark_dlq(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    attempts: i32,
    last_error: &str,
    now: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET state = 'dlq',
            attempts = $2,
            last_error = $3,
            lease_token = NULL,
            worker_id = NULL,
            lease_expires_at = NULL,
            last_heartbeat_at = NULL,
            updated_at = $4
        WHERE job_id = $1
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(job_id)
    .bind(attempts)
    .bind(last_error)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Cancels a locked job, invalidating any live lease.
pub(crate) async fn mark_canceled(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET state = 'canceled',
            lease_token = NULL,
            worker_id = NULL,
            lease_expires_at = NULL,
            last_heartbeat_at = NULL,
            updated_at = $2
        WHERE job_id = $1
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(job_id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Moves a locked DLQ job back to `pending` with a fresh attempt budget.
pub(crate) async fn redrive_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET state = 'pending',
            attempts = 0,
            available_at = $2,
            updated_at = $2
        WHERE job_id = $1
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(job_id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Appends an outbox event with the next per-aggregate sequence.
///
/// Callers must hold the job's row lock (or have inserted the job in this
/// transaction); that is what serializes the MAX(sequence) computation.
pub(crate) async fn append_event(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: Uuid,
    kind: EventKind,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO outbox_events (aggregate_id, sequence, kind, payload, visible_at)
        SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3, $4
        FROM outbox_events
        WHERE aggregate_id = $1
        RETURNING sequence
        ",
    )
    .bind(aggregate_id)
    .bind(kind.as_str())
    .bind(payload)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

/// Fetches the completion record of a job, if any.
pub(crate) async fn fetch_completion(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
) -> Result<Option<Completion>, sqlx::Error> {
    sqlx::query_as::<_, Completion>(
        r"
        SELECT job_id, idempotency_key_complete, result, recorded_at
        FROM job_completions
        WHERE job_id = $1
        ",
    )
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Records the single terminal success of a job.
pub(crate) async fn insert_completion(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    idempotency_key: &str,
    result: &Value,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO job_completions (job_id, idempotency_key_complete, result, recorded_at)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(job_id)
    .bind(idempotency_key)
    .bind(result)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Ids of leased jobs whose lease or execution deadline has passed.
pub(crate) async fn expired_lease_ids(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r"
        SELECT job_id FROM jobs
        WHERE state = 'leased'
          AND (lease_expires_at <= $1 OR execution_deadline <= $1)
        ORDER BY lease_expires_at ASC
        LIMIT $2
        ",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Re-checks one candidate under a lock, skipping it when another reaper
/// replica or a racing heartbeat holds the row.
pub(crate) async fn lock_expired_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        SELECT {JOB_COLUMNS} FROM jobs
        WHERE job_id = $1
          AND state = 'leased'
          AND (lease_expires_at <= $2 OR execution_deadline <= $2)
        FOR UPDATE SKIP LOCKED
        ",
    ))
    .bind(job_id)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await
}

/// Selects and publish-locks the next deliverable outbox events.
///
/// Only the smallest undelivered sequence per aggregate qualifies, which
/// keeps per-job delivery strictly ordered even across publisher replicas.
pub(crate) async fn lock_publishable_events(
    tx: &mut Transaction<'_, Postgres>,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<OutboxEvent>, sqlx::Error> {
    sqlx::query_as::<_, OutboxEvent>(&format!(
        r"
        SELECT {EVENT_COLUMNS}
        FROM outbox_events
        WHERE delivered_at IS NULL
          AND visible_at <= $1
          AND (locked_until IS NULL OR locked_until <= $1)
          AND sequence = (
              SELECT MIN(i.sequence) FROM outbox_events i
              WHERE i.aggregate_id = outbox_events.aggregate_id
                AND i.delivered_at IS NULL
          )
        ORDER BY aggregate_id, sequence, event_id
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        ",
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(&mut **tx)
    .await
}

/// Stamps the publish lease on a locked batch.
pub(crate) async fn lock_events_until(
    tx: &mut Transaction<'_, Postgres>,
    event_ids: &[i64],
    locked_until: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE outbox_events SET locked_until = $2 WHERE event_id = ANY($1)")
        .bind(event_ids)
        .bind(locked_until)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Marks an event delivered. Idempotent.
pub(crate) async fn mark_event_delivered(
    pool: &PgPool,
    event_id: i64,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE outbox_events
        SET delivered_at = $2, locked_until = NULL
        WHERE event_id = $1 AND delivered_at IS NULL
        ",
    )
    .bind(event_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Releases a failed delivery and schedules the retry.
pub(crate) async fn mark_event_delivery_failed(
    pool: &PgPool,
    event_id: i64,
    attempts: i32,
    visible_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE outbox_events
        SET attempts = $2, locked_until = NULL, visible_at = $3
        WHERE event_id = $1
        ",
    )
    .bind(event_id)
    .bind(attempts)
    .bind(visible_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Job counts per state, for the queue-depth gauges.
pub(crate) async fn state_counts(pool: &PgPool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (String, i64)>("SELECT state, COUNT(*) FROM jobs GROUP BY state")
        .fetch_all(pool)
        .await
}

/// Standard body of a lifecycle outbox event: a snapshot of the job after
/// the transition, plus the triggering error when there is one.
pub(crate) fn event_body(job: &Job, error: Option<&str>) -> Value {
    serde_json::json!({
        "job_id": job.job_id,
        "tenant_id": job.tenant_id,
        "queue": job.queue,
        "state": job.state,
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "priority": job.priority,
        "available_at": job.available_at,
        "error": error,
    })
}

/// First-claim instants of live leases, for the lease-age histogram.
pub(crate) async fn live_lease_starts(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT started_at FROM jobs WHERE state = 'leased' AND started_at IS NOT NULL LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}
