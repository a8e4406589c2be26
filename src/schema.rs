//! Database schema definitions for SQLx.
//!
//! This module contains the row structs and state enums for the job
//! orchestrator tables. All timestamps are `TIMESTAMPTZ` and all payloads
//! are `JSONB`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Durable state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created and waiting to be claimed.
    Pending,
    /// Exclusively assigned to a worker under a lease.
    Leased,
    /// Terminal: completed successfully.
    Succeeded,
    /// Terminal: attempts exhausted, routed to the dead-letter queue.
    Dlq,
    /// Terminal: canceled on user request.
    Canceled,
}

impl JobState {
    /// The textual form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Succeeded => "succeeded",
            JobState::Dlq => "dlq",
            JobState::Canceled => "canceled",
        }
    }

    /// All states, in lifecycle order. Used for per-state gauges.
    pub fn all() -> [JobState; 5] {
        [
            JobState::Pending,
            JobState::Leased,
            JobState::Succeeded,
            JobState::Dlq,
            JobState::Canceled,
        ]
    }
}

/// Kind of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A job was submitted.
    Created,
    /// A job was claimed by a worker.
    Leased,
    /// A job completed successfully.
    Succeeded,
    /// A job failed and was requeued with backoff.
    FailedRetry,
    /// A job exhausted its attempts and was dead-lettered.
    Dlq,
    /// A job was canceled.
    Canceled,
    /// A lease was extended. Only emitted when heartbeat events are enabled.
    Heartbeat,
}

impl EventKind {
    /// The textual form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Leased => "leased",
            EventKind::Succeeded => "succeeded",
            EventKind::FailedRetry => "failed_retry",
            EventKind::Dlq => "dlq",
            EventKind::Canceled => "canceled",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

/// Represents a tenant record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    /// Unique tenant identifier.
    pub tenant_id: String,
    /// Relative share of claims among tenants with eligible work.
    pub weight: i32,
    /// Maximum number of concurrently leased jobs. `0` means unlimited.
    pub inflight_cap: i32,
    /// Hash of the tenant's API key. Verification happens at the API
    /// boundary, outside this crate.
    pub api_key_hash: Option<String>,
    /// Timestamp when the tenant was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last update.
    pub updated_at: DateTime<Utc>,
}

/// Represents a job record in the database.
///
/// The lease is embedded: a lease exists iff `state` is [`JobState::Leased`]
/// and `lease_token` / `lease_expires_at` are set.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job.
    pub job_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Named queue the job belongs to.
    pub queue: String,
    /// Priority of the job (higher = claimed first).
    pub priority: i32,
    /// JSON data containing the job payload.
    pub payload: Value,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of attempts consumed so far.
    pub attempts: i32,
    /// Attempt budget; the job is dead-lettered when a failure reaches it.
    pub max_attempts: i32,
    /// Earliest instant the job may be claimed.
    pub available_at: DateTime<Utc>,
    /// Caller-requested earliest run time. Equals `available_at` on creation.
    pub run_after: DateTime<Utc>,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change.
    pub updated_at: DateTime<Utc>,
    /// Creation idempotency key, unique per tenant when set.
    pub idempotency_key_create: Option<String>,
    /// Opaque token authenticating the current lease holder.
    pub lease_token: Option<Uuid>,
    /// Worker currently holding the lease.
    pub worker_id: Option<String>,
    /// Instant the current lease expires.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last heartbeat received from the lease holder.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// First time the job was claimed. Survives requeues.
    pub started_at: Option<DateTime<Utc>>,
    /// Hard wall-clock deadline for execution across all attempts.
    pub execution_deadline: Option<DateTime<Utc>>,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
}

/// Represents the single terminal success record of a job.
#[derive(Debug, Clone, FromRow)]
pub struct Completion {
    /// The completed job.
    pub job_id: Uuid,
    /// Key the worker supplied with the completion. Replays with the same
    /// key return [`Completion::result`] unchanged.
    pub idempotency_key_complete: String,
    /// Result payload stored on first completion.
    pub result: Value,
    /// Timestamp the completion was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Represents a pending or delivered event in the transactional outbox.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxEvent {
    /// Monotonic identifier across all events.
    pub event_id: i64,
    /// The job this event belongs to.
    pub aggregate_id: Uuid,
    /// Per-aggregate monotonic sequence number, starting at 1.
    pub sequence: i64,
    /// What happened.
    pub kind: EventKind,
    /// JSON event body.
    pub payload: Value,
    /// Earliest instant the publisher may pick the event up.
    pub visible_at: DateTime<Utc>,
    /// Publish lease; set while a publisher replica is delivering the event.
    pub locked_until: Option<DateTime<Utc>>,
    /// Set once the event has been handed to the sink.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Number of failed delivery attempts.
    pub attempts: i32,
}
