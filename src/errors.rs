use std::time::Duration;

/// Errors returned by orchestrator operations.
///
/// The variants mirror the wire-level taxonomy the API boundary maps onto
/// HTTP statuses. Store-level failures that are worth retrying surface as
/// [`Error::Transient`] only after the internal retry budget is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input or an operation invalid for the job's current state.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller is not allowed to act on this resource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The referenced job does not exist.
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),

    /// The lease token is missing, stale, or the job is no longer leased.
    #[error("lease for job {0} is invalid or lost")]
    LeaseInvalid(uuid::Uuid),

    /// The job ran past its execution deadline; the lease can no longer be
    /// extended and the reaper will dispose of the job.
    #[error("execution deadline for job {0} exceeded")]
    ExecutionDeadlineExceeded(uuid::Uuid),

    /// An idempotency key was reused with divergent inputs.
    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Admission control rejected the submission.
    #[error("tenant {tenant_id} exceeded its cap of {cap} pending jobs")]
    TenantCapExceeded {
        /// The rejected tenant.
        tenant_id: String,
        /// The configured ceiling.
        cap: i64,
    },

    /// Invalid configuration, reported once at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A retryable store error that persisted past the internal retry budget.
    #[error("transient store error")]
    Transient(#[source] sqlx::Error),

    /// A non-retryable store error or broken invariant.
    #[error("internal error")]
    Internal(#[from] sqlx::Error),
}

/// Convenient alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// How many times a transient store error is retried inside an operation
/// before surfacing.
const TRANSIENT_RETRIES: u32 = 3;

/// Pause between internal transient retries.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// Whether a store error is worth a short internal retry.
///
/// Deadlocks (40P01) and serialization failures (40001) are expected under
/// row-lock contention; connection-level failures usually heal on a fresh
/// pooled connection.
pub(crate) fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
        _ => false,
    }
}

/// Runs `op` with the crate's bounded transient-retry policy.
///
/// `op` must be a full transaction: it is re-invoked from scratch on every
/// retry, so partially applied work must not leak out of a failed attempt.
pub(crate) async fn with_transient_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut last = None;
    for attempt in 0..=TRANSIENT_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) => {
                tracing::debug!(%error, attempt, "Retrying transient store error…");
                last = Some(error);
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
            }
            Err(error) => return Err(Error::Internal(error)),
        }
    }
    // All attempts exhausted on a transient error.
    match last {
        Some(error) => Err(Error::Transient(error)),
        None => Err(Error::Configuration("retry budget of zero".into())),
    }
}
