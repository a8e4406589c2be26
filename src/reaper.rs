//! Lease and execution-timeout recovery.
//!
//! The reaper reclaims jobs whose worker stopped heartbeating or ran past
//! its execution deadline. It reuses the failure routing of
//! [`crate::worker::fail`], so a reclaimed job either requeues with backoff
//! or dead-letters once its attempts are spent.

use crate::context::CoreContext;
use crate::errors::Result;
use crate::store;
use crate::worker::{FailOutcome, route_failure};
use tracing::{debug, warn};
use uuid::Uuid;

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Jobs requeued `pending`.
    pub requeued: usize,
    /// Jobs routed to the DLQ.
    pub dead_lettered: usize,
    /// Candidates skipped because another replica held the row or the lease
    /// was salvaged (heartbeat landed) before we locked it.
    pub skipped: usize,
}

/// Runs one reaper pass over at most `reap_batch` expired leases.
///
/// Each candidate is re-checked and disposed in its own short transaction,
/// with `SKIP LOCKED` resolving contention, so the pass is safe to run on
/// any number of replicas concurrently and never holds a lock across the
/// whole batch. Per-item failures are isolated: they are logged, counted,
/// and do not abort the pass.
pub async fn reap_once(ctx: &CoreContext) -> Result<ReapStats> {
    let now = ctx.now();
    let candidates = store::expired_lease_ids(&ctx.pool, now, ctx.config.reap_batch).await?;
    if candidates.is_empty() {
        return Ok(ReapStats::default());
    }

    let mut stats = ReapStats::default();
    for job_id in candidates {
        match reap_one(ctx, job_id).await {
            Ok(Some(FailOutcome::Retried { .. })) => stats.requeued += 1,
            Ok(Some(FailOutcome::DeadLettered { .. })) => stats.dead_lettered += 1,
            Ok(None) => stats.skipped += 1,
            Err(error) => {
                warn!(%job_id, %error, "Failed to reap job");
                ctx.metrics.record_loop_error("reaper");
                stats.skipped += 1;
            }
        }
    }

    debug!(
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        skipped = stats.skipped,
        "Reaper pass finished"
    );
    Ok(stats)
}

/// Disposes a single expired lease in its own transaction.
async fn reap_one(ctx: &CoreContext, job_id: Uuid) -> Result<Option<FailOutcome>> {
    // Re-read the clock per item; a long batch must not reap leases that
    // were still live when the scan started.
    let now = ctx.now();
    let mut tx = ctx.pool.begin().await?;

    let Some(job) = store::lock_expired_job(&mut tx, job_id, now).await? else {
        tx.rollback().await?;
        return Ok(None);
    };

    let past_deadline = job.execution_deadline.is_some_and(|deadline| deadline <= now);
    let reason = if past_deadline {
        "execution deadline exceeded"
    } else {
        "lease expired"
    };

    // A deadline overrun always consumes an attempt; otherwise a job whose
    // deadline already passed would requeue forever.
    let count_attempt = ctx.config.expiry_counts_as_attempt || past_deadline;
    let outcome = route_failure(ctx, &mut tx, &job, reason, true, count_attempt, now).await?;
    tx.commit().await?;

    ctx.metrics.record_reaped(if past_deadline {
        "execution_timeout"
    } else {
        "lease_expired"
    });
    debug!(%job_id, reason, "Reaped expired lease");
    Ok(Some(outcome))
}
