//! The lease claim engine.
//!
//! A claim picks a tenant by weighted sampling among tenants with eligible
//! work, row-locks that tenant's best pending job with `SKIP LOCKED`, and
//! promotes it to `leased` in the same transaction as the `leased` outbox
//! event. Concurrent pollers select disjoint candidates; a contended
//! candidate makes the call come back empty for this cycle rather than
//! block.

use crate::context::CoreContext;
use crate::errors::{Result, with_transient_retry};
use crate::schema::{EventKind, Job};
use crate::store;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Parameters of a claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identity of the polling worker, recorded on the lease.
    pub worker_id: String,
    /// Restricts the claim to these tenants. `None` means all.
    pub tenant_scope: Option<Vec<String>>,
    /// Restricts the claim to these queues. `None` means all.
    pub queues: Option<Vec<String>>,
    /// Overrides the configured lease duration for this claim.
    pub lease_duration: Option<Duration>,
}

impl ClaimRequest {
    /// A claim over all tenants and queues with the configured lease
    /// duration.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            tenant_scope: None,
            queues: None,
            lease_duration: None,
        }
    }

    /// Restricts the claim to the given tenants.
    pub fn tenant_scope(mut self, tenants: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tenant_scope = Some(tenants.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the claim to the given queues.
    pub fn queues(mut self, queues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    /// Overrides the lease duration.
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }
}

/// A successfully claimed job.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The promoted job row.
    pub job: Job,
    /// Token the worker must present on heartbeat, complete, and fail.
    pub lease_token: Uuid,
    /// Instant the lease lapses unless extended.
    pub lease_expires_at: DateTime<Utc>,
    /// Hard deadline after which the lease can no longer be extended.
    pub execution_deadline: DateTime<Utc>,
}

/// Picks an index into `weights` proportionally to the weights.
///
/// Zero or negative weights are treated as 1 so a misconfigured tenant
/// still makes progress.
pub(crate) fn pick_weighted(rng: &mut impl Rng, weights: &[i32]) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: i64 = weights.iter().map(|w| i64::from((*w).max(1))).sum();
    let mut roll = rng.gen_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        roll -= i64::from((*weight).max(1));
        if roll < 0 {
            return Some(index);
        }
    }
    None
}

/// Attempts to claim one job for `request.worker_id`.
///
/// Returns `Ok(None)` when no tenant has eligible work or the selected
/// candidate was concurrently taken. Never returns more than one job.
#[instrument(name = "foreman.claim", skip(ctx, request), fields(worker_id = %request.worker_id))]
pub async fn claim(ctx: &CoreContext, request: ClaimRequest) -> Result<Option<LeasedJob>> {
    let started = std::time::Instant::now();
    let now = ctx.now();

    let tenants = with_transient_retry(|| {
        let pool = ctx.pool.clone();
        let scope = request.tenant_scope.clone();
        let queues = request.queues.clone();
        async move {
            store::eligible_tenants(&pool, now, scope.as_deref(), queues.as_deref()).await
        }
    })
    .await?;
    if tenants.is_empty() {
        return Ok(None);
    }

    let weights: Vec<i32> = tenants.iter().map(|(_, w)| *w).collect();
    let Some(index) = ctx.with_rng(|rng| pick_weighted(rng, &weights)) else {
        return Ok(None);
    };
    let tenant_id = &tenants[index].0;

    let lease_duration = request.lease_duration.unwrap_or(ctx.config.lease_duration);
    let lease_expires_at = now
        + chrono::Duration::from_std(lease_duration)
            .map_err(|e| crate::errors::Error::BadRequest(format!("lease duration: {e}")))?;
    let execution_deadline = now
        + chrono::Duration::from_std(ctx.config.execution_timeout)
            .unwrap_or(chrono::Duration::seconds(300));

    let mut tx = ctx.pool.begin().await?;
    let Some(candidate) =
        store::lock_candidate(&mut tx, tenant_id, request.queues.as_deref(), now).await?
    else {
        // The tenant's best row was taken between sampling and locking.
        tx.rollback().await?;
        debug!(%tenant_id, "Candidate contended, returning empty for this cycle");
        return Ok(None);
    };

    let lease_token = Uuid::new_v4();
    let job = store::promote_to_leased(
        &mut tx,
        candidate.job_id,
        lease_token,
        &request.worker_id,
        lease_expires_at,
        execution_deadline,
        now,
    )
    .await?;
    store::append_event(
        &mut tx,
        job.job_id,
        EventKind::Leased,
        &store::event_body(&job, None),
        now,
    )
    .await?;
    tx.commit().await?;

    let start_delay = (now - candidate.available_at).num_milliseconds() as f64 / 1000.0;
    ctx.metrics
        .record_claim(&job.tenant_id, started.elapsed().as_secs_f64(), start_delay);
    debug!(job_id = %job.job_id, %tenant_id, "Job leased");

    Ok(Some(LeasedJob {
        lease_token,
        lease_expires_at,
        execution_deadline: job.execution_deadline.unwrap_or(execution_deadline),
        job,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn empty_weights_pick_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pick_weighted(&mut rng, &[]), None);
    }

    #[test]
    fn single_tenant_always_picked() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(pick_weighted(&mut rng, &[5]), Some(0));
        }
    }

    #[test]
    fn ratio_tracks_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let weights = [3, 1];
        let mut counts = [0u32; 2];
        let draws = 40_000;
        for _ in 0..draws {
            let index = pick_weighted(&mut rng, &weights).unwrap();
            counts[index] += 1;
        }
        let share = f64::from(counts[0]) / f64::from(draws);
        // 3:1 weights put the first tenant at 75% of draws.
        assert!((share - 0.75).abs() < 0.02, "share was {share}");
    }

    #[test]
    fn non_positive_weights_still_progress() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = [false; 3];
        for _ in 0..1000 {
            let index = pick_weighted(&mut rng, &[0, -2, 1]).unwrap();
            seen[index] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }
}
