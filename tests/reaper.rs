#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use chrono::{TimeZone, Utc};
use claims::{assert_none, assert_some};
use foreman::clock::FixedClock;
use foreman::schema::JobState;
use foreman::{ClaimRequest, Config, CoreContext, NewJob, TenantSpec};
use insta::assert_compact_json_snapshot;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        foreman::setup_database(&pool).await?;

        Ok((pool, container))
    }

    pub(super) fn pinned_clock() -> Arc<FixedClock> {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Arc::new(FixedClock::new(start))
    }

    pub(super) fn create_context(
        pool: PgPool,
        clock: Arc<FixedClock>,
        config: Config,
    ) -> anyhow::Result<CoreContext> {
        Ok(CoreContext::with_clock(pool, config, clock)?.with_rng_seed(42))
    }

    pub(super) async fn event_kinds(pool: &PgPool, job_id: Uuid) -> anyhow::Result<Vec<String>> {
        let kinds = sqlx::query_scalar::<_, String>(
            "SELECT kind FROM outbox_events WHERE aggregate_id = $1 ORDER BY sequence",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await?;
        Ok(kinds)
    }
}

#[tokio::test]
async fn expired_lease_is_requeued_and_recovered() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let mut config = Config::default();
    config.retry.base = Duration::from_millis(100);
    let ctx = test_utils::create_context(pool.clone(), clock.clone(), config)?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    let receipt = foreman::submit(&ctx, NewJob::new("acme", json!({}))).await?;

    // Worker one claims with a short lease and then goes silent.
    let crashed = assert_some!(
        foreman::claim(
            &ctx,
            ClaimRequest::new("w1").lease_duration(Duration::from_secs(2)),
        )
        .await?
    );

    // Nothing to reap while the lease is live.
    let stats = foreman::reap_once(&ctx).await?;
    assert_eq!(stats.requeued, 0);

    clock.advance(chrono::Duration::seconds(3));
    let stats = foreman::reap_once(&ctx).await?;
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.dead_lettered, 0);

    let job = foreman::get(&ctx, receipt.job.job_id).await?;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("lease expired"));

    // The crashed worker's token is dead.
    let stale = foreman::heartbeat(&ctx, receipt.job.job_id, crashed.lease_token).await;
    claims::assert_err!(stale);

    // A second worker picks the job up after the backoff and finishes it.
    clock.advance(chrono::Duration::seconds(1));
    let leased = assert_some!(foreman::claim(&ctx, ClaimRequest::new("w2")).await?);
    foreman::complete(&ctx, leased.job.job_id, leased.lease_token, json!("ok"), "k1").await?;

    let job = foreman::get(&ctx, receipt.job.job_id).await?;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 1);

    let kinds = test_utils::event_kinds(&pool, job.job_id).await?;
    assert_compact_json_snapshot!(kinds, @r#"["created", "leased", "failed_retry", "leased", "succeeded"]"#);

    Ok(())
}

#[tokio::test]
async fn expiry_dead_letters_once_attempts_are_spent() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let mut config = Config::default();
    config.retry.base = Duration::from_millis(100);
    let ctx = test_utils::create_context(pool, clock.clone(), config)?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    let receipt = foreman::submit(&ctx, NewJob::new("acme", json!({})).max_attempts(1)).await?;

    assert_some!(
        foreman::claim(
            &ctx,
            ClaimRequest::new("w1").lease_duration(Duration::from_secs(2)),
        )
        .await?
    );
    clock.advance(chrono::Duration::seconds(3));

    let stats = foreman::reap_once(&ctx).await?;
    assert_eq!(stats.dead_lettered, 1);

    let job = foreman::get(&ctx, receipt.job.job_id).await?;
    assert_eq!(job.state, JobState::Dlq);
    assert_eq!(job.attempts, 1);

    Ok(())
}

#[tokio::test]
async fn expiry_policy_can_spare_the_attempt_budget() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let config = Config {
        expiry_counts_as_attempt: false,
        ..Config::default()
    };
    let ctx = test_utils::create_context(pool, clock.clone(), config)?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    let receipt = foreman::submit(&ctx, NewJob::new("acme", json!({})).max_attempts(1)).await?;

    assert_some!(
        foreman::claim(
            &ctx,
            ClaimRequest::new("w1").lease_duration(Duration::from_secs(2)),
        )
        .await?
    );
    clock.advance(chrono::Duration::seconds(3));

    // Even with a budget of one, the expiry requeues instead of
    // dead-lettering because it does not consume an attempt.
    let stats = foreman::reap_once(&ctx).await?;
    assert_eq!(stats.requeued, 1);

    let job = foreman::get(&ctx, receipt.job.job_id).await?;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);

    Ok(())
}

#[tokio::test]
async fn execution_timeout_is_reaped_even_with_heartbeats() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let config = Config {
        execution_timeout: Duration::from_secs(60),
        expiry_counts_as_attempt: false,
        ..Config::default()
    };
    let ctx = test_utils::create_context(pool, clock.clone(), config)?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    let receipt = foreman::submit(&ctx, NewJob::new("acme", json!({})).max_attempts(1)).await?;
    let leased = assert_some!(foreman::claim(&ctx, ClaimRequest::new("w1")).await?);

    // The worker heartbeats diligently but the job overruns its deadline.
    clock.advance(chrono::Duration::seconds(25));
    foreman::heartbeat(&ctx, leased.job.job_id, leased.lease_token).await?;
    clock.advance(chrono::Duration::seconds(25));
    foreman::heartbeat(&ctx, leased.job.job_id, leased.lease_token).await?;
    clock.advance(chrono::Duration::seconds(15));

    let stats = foreman::reap_once(&ctx).await?;
    // A deadline overrun always consumes the attempt, so the single-attempt
    // job dead-letters.
    assert_eq!(stats.dead_lettered, 1);

    let job = foreman::get(&ctx, receipt.job.job_id).await?;
    assert_eq!(job.state, JobState::Dlq);
    assert_eq!(
        job.last_error.as_deref(),
        Some("execution deadline exceeded")
    );

    Ok(())
}

#[tokio::test]
async fn reaper_replicas_do_not_double_count() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let ctx = test_utils::create_context(pool, clock.clone(), Config::default())?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    for n in 0..8 {
        foreman::submit(&ctx, NewJob::new("acme", json!({"n": n}))).await?;
    }
    for n in 0..8 {
        assert_some!(
            foreman::claim(
                &ctx,
                ClaimRequest::new(format!("w{n}")).lease_duration(Duration::from_secs(1)),
            )
            .await?
        );
    }
    clock.advance(chrono::Duration::seconds(2));

    // Two replicas race over the same batch; every lease is reclaimed
    // exactly once.
    let (a, b) = tokio::join!(foreman::reap_once(&ctx), foreman::reap_once(&ctx));
    let (a, b) = (a?, b?);
    assert_eq!(a.requeued + b.requeued, 8);

    // A third pass finds nothing.
    let rest = foreman::reap_once(&ctx).await?;
    assert_eq!(rest.requeued + rest.dead_lettered, 0);

    Ok(())
}

#[tokio::test]
async fn reaped_jobs_wait_out_their_backoff() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let ctx = test_utils::create_context(pool, clock.clone(), Config::default())?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    foreman::submit(&ctx, NewJob::new("acme", json!({}))).await?;
    assert_some!(
        foreman::claim(
            &ctx,
            ClaimRequest::new("w1").lease_duration(Duration::from_secs(1)),
        )
        .await?
    );

    clock.advance(chrono::Duration::seconds(2));
    foreman::reap_once(&ctx).await?;

    // Requeued with backoff: not immediately claimable.
    assert_none!(foreman::claim(&ctx, ClaimRequest::new("w2")).await?);

    // Backoff for the first attempt is base (1s) plus up to 10% jitter.
    clock.advance(chrono::Duration::seconds(2));
    assert_some!(foreman::claim(&ctx, ClaimRequest::new("w2")).await?);

    Ok(())
}
