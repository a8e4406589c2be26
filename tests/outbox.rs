#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use claims::assert_some;
use foreman::clock::FixedClock;
use foreman::schema::OutboxEvent;
use foreman::{ClaimRequest, Config, CoreContext, EventSink, NewJob, TenantSpec, TracingSink};
use serde_json::json;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
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

    /// Drive a full job lifecycle so the outbox holds a known event chain.
    pub(super) async fn run_job_to_success(
        ctx: &CoreContext,
        clock: &FixedClock,
    ) -> anyhow::Result<Uuid> {
        let receipt = foreman::submit(ctx, NewJob::new("acme", json!({}))).await?;
        let leased = assert_some!(foreman::claim(ctx, ClaimRequest::new("w1")).await?);
        foreman::fail(ctx, leased.job.job_id, leased.lease_token, "first try", true).await?;
        clock.advance(chrono::Duration::seconds(2));
        let leased = assert_some!(foreman::claim(ctx, ClaimRequest::new("w1")).await?);
        foreman::complete(ctx, leased.job.job_id, leased.lease_token, json!("ok"), "k1").await?;
        Ok(receipt.job.job_id)
    }
}

/// Records every delivery in arrival order.
#[derive(Debug, Clone, Default)]
struct RecordingSink {
    seen: Arc<Mutex<Vec<(Uuid, i64, String)>>>,
}

impl RecordingSink {
    fn deliveries(&self) -> Vec<(Uuid, i64, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &OutboxEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((
            event.aggregate_id,
            event.sequence,
            event.kind.as_str().to_owned(),
        ));
        Ok(())
    }
}

/// Fails the first `failures` deliveries, then succeeds.
#[derive(Debug, Default)]
struct FlakySink {
    failures: AtomicU32,
    inner: RecordingSink,
}

#[async_trait]
impl EventSink for FlakySink {
    async fn publish(&self, event: &OutboxEvent) -> anyhow::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("sink unavailable");
        }
        self.inner.publish(event).await
    }
}

/// Drains until a pass delivers nothing, with a safety bound.
async fn drain_fully(ctx: &CoreContext, sink: &dyn EventSink) -> anyhow::Result<u32> {
    let mut published = 0;
    for _ in 0..64 {
        let stats = foreman::drain_once(ctx, sink).await?;
        if stats.published == 0 && stats.failed == 0 {
            return Ok(published);
        }
        published += stats.published as u32;
    }
    Ok(published)
}

#[tokio::test]
async fn events_deliver_in_per_job_sequence_order() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let mut config = Config::default();
    config.retry.base = Duration::from_millis(100);
    let ctx = test_utils::create_context(pool, clock.clone(), config)?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    let job_id = test_utils::run_job_to_success(&ctx, &clock).await?;

    let sink = RecordingSink::default();
    let published = drain_fully(&ctx, &sink).await?;
    assert_eq!(published, 5);

    let deliveries: Vec<(i64, String)> = sink
        .deliveries()
        .into_iter()
        .filter(|(aggregate, _, _)| *aggregate == job_id)
        .map(|(_, sequence, kind)| (sequence, kind))
        .collect();
    assert_eq!(
        deliveries,
        vec![
            (1, "created".to_owned()),
            (2, "leased".to_owned()),
            (3, "failed_retry".to_owned()),
            (4, "leased".to_owned()),
            (5, "succeeded".to_owned()),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn a_failed_delivery_blocks_only_its_aggregate() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let ctx = test_utils::create_context(pool, clock.clone(), Config::default())?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    let first = foreman::submit(&ctx, NewJob::new("acme", json!({"n": 1}))).await?;
    let second = foreman::submit(&ctx, NewJob::new("acme", json!({"n": 2}))).await?;

    // One of the two `created` deliveries fails; the other goes through.
    let sink = FlakySink {
        failures: AtomicU32::new(1),
        ..FlakySink::default()
    };
    let stats = foreman::drain_once(&ctx, &sink).await?;
    assert_eq!((stats.published, stats.failed), (1, 1));

    let seen = sink.inner.deliveries();
    assert_eq!(seen.len(), 1);
    let held = if seen[0].0 == first.job.job_id {
        second.job.job_id
    } else {
        first.job.job_id
    };

    // The failed event sits out its backoff.
    let stats = foreman::drain_once(&ctx, &sink).await?;
    assert_eq!(stats.published, 0);

    clock.advance(chrono::Duration::seconds(5));
    drain_fully(&ctx, &sink).await?;
    let seen = sink.inner.deliveries();
    assert!(seen.iter().any(|(aggregate, _, _)| *aggregate == held));
    assert_eq!(seen.len(), 2);

    Ok(())
}

#[tokio::test]
async fn delivered_events_are_not_republished() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let ctx = test_utils::create_context(pool.clone(), clock.clone(), Config::default())?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    test_utils::run_job_to_success(&ctx, &clock).await?;

    let sink = RecordingSink::default();
    drain_fully(&ctx, &sink).await?;
    let first_round = sink.deliveries().len();

    // Draining again finds nothing new.
    drain_fully(&ctx, &sink).await?;
    assert_eq!(sink.deliveries().len(), first_round);

    let undelivered = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM outbox_events WHERE delivered_at IS NULL",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(undelivered, 0);

    Ok(())
}

#[tokio::test]
async fn publish_lock_hides_events_from_other_replicas() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let ctx = test_utils::create_context(pool.clone(), clock.clone(), Config::default())?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    foreman::submit(&ctx, NewJob::new("acme", json!({}))).await?;

    // Another replica holds the publish lock on everything.
    let hold_until = ctx.now() + chrono::Duration::seconds(60);
    sqlx::query("UPDATE outbox_events SET locked_until = $1")
        .bind(hold_until)
        .execute(&pool)
        .await?;

    let sink = RecordingSink::default();
    let stats = foreman::drain_once(&ctx, &sink).await?;
    assert_eq!(stats.published, 0);

    // The lock lapses with time and the event becomes deliverable again.
    clock.advance(chrono::Duration::seconds(61));
    let stats = foreman::drain_once(&ctx, &sink).await?;
    assert_eq!(stats.published, 1);

    Ok(())
}

#[tokio::test]
async fn tracing_sink_accepts_events() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = test_utils::pinned_clock();
    let ctx = test_utils::create_context(pool, clock, Config::default())?;

    foreman::upsert_tenant(&ctx, TenantSpec::new("acme")).await?;
    foreman::submit(&ctx, NewJob::new("acme", json!({}))).await?;

    let stats = foreman::drain_once(&ctx, &TracingSink).await?;
    assert_eq!(stats.published, 1);

    Ok(())
}
