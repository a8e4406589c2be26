//! Outbox publisher: ordered, at-least-once drain of pending events.
//!
//! Events are written by the lifecycle operations inside the transaction
//! that changes job state; the publisher only ever moves them from "pending"
//! to "delivered". Delivery uses the same visibility-timeout shape as job
//! leases: a batch is publish-locked, handed to the sink, and either marked
//! delivered or released with backoff.

use crate::context::CoreContext;
use crate::errors::Result;
use crate::schema::OutboxEvent;
use crate::store;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Downstream destination for outbox events.
///
/// Implementations must tolerate redelivery: the drain is at-least-once,
/// and a crash between sink I/O and the `delivered_at` stamp replays the
/// event after the publish lease lapses.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event. An error reschedules the event with backoff.
    async fn publish(&self, event: &OutboxEvent) -> anyhow::Result<()>;
}

/// Sink that logs each event. Stands in for a real bus in development.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, event: &OutboxEvent) -> anyhow::Result<()> {
        info!(
            event_id = event.event_id,
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence,
            kind = event.kind.as_str(),
            "OUTBOX PUBLISH"
        );
        Ok(())
    }
}

/// What one publisher pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Events handed to the sink and marked delivered.
    pub published: usize,
    /// Events whose delivery failed and was rescheduled.
    pub failed: usize,
}

/// Drains up to `outbox_batch` deliverable events to `sink`.
///
/// A first transaction publish-locks the batch; sink I/O happens outside
/// any transaction; each event is then individually marked delivered or
/// released with backoff. Per-aggregate ordering holds because the scan
/// only ever selects the smallest undelivered sequence of each aggregate,
/// so a failed event blocks its successors (and only its successors).
pub async fn drain_once(ctx: &CoreContext, sink: &dyn EventSink) -> Result<DrainStats> {
    let now = ctx.now();
    let publish_lease = chrono::Duration::from_std(ctx.config.publish_lease)
        .unwrap_or(chrono::Duration::seconds(30));

    let mut tx = ctx.pool.begin().await?;
    let events = store::lock_publishable_events(&mut tx, now, ctx.config.outbox_batch).await?;
    if events.is_empty() {
        tx.rollback().await?;
        return Ok(DrainStats::default());
    }
    let event_ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
    store::lock_events_until(&mut tx, &event_ids, now + publish_lease).await?;
    tx.commit().await?;

    let mut stats = DrainStats::default();
    for event in &events {
        match sink.publish(event).await {
            Ok(()) => {
                store::mark_event_delivered(&ctx.pool, event.event_id, ctx.now()).await?;
                stats.published += 1;
            }
            Err(error) => {
                warn!(
                    event_id = event.event_id,
                    aggregate_id = %event.aggregate_id,
                    %error,
                    "Failed to publish outbox event"
                );
                let attempts = event.attempts + 1;
                let next_visible = ctx.with_rng(|rng| {
                    ctx.config.retry.next_available_at(ctx.now(), attempts, rng)
                });
                store::mark_event_delivery_failed(&ctx.pool, event.event_id, attempts, next_visible)
                    .await?;
                ctx.metrics.record_publish_failure();
                stats.failed += 1;
            }
        }
    }

    ctx.metrics.record_published(stats.published as u64);
    debug!(
        published = stats.published,
        failed = stats.failed,
        "Outbox drain finished"
    );
    Ok(stats)
}
