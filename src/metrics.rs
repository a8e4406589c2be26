//! Prometheus instruments for the orchestrator core.
//!
//! The crate owns a [`prometheus::Registry`] and pre-defined instruments;
//! serving the scrape endpoint is the embedding process's concern via
//! [`Metrics::registry`].

use prometheus::{
    Counter, CounterVec, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
};
use std::sync::Arc;

/// Buckets for claim latency (seconds).
const CLAIM_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Buckets for the delay between a job becoming available and being claimed.
const START_DELAY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

/// Buckets for the age of live leases observed by the gauge loop.
const LEASE_AGE_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0];

/// Metrics handle containing all instruments. Cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    claims: CounterVec,
    completions: CounterVec,
    reaped: CounterVec,
    redriven: Counter,
    outbox_published: Counter,
    outbox_publish_failures: Counter,
    loop_errors: CounterVec,

    queue_depth: GaugeVec,

    claim_latency: Histogram,
    start_delay: Histogram,
    lease_age: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates the instruments and registers them on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let claims = CounterVec::new(
            Opts::new("foreman_claims_total", "Jobs claimed, by tenant"),
            &["tenant_id"],
        )?;
        let completions = CounterVec::new(
            Opts::new(
                "foreman_completions_total",
                "Jobs finished, by tenant and outcome",
            ),
            &["tenant_id", "outcome"],
        )?;
        let reaped = CounterVec::new(
            Opts::new(
                "foreman_reaped_total",
                "Leases reclaimed by the reaper, by reason",
            ),
            &["reason"],
        )?;
        let redriven = Counter::with_opts(Opts::new(
            "foreman_redriven_total",
            "DLQ jobs moved back to pending",
        ))?;
        let outbox_published = Counter::with_opts(Opts::new(
            "foreman_outbox_published_total",
            "Outbox events delivered to the sink",
        ))?;
        let outbox_publish_failures = Counter::with_opts(Opts::new(
            "foreman_outbox_publish_failures_total",
            "Outbox delivery attempts that failed",
        ))?;
        let loop_errors = CounterVec::new(
            Opts::new(
                "foreman_loop_errors_total",
                "Errors isolated inside background loops",
            ),
            &["task"],
        )?;
        let queue_depth = GaugeVec::new(
            Opts::new("foreman_queue_depth", "Jobs per state"),
            &["state"],
        )?;
        let claim_latency = Histogram::with_opts(
            HistogramOpts::new(
                "foreman_claim_latency_seconds",
                "Wall time of a claim round trip",
            )
            .buckets(CLAIM_LATENCY_BUCKETS.to_vec()),
        )?;
        let start_delay = Histogram::with_opts(
            HistogramOpts::new(
                "foreman_start_delay_seconds",
                "Time from available_at to claim",
            )
            .buckets(START_DELAY_BUCKETS.to_vec()),
        )?;
        let lease_age = Histogram::with_opts(
            HistogramOpts::new("foreman_lease_age_seconds", "Age of live leases")
                .buckets(LEASE_AGE_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(claims.clone()))?;
        registry.register(Box::new(completions.clone()))?;
        registry.register(Box::new(reaped.clone()))?;
        registry.register(Box::new(redriven.clone()))?;
        registry.register(Box::new(outbox_published.clone()))?;
        registry.register(Box::new(outbox_publish_failures.clone()))?;
        registry.register(Box::new(loop_errors.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(claim_latency.clone()))?;
        registry.register(Box::new(start_delay.clone()))?;
        registry.register(Box::new(lease_age.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            claims,
            completions,
            reaped,
            redriven,
            outbox_published,
            outbox_publish_failures,
            loop_errors,
            queue_depth,
            claim_latency,
            start_delay,
            lease_age,
        })
    }

    /// The registry backing the `/metrics` scrape surface.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn record_claim(&self, tenant_id: &str, latency_secs: f64, start_delay_secs: f64) {
        self.claims.with_label_values(&[tenant_id]).inc();
        self.claim_latency.observe(latency_secs);
        if start_delay_secs > 0.0 {
            self.start_delay.observe(start_delay_secs);
        }
    }

    pub(crate) fn record_completion(&self, tenant_id: &str, outcome: &str) {
        self.completions
            .with_label_values(&[tenant_id, outcome])
            .inc();
    }

    pub(crate) fn record_reaped(&self, reason: &str) {
        self.reaped.with_label_values(&[reason]).inc();
    }

    pub(crate) fn record_redrive(&self) {
        self.redriven.inc();
    }

    pub(crate) fn record_published(&self, count: u64) {
        self.outbox_published.inc_by(count as f64);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.outbox_publish_failures.inc();
    }

    pub(crate) fn record_loop_error(&self, task: &str) {
        self.loop_errors.with_label_values(&[task]).inc();
    }

    pub(crate) fn set_queue_depth(&self, state: &str, depth: i64) {
        self.queue_depth
            .with_label_values(&[state])
            .set(depth as f64);
    }

    pub(crate) fn observe_lease_age(&self, age_secs: f64) {
        self.lease_age.observe(age_secs);
    }
}
