//! Shared handle passed to every operation.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::Result;
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};

/// Everything an operation needs: the connection pool, a clock, a seedable
/// RNG, metric instruments, and the validated configuration.
///
/// There is no other global state; operations are free functions taking
/// `&CoreContext`.
#[derive(Debug, Clone)]
pub struct CoreContext {
    pub(crate) pool: PgPool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rng: Arc<Mutex<StdRng>>,
    pub(crate) metrics: Metrics,
    pub(crate) config: Config,
}

impl CoreContext {
    /// Builds a context with the system clock and an entropy-seeded RNG.
    ///
    /// Validates `config` once; the context is immutable afterwards.
    pub fn new(pool: PgPool, config: Config) -> Result<Self> {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    /// Builds a context with an injected clock. Used by tests to pin time.
    pub fn with_clock(pool: PgPool, config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new()
            .map_err(|e| crate::errors::Error::Configuration(format!("metrics: {e}")))?;
        Ok(Self {
            pool,
            clock,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            metrics,
            config,
        })
    }

    /// Replaces the RNG with a deterministically seeded one. Jitter and
    /// tenant sampling become reproducible; used by tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// The connection pool backing all operations.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The metric instruments, including the scrape registry.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current instant from the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs `f` with exclusive access to the context RNG.
    pub(crate) fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }
}
