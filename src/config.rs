//! Orchestrator configuration.
//!
//! A [`Config`] is validated once when the [`CoreContext`](crate::CoreContext)
//! is built and is immutable afterwards.

use crate::errors::{Error, Result};
use crate::retry::RetryPolicy;
use std::time::Duration;

/// Tunables for leasing, recovery, retry, and the background loops.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// How long a claim holds a job before the reaper may reclaim it.
    pub lease_duration: Duration,
    /// Cadence workers are expected to heartbeat at. Informational; returned
    /// to workers at the API boundary.
    pub heartbeat_interval: Duration,
    /// Hard wall-clock budget for a job across all its attempts.
    pub execution_timeout: Duration,
    /// Cadence of the reaper scan.
    pub reap_interval: Duration,
    /// Maximum leased rows disposed per reaper pass.
    pub reap_batch: i64,
    /// Claim attempts per dispatcher tick in internal dispatch mode.
    pub claim_batch: usize,
    /// Maximum outbox events drained per publisher pass.
    pub outbox_batch: i64,
    /// How long a publisher replica holds an outbox event while delivering.
    pub publish_lease: Duration,
    /// Idle pause of the publisher loop when the outbox is empty.
    pub publish_interval: Duration,
    /// Backoff applied to failed jobs and failed event deliveries.
    pub retry: RetryPolicy,
    /// Whether a reaped (expired or timed-out) lease consumes an attempt.
    pub expiry_counts_as_attempt: bool,
    /// Whether lease extensions append `heartbeat` outbox events. Off by
    /// default to avoid outbox amplification.
    pub heartbeat_events: bool,
    /// Admission control: reject submissions once a tenant has this many
    /// jobs pending. `None` disables the check.
    pub max_pending_per_tenant: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(5),
            reap_batch: 256,
            claim_batch: 32,
            outbox_batch: 128,
            publish_lease: Duration::from_secs(30),
            publish_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            expiry_counts_as_attempt: true,
            heartbeat_events: false,
            max_pending_per_tenant: None,
        }
    }
}

impl Config {
    /// Checks internal consistency. Called by
    /// [`CoreContext::new`](crate::CoreContext::new).
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            return Err(Error::Configuration("lease_duration must be positive".into()));
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(Error::Configuration(
                "heartbeat_interval must be shorter than lease_duration".into(),
            ));
        }
        if self.execution_timeout < self.lease_duration {
            return Err(Error::Configuration(
                "execution_timeout must be at least lease_duration".into(),
            ));
        }
        if self.reap_batch <= 0 || self.outbox_batch <= 0 {
            return Err(Error::Configuration("batch sizes must be positive".into()));
        }
        if self.retry.base.is_zero() {
            return Err(Error::Configuration("retry base must be positive".into()));
        }
        if self.retry.cap < self.retry.base {
            return Err(Error::Configuration(
                "retry cap must be at least the base delay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(Error::Configuration(
                "retry jitter_ratio must be within [0, 1]".into(),
            ));
        }
        if let Some(cap) = self.max_pending_per_tenant
            && cap <= 0
        {
            return Err(Error::Configuration(
                "max_pending_per_tenant must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn default_config_is_valid() {
        assert_ok!(Config::default().validate());
    }

    #[test]
    fn heartbeat_must_fit_inside_lease() {
        let config = Config {
            heartbeat_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(30),
            ..Config::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn execution_timeout_shorter_than_lease_is_rejected() {
        let config = Config {
            execution_timeout: Duration::from_secs(10),
            ..Config::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn jitter_ratio_out_of_range_is_rejected() {
        let mut config = Config::default();
        config.retry.jitter_ratio = 1.5;
        assert_err!(config.validate());
    }
}
