#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod claim;
/// Time injection for deterministic tests.
pub mod clock;
mod config;
mod context;
mod dispatcher;
mod errors;
mod jobs;
mod metrics;
mod outbox;
mod reaper;
mod retry;
/// Database schema definitions.
pub mod schema;
mod store;
mod worker;

pub use self::claim::{ClaimRequest, LeasedJob, claim};
pub use self::config::Config;
pub use self::context::CoreContext;
pub use self::dispatcher::{Dispatcher, RunHandle};
pub use self::errors::{Error, Result};
pub use self::jobs::{NewJob, SubmitReceipt, TenantSpec, cancel, get, redrive, submit, upsert_tenant};
pub use self::metrics::Metrics;
pub use self::outbox::{DrainStats, EventSink, TracingSink, drain_once};
pub use self::reaper::{ReapStats, reap_once};
pub use self::retry::RetryPolicy;
pub use self::worker::{FailOutcome, complete, fail, heartbeat};

/// Embedded schema migrations.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Creates or upgrades the orchestrator tables on the given database.
pub async fn setup_database(pool: &sqlx::PgPool) -> std::result::Result<(), sqlx::Error> {
    MIGRATOR.run(pool).await.map_err(sqlx::Error::from)
}
