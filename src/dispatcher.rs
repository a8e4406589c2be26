//! The supervising loop: reaper cadence, outbox drain, metric gauges, and
//! optional internal claim dispatch.

use crate::claim::{ClaimRequest, LeasedJob, claim};
use crate::context::CoreContext;
use crate::outbox::EventSink;
use crate::reaper::reap_once;
use crate::schema::JobState;
use crate::store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use futures_util::future::join_all;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, error, info, info_span, warn};

/// Refresh cadence of the queue-depth and lease-age gauges.
const GAUGE_REFRESH: Duration = Duration::from_secs(10);

/// Poll cadence of the internal claim loop when no work was found.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the graceful drain; tasks still running afterwards are
/// aborted.
const DRAIN_WINDOW: Duration = Duration::from_secs(10);

/// How leased work leaves the dispatcher.
#[derive(Debug)]
enum DispatchMode {
    /// Workers poll [`claim`](crate::claim::claim) themselves (e.g. through
    /// an API tier); the dispatcher only runs maintenance loops.
    External,
    /// The dispatcher claims on behalf of `slots` in-process worker slots
    /// and hands leased jobs to a channel.
    Internal {
        slots: usize,
        jobs: mpsc::Sender<LeasedJob>,
    },
}

/// Supervises the background loops of one orchestrator process.
#[derive(Debug)]
pub struct Dispatcher {
    ctx: CoreContext,
    mode: DispatchMode,
}

impl Dispatcher {
    /// A dispatcher for externally polled workers: runs the reaper, the
    /// outbox publisher, and the gauge refresher.
    pub fn new(ctx: CoreContext) -> Self {
        Self {
            ctx,
            mode: DispatchMode::External,
        }
    }

    /// A dispatcher that additionally claims for `slots` in-process worker
    /// slots per tick. Leased jobs arrive on the returned receiver;
    /// heartbeating and completing them stays with the consumer.
    pub fn internal(ctx: CoreContext, slots: usize) -> (Self, mpsc::Receiver<LeasedJob>) {
        let (jobs, rx) = mpsc::channel(slots.max(1));
        (
            Self {
                ctx,
                mode: DispatchMode::Internal { slots, jobs },
            },
            rx,
        )
    }

    /// Starts the background tasks and returns a handle controlling them.
    pub fn start(self, sink: impl EventSink + 'static) -> RunHandle {
        let sink: Arc<dyn EventSink> = Arc::new(sink);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        info!("Starting dispatcher…");

        let reaper = spawn_loop("reaper", shutdown_rx.clone(), {
            let ctx = self.ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    let pause = ctx.config().reap_interval;
                    if let Err(error) = reap_once(&ctx).await {
                        error!(%error, "Reaper pass failed");
                        ctx.metrics().record_loop_error("reaper");
                    }
                    pause
                }
            }
        });
        handles.push(reaper);

        let publisher = spawn_loop("outbox-publisher", shutdown_rx.clone(), {
            let ctx = self.ctx.clone();
            let sink = sink.clone();
            move || {
                let ctx = ctx.clone();
                let sink = sink.clone();
                async move {
                    match crate::outbox::drain_once(&ctx, sink.as_ref()).await {
                        // Drain again immediately while the outbox has depth.
                        Ok(stats) if stats.published + stats.failed > 0 => Duration::ZERO,
                        Ok(_) => ctx.config().publish_interval,
                        Err(error) => {
                            error!(%error, "Outbox drain failed");
                            ctx.metrics().record_loop_error("outbox-publisher");
                            ctx.config().publish_interval
                        }
                    }
                }
            }
        });
        handles.push(publisher);

        let gauges = spawn_loop("gauges", shutdown_rx.clone(), {
            let ctx = self.ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    if let Err(error) = refresh_gauges(&ctx).await {
                        error!(%error, "Gauge refresh failed");
                        ctx.metrics().record_loop_error("gauges");
                    }
                    GAUGE_REFRESH
                }
            }
        });
        handles.push(gauges);

        if let DispatchMode::Internal { slots, jobs } = self.mode {
            let claims = spawn_loop("claim-dispatch", shutdown_rx.clone(), {
                let ctx = self.ctx.clone();
                move || {
                    let ctx = ctx.clone();
                    let jobs = jobs.clone();
                    async move { dispatch_claims(&ctx, &jobs, slots).await }
                }
            });
            handles.push(claims);
        }

        RunHandle {
            shutdown_tx,
            handles,
        }
    }
}

/// Spawns a named loop that runs `tick`, sleeps for the returned duration,
/// and exits when shutdown is signalled.
fn spawn_loop<F, Fut>(
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Duration> + Send + 'static,
{
    let span = info_span!("dispatcher-task", task = name);
    tokio::spawn(
        async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let pause = tick().await;
                if pause.is_zero() {
                    continue;
                }
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("Task stopped");
        }
        .instrument(span),
    )
}

/// One internal-dispatch tick: up to `slots` claims, bounded by the
/// configured claim batch, handed to the consumer channel.
async fn dispatch_claims(
    ctx: &CoreContext,
    jobs: &mpsc::Sender<LeasedJob>,
    slots: usize,
) -> Duration {
    let budget = slots.min(ctx.config().claim_batch);
    for _ in 0..budget {
        match claim(ctx, ClaimRequest::new("internal-dispatch")).await {
            Ok(Some(leased)) => {
                if jobs.send(leased).await.is_err() {
                    // Consumer dropped the receiver; idle until shutdown.
                    return CLAIM_POLL_INTERVAL;
                }
            }
            Ok(None) => return CLAIM_POLL_INTERVAL,
            Err(error) => {
                error!(%error, "Claim dispatch failed");
                ctx.metrics().record_loop_error("claim-dispatch");
                return CLAIM_POLL_INTERVAL;
            }
        }
    }
    Duration::ZERO
}

/// Repopulates the queue-depth gauges and the lease-age histogram.
async fn refresh_gauges(ctx: &CoreContext) -> Result<(), sqlx::Error> {
    let counts: HashMap<String, i64> = store::state_counts(ctx.pool()).await?.into_iter().collect();
    for state in JobState::all() {
        let depth = counts.get(state.as_str()).copied().unwrap_or(0);
        ctx.metrics().set_queue_depth(state.as_str(), depth);
    }

    let now = ctx.now();
    for started_at in store::live_lease_starts(ctx.pool(), 1024).await? {
        let age = (now - started_at).num_milliseconds() as f64 / 1000.0;
        if age >= 0.0 {
            ctx.metrics().observe_lease_age(age);
        }
    }
    Ok(())
}

/// Handle to the running background tasks.
#[derive(Debug)]
pub struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Signals shutdown and waits for the loops to drain.
    ///
    /// In-flight iterations finish; no new ticks start. Tasks still running
    /// after the drain window are aborted.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for mut handle in self.handles {
            match timeout(DRAIN_WINDOW, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, "Dispatcher task panicked"),
                Err(_) => {
                    warn!("Dispatcher task exceeded the drain window");
                    handle.abort();
                }
            }
        }
    }

    /// Waits for the background tasks without initiating shutdown. Returns
    /// only if every loop exits on its own.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Dispatcher task panicked");
            }
        });
    }
}
