//! Periodic sweep driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Sweep;

/// Runs a [`Sweep`] on a fixed period until cancelled.
///
/// Each pass runs on the blocking pool because sweeps perform synchronous
/// SSH and store I/O.
#[derive(Debug)]
pub struct ReconcileLoop<W: Sweep + 'static> {
    sweeper: Arc<W>,
    period: Duration,
}

impl<W: Sweep + 'static> ReconcileLoop<W> {
    /// Creates a loop running `sweeper` every `period`.
    #[must_use]
    pub const fn new(sweeper: Arc<W>, period: Duration) -> Self {
        Self { sweeper, period }
    }

    /// Sweeps immediately and then once per period until `shutdown` is
    /// cancelled. Returns the number of completed passes.
    pub async fn run(&self, shutdown: &CancellationToken) -> u64 {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = 0_u64;
        info!(period_secs = self.period.as_secs(), "reconcile loop started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sweeper = Arc::clone(&self.sweeper);
            match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                Ok(Ok(report)) => debug!(
                    acquired = report.acquired,
                    finalized = report.finalized,
                    "reconcile pass done"
                ),
                Ok(Err(err)) => warn!(error = %err, "reconcile pass failed"),
                Err(err) => warn!(error = %err, "reconcile pass panicked"),
            }
            passes += 1;
        }
        info!(passes, "reconcile loop stopped");
        passes
    }
}
