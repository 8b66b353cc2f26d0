//! Periodic driver of the collection cycle
//!
//! Cycles start every `period`. The time a cycle took is subtracted from the
//! following sleep so the cadence holds regardless of fan-out latency. A cycle
//! that overruns the period is followed immediately by the next one, with no
//! catch-up burst.

use std::{future::Future, time::Duration};

use tokio::time::{self, Instant};
use tracing::{Instrument, info, info_span, warn};

use crate::cycle::{self, Report};

/// Errors produced by [`Scheduler`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A cycle failed fatally.
    #[error(transparent)]
    Cycle(#[from] cycle::Error),
}

/// How long to wait after a cycle that took `elapsed` so that the next one
/// starts `period` after it.
#[must_use]
pub fn delay_after(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Runs a collection cycle on a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    period: Duration,
}

impl Scheduler {
    /// Create a new [`Scheduler`] with cycles starting every `period`.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Run `cycle` forever, the first immediately.
    ///
    /// # Errors
    ///
    /// Returns the first fatal cycle error. This function does not otherwise
    /// return.
    pub async fn run<C, Fut>(&self, mut cycle: C) -> Result<(), Error>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<Report, cycle::Error>>,
    {
        let mut iteration: u64 = 0;
        loop {
            let start = Instant::now();
            info!("cycle {iteration} starting");
            let span = info_span!("cycle", iteration);
            let report = cycle().instrument(span).await?;
            let elapsed = start.elapsed();
            info!(
                "cycle {iteration} took {elapsed:?}: {} services, {} recorded, {} failed, {} invalid, {} pending, {} unresolved",
                report.services,
                report.recorded,
                report.failed,
                report.invalid,
                report.pending,
                report.unresolved,
            );

            let delay = delay_after(self.period, elapsed);
            if delay.is_zero() {
                warn!(
                    "cycle {iteration} overran the {:?} period, starting the next immediately",
                    self.period
                );
            } else {
                info!("next cycle in {delay:?}");
            }
            time::sleep(delay).await;
            iteration = iteration.wrapping_add(1);
        }
    }
}
