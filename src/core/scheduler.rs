use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Observed by a running sweep; trips as soon as a newer interruption happens
#[derive(Debug, Clone)]
pub struct CancelToken {
    epoch: Arc<AtomicU64>,
    started_at: u64,
}

impl CancelToken {
    /// A token nothing can cancel
    pub fn never() -> Self {
        Self {
            epoch: Arc::new(AtomicU64::new(0)),
            started_at: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) != self.started_at
    }
}

/// Shared switch used to pause sweeps and cancel the one in flight
#[derive(Debug, Clone, Default)]
pub struct SweepControl {
    epoch: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
}

impl SweepControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            epoch: self.epoch.clone(),
            started_at: self.epoch.load(Ordering::SeqCst),
        }
    }

    /// Cancel any sweep currently running; later sweeps are unaffected
    pub fn interrupt(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Fixed-interval ticker for background consistency sweeps
pub struct SweepScheduler {
    period: Duration,
    control: SweepControl,
}

impl SweepScheduler {
    pub fn new(period: Duration, control: SweepControl) -> Self {
        Self { period, control }
    }

    /// Tick until `shutdown` flips to true. Paused ticks are skipped; a slow
    /// sweep delays the next tick instead of stacking up.
    pub async fn run<F, Fut>(self, mut sweep: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(CancelToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.control.is_paused() {
                        debug!("Sweep skipped while paused");
                        continue;
                    }
                    sweep(self.control.token()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
