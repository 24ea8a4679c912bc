use crate::catalog::CatalogService;
use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Default period between expiration sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Running,
}

/// Periodically removes expired entries, independent of request traffic.
///
/// A process started without it never expires entries on its own; another
/// worker or `promcat sweep` has to.
pub struct SweepScheduler {
    catalog: Arc<CatalogService>,
    interval: Duration,
    running: AtomicBool,
}

impl SweepScheduler {
    pub fn new(catalog: Arc<CatalogService>, interval: Duration) -> Self {
        Self {
            catalog,
            interval,
            running: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SweepState {
        if self.running.load(Ordering::SeqCst) {
            SweepState::Running
        } else {
            SweepState::Idle
        }
    }

    /// Spawns the sweep loop. The first sweep runs one interval after start.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Expiration sweep scheduled every {:?}", self.interval);

            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(error) = self.sweep_once().await {
                    tracing::warn!("Expiration sweep failed: {}", error);
                }
            }
        })
    }

    /// Runs one sweep. Returns `Ok(0)` without sweeping while another
    /// `sweep_once` on this scheduler is still in progress.
    pub async fn sweep_once(&self) -> Result<usize> {
        let Some(_running) = RunningFlag::try_set(&self.running) else {
            tracing::debug!("Expiration sweep already running, skipping");
            return Ok(0);
        };

        tracing::debug!("Running cleanup of expired entries");
        self.catalog.sweep_expired().await
    }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn try_set(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
