//! Startup crash recovery and periodic cleanup.
//!
//! Invoked once at startup and then on a timer: in-flight items are
//! reset to their queued states, task rows that no longer match their
//! item are cancelled, and detail fetches that sat too long go back to
//! `NEW`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::state::StateManager;

/// Default periodic pass interval (60 s).
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// How many periodic passes between stale-detail resets (~hourly).
const STALE_PASS_EVERY: u64 = 60;

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePass {
    pub recovered: u64,
    pub cancelled_tasks: u64,
    pub rescheduled: u64,
    pub stuck_reset: u64,
    pub stale_detail_reset: u64,
}

/// Repairs drift between items and scheduled tasks.
pub struct Reconciler {
    state: Arc<StateManager>,
    stuck_minutes: i64,
    detail_stale_hours: i64,
    interval: Duration,
    running: AtomicBool,
    shutdown: Notify,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("stuck_minutes", &self.stuck_minutes)
            .field("detail_stale_hours", &self.detail_stale_hours)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(state: Arc<StateManager>, stuck_minutes: i64, detail_stale_hours: i64) -> Arc<Self> {
        Arc::new(Self {
            state,
            stuck_minutes,
            detail_stale_hours,
            interval: DEFAULT_INTERVAL,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Startup pass: crash recovery, stale task cleanup, and re-scheduling
    /// of queued items left without tasks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self))]
    pub async fn run_startup(&self) -> Result<ReconcilePass, EngineError> {
        let recovered = self.state.recover_from_crash().await?;
        let cancelled_tasks = self.state.cleanup_mismatched_tasks().await?;
        let rescheduled = self.state.reschedule_queued_items().await?;
        let pass = ReconcilePass {
            recovered,
            cancelled_tasks,
            rescheduled,
            ..ReconcilePass::default()
        };
        info!(
            recovered,
            cancelled_tasks, rescheduled, "startup reconciliation finished"
        );
        Ok(pass)
    }

    /// Periodic pass: stuck-item reset and stale task cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn run_periodic(&self) -> Result<ReconcilePass, EngineError> {
        let stuck_reset = self.state.reset_stuck(self.stuck_minutes).await?;
        let cancelled_tasks = self.state.cleanup_mismatched_tasks().await?;
        Ok(ReconcilePass {
            stuck_reset,
            cancelled_tasks,
            ..ReconcilePass::default()
        })
    }

    /// Hourly pass in daemon mode: resets long-stale detail fetches.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn run_stale_pass(&self) -> Result<u64, EngineError> {
        self.state
            .reset_stale_detail_fetching(self.detail_stale_hours)
            .await
    }

    /// Spawns the periodic loop. The stale-detail pass piggybacks on
    /// every sixtieth tick (~hourly at the default interval).
    pub fn start(reconciler: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        reconciler.running.store(true, Ordering::SeqCst);
        let reconciler = Arc::clone(reconciler);
        tokio::spawn(async move {
            info!(
                interval_secs = reconciler.interval.as_secs(),
                "reconciler started"
            );
            let mut ticks: u64 = 0;
            while reconciler.running.load(Ordering::SeqCst) {
                tokio::select! {
                    () = reconciler.shutdown.notified() => break,
                    () = tokio::time::sleep(reconciler.interval) => {}
                }
                if let Err(e) = reconciler.run_periodic().await {
                    warn!(error = %e, "periodic reconciliation failed");
                }
                ticks += 1;
                if ticks % STALE_PASS_EVERY == 0
                    && let Err(e) = reconciler.run_stale_pass().await
                {
                    warn!(error = %e, "stale detail reset failed");
                }
            }
            info!("reconciler exited");
        })
    }

    /// Stops the periodic loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}
