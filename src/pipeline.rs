//! Pipeline manager: stage lifecycle, per-stage pause/resume, and quota
//! gating for the download stage.
//!
//! The scheduler dispatches tasks here. Each execution runs inside one
//! transactional session from the store: refresh the item, check
//! acceptance, hop to the stage's queued/active states, run the handler,
//! and transition to the outcome state. Auth failures and the
//! download-limit signal pause whole stages instead of failing items one
//! by one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{classify_error, EngineError};
use crate::quota::QuotaManager;
use crate::scheduler::{
    DispatchedTask, ScheduleRequest, StageDispatcher, TaskPriority, TaskScheduler,
};
use crate::sources::notify::notify_detached;
use crate::sources::Notifier;
use crate::stages::{StageHandler, StageOutcome};
use crate::state::{StateManager, TransitionContext, NEXT_STAGE_DELAY_SECS};
use crate::store::{ItemStatus, Stage, Store};

/// Quota status as reported by the `status` surface.
#[derive(Debug, Clone)]
pub struct QuotaStatus {
    pub quota_available: bool,
    pub remaining: Option<i64>,
    pub daily_limit: Option<i64>,
    pub download_paused: bool,
    pub pause_reason: Option<String>,
}

/// Orchestrates stage handlers and gates their dispatch.
pub struct PipelineManager {
    store: Store,
    state: Arc<StateManager>,
    quota: Arc<QuotaManager>,
    stages: RwLock<HashMap<Stage, Arc<dyn StageHandler>>>,
    paused: DashMap<Stage, String>,
    worker_permits: Semaphore,
    quota_counter: AtomicU64,
    quota_check_every_n: u64,
    quota_poll: Duration,
    schedule_tx: mpsc::UnboundedSender<ScheduleRequest>,
    scheduler: OnceLock<Weak<TaskScheduler>>,
    notifier: Arc<dyn Notifier>,
    running: AtomicBool,
    shutdown: Notify,
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("paused", &self.paused.len())
            .finish_non_exhaustive()
    }
}

impl PipelineManager {
    /// Creates a pipeline manager.
    ///
    /// `schedule_tx` is a clone of the scheduler's request channel, used
    /// by the quota recovery sweep.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        state: Arc<StateManager>,
        quota: Arc<QuotaManager>,
        schedule_tx: mpsc::UnboundedSender<ScheduleRequest>,
        notifier: Arc<dyn Notifier>,
        max_workers: usize,
        quota_check_every_n: u64,
        quota_poll_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            state,
            quota,
            stages: RwLock::new(HashMap::new()),
            paused: DashMap::new(),
            worker_permits: Semaphore::new(max_workers.max(1)),
            quota_counter: AtomicU64::new(0),
            quota_check_every_n: quota_check_every_n.max(1),
            quota_poll: Duration::from_secs(quota_poll_secs.max(1)),
            schedule_tx,
            scheduler: OnceLock::new(),
            notifier,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        })
    }

    /// Attaches a weak handle to the scheduler, used by the quota gate
    /// to drop queued download tasks when the allowance runs out.
    ///
    /// Called once during engine assembly, after both components exist;
    /// the handle is weak so the scheduler's `Arc` to this pipeline (as
    /// its dispatcher) does not become a cycle.
    pub fn attach_scheduler(&self, scheduler: &Arc<TaskScheduler>) {
        if self.scheduler.set(Arc::downgrade(scheduler)).is_err() {
            warn!("scheduler handle already attached");
        }
    }

    fn scheduler_handle(&self) -> Option<Arc<TaskScheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    /// Registers one stage handler. Later registrations for the same
    /// stage replace the earlier one.
    pub fn register_stage(&self, handler: Arc<dyn StageHandler>) {
        let stage = handler.stage();
        info!(stage = %stage, "stage registered");
        if let Ok(mut stages) = self.stages.write() {
            stages.insert(stage, handler);
        }
    }

    fn handler_for(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.stages
            .read()
            .ok()
            .and_then(|stages| stages.get(&stage).cloned())
    }

    /// Suppresses dispatch for a stage until [`Self::resume_stage`].
    ///
    /// The pause is mirrored to the store's `stage_flags` table so the
    /// `status` command can report it; a failed mirror write never stops
    /// the engine.
    pub async fn pause_stage(&self, stage: Stage, reason: &str) {
        if self.paused.insert(stage, reason.to_string()).is_none() {
            warn!(stage = %stage, reason, "stage paused");
            notify_detached(&self.notifier, format!("{stage} stage paused: {reason}"));
        }
        if let Err(e) = self.store.set_stage_flag(stage, true, Some(reason)).await {
            warn!(error = %e, "failed to record stage pause");
        }
    }

    /// Clears a pause; the reason is returned if the stage was paused.
    pub async fn resume_stage(&self, stage: Stage) -> Option<String> {
        let reason = self.paused.remove(&stage).map(|(_, reason)| reason);
        if let Some(reason) = &reason {
            info!(stage = %stage, reason, "stage resumed");
            if let Err(e) = self.store.set_stage_flag(stage, false, None).await {
                warn!(error = %e, "failed to record stage resume");
            }
        }
        reason
    }

    /// Drops persisted stage flags; run once at engine startup since a
    /// pause never outlives the process that set it.
    pub async fn reset_stage_flags(&self) {
        if let Err(e) = self.store.clear_stage_flags().await {
            warn!(error = %e, "failed to clear stage flags");
        }
    }

    /// Currently paused stages with their reasons.
    #[must_use]
    pub fn paused_stages(&self) -> Vec<(Stage, String)> {
        self.paused
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Quota state for the `status` surface.
    #[must_use]
    pub fn get_quota_status(&self) -> QuotaStatus {
        let snapshot = self.quota.snapshot();
        QuotaStatus {
            quota_available: self.quota.has_quota_available(),
            remaining: snapshot.as_ref().map(|q| q.remaining),
            daily_limit: snapshot.as_ref().map(|q| q.daily_limit),
            download_paused: self.paused.contains_key(&Stage::Download),
            pause_reason: self
                .paused
                .get(&Stage::Download)
                .map(|entry| entry.value().clone()),
        }
    }

    /// Stops the pipeline: the quota watcher exits and no new handler
    /// executions are accepted.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        info!("pipeline stopped");
    }

    /// Spawns the quota watcher.
    ///
    /// While running it refreshes the allowance on the cache TTL, pauses
    /// the download stage when the allowance is gone, and on recovery
    /// resumes the stage and re-queues every quota-deferred item.
    pub fn start_quota_watcher(pipeline: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(pipeline);
        tokio::spawn(async move {
            info!(poll_secs = pipeline.quota_poll.as_secs(), "quota watcher started");
            loop {
                tokio::select! {
                    () = pipeline.shutdown.notified() => break,
                    () = tokio::time::sleep(pipeline.quota_poll) => {}
                }
                if !pipeline.running.load(Ordering::SeqCst) {
                    break;
                }
                pipeline.quota_tick().await;
            }
            info!("quota watcher exited");
        })
    }

    /// One pass of the quota watcher.
    pub async fn quota_tick(&self) {
        let quota = match self.quota.get_current_quota(false).await {
            Ok(quota) => quota,
            Err(e) => {
                // Assume ok: a broken quota service must not stall the engine
                warn!(error = %e, "quota check failed, leaving pipeline as-is");
                return;
            }
        };

        if let Err(e) = self
            .store
            .save_quota_state(quota.remaining, quota.daily_limit, quota.next_reset.as_deref())
            .await
        {
            warn!(error = %e, "failed to mirror quota state");
        }

        if quota.has_quota_available() {
            let paused_for_quota = self
                .paused
                .get(&Stage::Download)
                .is_some_and(|entry| entry.value().contains("quota"));
            if paused_for_quota {
                self.resume_stage(Stage::Download).await;
            }
            match self.resume_quota_exhausted_items().await {
                Ok(resumed) if resumed > 0 => {
                    info!(resumed, "quota restored, download tasks re-queued");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "quota recovery sweep failed"),
            }
            return;
        }

        if !self.paused.contains_key(&Stage::Download) {
            self.pause_stage(Stage::Download, "quota exhausted").await;
        }
        // Items already waiting on the download stage defer to the
        // quota-exhausted state; their tasks stop occupying the queue
        // until the allowance recovers.
        match self.defer_queued_downloads().await {
            Ok(deferred) if deferred > 0 => {
                info!(deferred, "queued downloads deferred until quota resets");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "quota deferral sweep failed"),
        }
        if let Some(scheduler) = self.scheduler_handle()
            && let Err(e) = scheduler
                .drop_queued_download_tasks("quota exhausted")
                .await
        {
            warn!(error = %e, "dropping queued download tasks failed");
        }
    }

    /// Moves every `DOWNLOAD_QUEUED` item to the quota-exhausted state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    async fn defer_queued_downloads(&self) -> Result<u64, EngineError> {
        let queued = self
            .store
            .items_by_status(ItemStatus::DownloadQueued, None)
            .await?;
        let mut deferred = 0;
        for item in queued {
            if self
                .state
                .transition_quiet(
                    item.id,
                    ItemStatus::SearchCompleteQuotaExhausted,
                    "quota exhausted",
                    TransitionContext::default(),
                )
                .await?
            {
                deferred += 1;
            }
        }
        Ok(deferred)
    }

    /// Moves every `SEARCH_COMPLETE_QUOTA_EXHAUSTED` item back to
    /// `DOWNLOAD_QUEUED` and schedules its download task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn resume_quota_exhausted_items(&self) -> Result<u64, EngineError> {
        let deferred = self
            .store
            .items_by_status(ItemStatus::SearchCompleteQuotaExhausted, None)
            .await?;

        let mut resumed = 0;
        for item in deferred {
            if self
                .state
                .transition(item.id, ItemStatus::DownloadQueued, "quota restored")
                .await?
            {
                if self
                    .schedule_tx
                    .send(ScheduleRequest {
                        item_id: item.id,
                        stage: Stage::Download,
                        priority: TaskPriority::Normal,
                        delay_seconds: NEXT_STAGE_DELAY_SECS,
                    })
                    .is_err()
                {
                    warn!(item_id = item.id, "scheduler channel closed during quota sweep");
                }
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Executes one dispatched task through its stage handler.
    #[instrument(skip(self), fields(task_id = task.task_id, item_id = task.item_id, stage = %task.stage))]
    async fn run_stage(&self, task: &DispatchedTask) -> Result<(), EngineError> {
        let Some(handler) = self.handler_for(task.stage) else {
            return Err(EngineError::data(
                "data_missing",
                format!("no handler registered for {} stage", task.stage),
            ));
        };
        if self.paused.contains_key(&task.stage) {
            // Raced with a fresh pause; the short mismatch fuse retries it
            return Err(EngineError::StatusMismatch(format!(
                "{} stage is paused",
                task.stage
            )));
        }

        let _permit = self
            .worker_permits
            .acquire()
            .await
            .map_err(|_| EngineError::processing("worker pool closed"))?;

        // Periodic quota gate for the download stage
        if task.stage == Stage::Download {
            let dispatched = self.quota_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if dispatched % self.quota_check_every_n == 0
                && !self.quota.cache_is_stale()
                && !self.quota.has_quota_available()
                && !self.paused.contains_key(&Stage::Download)
            {
                self.pause_stage(Stage::Download, "quota exhausted").await;
            }
        }

        let started = std::time::Instant::now();
        let mut tx = self.store.begin().await?;

        let Some(mut item) = Store::get_item_in(&mut tx, task.item_id).await? else {
            return Err(EngineError::StatusMismatch(format!(
                "item {} does not exist",
                task.item_id
            )));
        };
        if !handler.can_process(&item) {
            return Err(EngineError::StatusMismatch(format!(
                "item {} in {} is not processable by the {} stage",
                item.id,
                item.status(),
                task.stage
            )));
        }

        // Hop through the stage's queued state when accepted straight from
        // the previous stage's COMPLETE precursor, then go active.
        let queued = task.stage.retry_state();
        let active = task.stage.active_state();
        if item.status() != queued && item.status() != active {
            let reason = format!("preparing {} stage", task.stage);
            if self
                .state
                .transition_in(&mut tx, item.id, queued, &reason, TransitionContext::default())
                .await?
            {
                item.status_str = queued.as_str().to_string();
            }
        }
        if item.status() != active {
            let reason = format!("{} stage started", task.stage);
            if self
                .state
                .transition_in(&mut tx, item.id, active, &reason, TransitionContext::default())
                .await?
            {
                item.status_str = active.as_str().to_string();
            }
        }

        let result = handler.process(&mut item, &mut tx).await;
        let processing_time = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                let next = handler.next_state(outcome);
                let reason = match outcome {
                    StageOutcome::Advanced => format!("{} stage succeeded", task.stage),
                    StageOutcome::SkippedExists => "already in library".to_string(),
                    StageOutcome::NoMatch => format!("{} stage found no match", task.stage),
                    StageOutcome::QuotaDeferred => {
                        "quota exhausted, deferring download".to_string()
                    }
                };
                let ctx = TransitionContext {
                    processing_time: Some(processing_time),
                    retry_count: i64::from(task.retry_count),
                    error: None,
                };
                let applied = self
                    .state
                    .transition_in(&mut tx, item.id, next, &reason, ctx)
                    .await?;
                tx.commit().await?;

                if applied {
                    self.state.schedule_next_stage_if_needed(item.id, next).await?;
                    if next == ItemStatus::UploadComplete {
                        self.state
                            .transition(item.id, ItemStatus::Completed, "pipeline complete")
                            .await?;
                    }
                }
                debug!(
                    item_id = item.id,
                    outcome = ?outcome,
                    processing_time,
                    "stage execution finished"
                );
                Ok(())
            }
            Err(e) => {
                if matches!(e, EngineError::Store(_)) {
                    // The session itself is suspect; roll everything back
                    drop(tx);
                    return Err(e);
                }
                // Keep the active state and any partial domain writes so
                // crash recovery and retries see the truth.
                tx.commit().await?;
                self.handle_stage_error(task, item.id, processing_time, e)
                    .await
            }
        }
    }

    /// Maps a handler error onto item state and stage-level gating, then
    /// re-raises it for the scheduler.
    async fn handle_stage_error(
        &self,
        task: &DispatchedTask,
        item_id: i64,
        processing_time: f64,
        error: EngineError,
    ) -> Result<(), EngineError> {
        let message = error.to_string();
        let ctx = TransitionContext {
            processing_time: Some(processing_time),
            retry_count: i64::from(task.retry_count),
            error: Some(&message),
        };

        match &error {
            EngineError::DownloadLimitExhausted { reset_time, .. } => {
                warn!(item_id, reset_time = reset_time.as_deref().unwrap_or("unknown"),
                    "download limit exhausted");
                self.state
                    .rollback_download_tasks_when_limit_exhausted(reset_time.as_deref())
                    .await?;
                let mut reason = "download limit exhausted".to_string();
                if let Some(reset) = reset_time {
                    reason.push_str(&format!(", resets at {reset}"));
                }
                self.pause_stage(Stage::Download, &reason).await;
            }
            EngineError::Auth(auth_message) => {
                // Stage-level lockout: the item goes back to its queued
                // state and waits for an operator resume.
                error!(item_id, stage = %task.stage, error = %auth_message, "auth lockout");
                self.state
                    .transition_full(item_id, task.stage.retry_state(), "auth lockout", ctx)
                    .await?;
                self.pause_stage(task.stage, &format!("auth error: {auth_message}"))
                    .await;
            }
            EngineError::StatusMismatch(_) => {
                // The item is left untouched; the reconciler cleans up
                // stale task rows and the scheduler retries on a short
                // fuse.
            }
            EngineError::NotFound(_) if task.stage == Stage::Search => {
                self.state
                    .transition_full(
                        item_id,
                        ItemStatus::SearchNoResults,
                        "search found no candidates",
                        ctx,
                    )
                    .await?;
            }
            _ => {
                let info = classify_error(&error);
                if info.retryable {
                    let reason = format!("{} stage error, will retry", task.stage);
                    self.state
                        .transition_full(item_id, task.stage.retry_state(), &reason, ctx)
                        .await?;
                } else {
                    let reason =
                        format!("{} stage failed permanently ({})", task.stage, info.kind);
                    self.state
                        .transition_full(item_id, ItemStatus::FailedPermanent, &reason, ctx)
                        .await?;
                }
            }
        }
        Err(error)
    }
}

#[async_trait]
impl StageDispatcher for PipelineManager {
    async fn execute(&self, task: &DispatchedTask) -> Result<(), EngineError> {
        self.run_stage(task).await
    }

    fn is_stage_paused(&self, stage: Stage) -> bool {
        self.paused.contains_key(&stage)
    }
}
