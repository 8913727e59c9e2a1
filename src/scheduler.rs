//! Priority-queued task scheduler with bounded concurrency and retries.
//!
//! Scheduled tasks live on a min-heap ordered by (next run time,
//! priority descending, creation order) behind a mutex; in-flight tasks
//! are tracked in a concurrent map. A single supervisor loop drains due
//! tasks, re-checks the item's committed state just before dispatch
//! (mismatch cancels the task, it never fails it), respects the
//! concurrency cap, and mirrors every status flip to the durable
//! `processing_tasks` row.
//!
//! Failed handlers are classified; retryable failures re-enter the heap
//! with a computed delay (status-mismatch hints get a short linear fuse
//! for the first two retries, everything else exponential backoff capped
//! at five minutes, plus jitter). A task that exhausts its budget fails
//! permanently and takes its item to `FAILED_PERMANENT`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{classify_error, EngineError, ErrorKind};
use crate::state::{StateManager, TransitionContext};
use crate::store::{ItemStatus, Stage, Store, TaskStatus};

/// Default retry budget per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Ceiling for the exponential retry backoff (5 minutes).
const RETRY_BACKOFF_CAP_SECS: u64 = 300;

/// Base for the exponential retry backoff (30 seconds).
const RETRY_BACKOFF_BASE_SECS: u64 = 30;

/// Maximum jitter added to retry delays (5 seconds).
const MAX_JITTER_SECS: u64 = 5;

/// How long a task sleeps when its stage is paused.
const PAUSED_REQUEUE_SECS: u64 = 30;

/// Dispatcher tick period; the loop never sleeps longer than this.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// How often terminal task rows are garbage-collected (~12 hours).
const GC_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// How long `stop` waits for in-flight workers.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Task priority; higher dispatches first at equal run times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Numeric value stored on the task row.
    #[must_use]
    pub fn value(&self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 10,
            Self::Urgent => 20,
        }
    }
}

/// A request to schedule a stage task, published by the state manager.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub item_id: i64,
    pub stage: Stage,
    pub priority: TaskPriority,
    pub delay_seconds: u64,
}

/// One scheduled task as held on the heap.
#[derive(Debug, Clone)]
struct ScheduledTask {
    id: i64,
    item_id: i64,
    stage: Stage,
    priority: i64,
    seq: u64,
    retry_count: u32,
    max_retries: u32,
    next_run_time: Instant,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ScheduledTask {}

impl Ord for ScheduledTask {
    /// Earlier run time first; ties broken by priority descending, then
    /// creation order ascending.
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_run_time
            .cmp(&other.next_run_time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What the scheduler hands to the dispatcher for one execution.
#[derive(Debug, Clone)]
pub struct DispatchedTask {
    pub task_id: i64,
    pub item_id: i64,
    pub stage: Stage,
    pub retry_count: u32,
}

/// Receives dispatched tasks; implemented by the pipeline manager.
#[async_trait]
pub trait StageDispatcher: Send + Sync {
    /// Executes the stage handler for one task.
    async fn execute(&self, task: &DispatchedTask) -> Result<(), EngineError>;

    /// `true` while dispatch for the stage is suppressed.
    fn is_stage_paused(&self, stage: Stage) -> bool;
}

/// Cumulative scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    cancelled: AtomicU64,
}

impl SchedulerStats {
    #[must_use]
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(AtomicOrdering::SeqCst)
    }
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(AtomicOrdering::SeqCst)
    }
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(AtomicOrdering::SeqCst)
    }
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(AtomicOrdering::SeqCst)
    }
    #[must_use]
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

/// Point-in-time scheduler status for reporting.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub running: bool,
    pub queue_size: usize,
    pub active_tasks: usize,
    pub max_concurrent: usize,
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub cancelled: u64,
}

/// Priority+time ordered task scheduler.
pub struct TaskScheduler {
    store: Store,
    state: Arc<StateManager>,
    dispatcher: OnceLock<Arc<dyn StageDispatcher>>,
    heap: Mutex<BinaryHeap<std::cmp::Reverse<ScheduledTask>>>,
    active: DashMap<i64, DispatchedTask>,
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<ScheduleRequest>>>,
    max_concurrent: usize,
    gc_completed_hours: i64,
    gc_failed_hours: i64,
    seq: AtomicU64,
    running: AtomicBool,
    shutdown: Notify,
    stats: SchedulerStats,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Creates a scheduler.
    ///
    /// `request_rx` is the receiving end of the channel the state manager
    /// publishes [`ScheduleRequest`]s on.
    #[must_use]
    pub fn new(
        store: Store,
        state: Arc<StateManager>,
        max_concurrent: usize,
        gc_completed_hours: i64,
        gc_failed_hours: i64,
        request_rx: mpsc::UnboundedReceiver<ScheduleRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            state,
            dispatcher: OnceLock::new(),
            heap: Mutex::new(BinaryHeap::new()),
            active: DashMap::new(),
            request_rx: Mutex::new(Some(request_rx)),
            max_concurrent: max_concurrent.max(1),
            gc_completed_hours,
            gc_failed_hours,
            seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            stats: SchedulerStats::default(),
        })
    }

    /// Registers the dispatcher (the pipeline manager).
    ///
    /// Called once during engine assembly, after both components exist.
    pub fn register_dispatcher(&self, dispatcher: Arc<dyn StageDispatcher>) {
        if self.dispatcher.set(dispatcher).is_err() {
            warn!("dispatcher already registered");
        }
    }

    /// Cumulative counters.
    #[must_use]
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Point-in-time status.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            running: self.running.load(AtomicOrdering::SeqCst),
            queue_size: self.heap_guard().len(),
            active_tasks: self.active.len(),
            max_concurrent: self.max_concurrent,
            scheduled: self.stats.scheduled(),
            completed: self.stats.completed(),
            failed: self.stats.failed(),
            retries: self.stats.retries(),
            cancelled: self.stats.cancelled(),
        }
    }

    fn heap_guard(&self) -> MutexGuard<'_, BinaryHeap<std::cmp::Reverse<ScheduledTask>>> {
        match self.heap.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Checks whether the item's committed state accepts tasks of `stage`.
    async fn can_schedule_for_stage(
        &self,
        item_id: i64,
        stage: Stage,
    ) -> Result<bool, EngineError> {
        let Some(item) = self.store.get_item(item_id).await? else {
            warn!(item_id, "cannot schedule, item missing");
            return Ok(false);
        };
        let status = item.status();
        let acceptable = stage.acceptable_states().contains(&status);
        if !acceptable {
            debug!(item_id, status = %status, stage = %stage, "state not acceptable for stage");
        }
        Ok(acceptable)
    }

    /// Schedules a task for `(item_id, stage)`.
    ///
    /// Enforces single-flight: an existing queued/active task for the pair
    /// is returned instead of inserting a duplicate. Returns `None` when
    /// the item's state does not accept the stage.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self))]
    pub async fn schedule_task(
        &self,
        item_id: i64,
        stage: Stage,
        priority: TaskPriority,
        delay_seconds: u64,
    ) -> Result<Option<i64>, EngineError> {
        if !self.can_schedule_for_stage(item_id, stage).await? {
            return Ok(None);
        }

        if let Some(existing) = self.store.find_open_task(item_id, stage).await? {
            debug!(item_id, stage = %stage, existing, "open task exists, not scheduling another");
            return Ok(Some(existing));
        }

        let task_id = self
            .store
            .insert_task(
                item_id,
                stage,
                priority.value(),
                i64::from(DEFAULT_MAX_RETRIES),
                delay_seconds,
                None,
            )
            .await?;

        let task = ScheduledTask {
            id: task_id,
            item_id,
            stage,
            priority: priority.value(),
            seq: self.next_seq(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_run_time: Instant::now() + Duration::from_secs(delay_seconds),
        };
        self.heap_guard().push(std::cmp::Reverse(task));
        self.stats.scheduled.fetch_add(1, AtomicOrdering::SeqCst);

        info!(item_id, stage = %stage, task_id, delay_seconds, "task scheduled");
        Ok(Some(task_id))
    }

    /// Cancels `active` task rows left behind by a dead process.
    ///
    /// Run once at startup, before items are recovered: no worker exists
    /// yet, so every active row is a zombie. Cancelling them unblocks the
    /// single-flight check so fresh tasks can be scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn cancel_stale_active_tasks(&self) -> Result<u64, EngineError> {
        let active = self.store.tasks_with_status_in(&[TaskStatus::Active]).await?;
        let ids: Vec<i64> = active.iter().map(|task| task.id).collect();
        let cancelled = self
            .store
            .cancel_tasks(&ids, "stale after process restart")
            .await?;
        if cancelled > 0 {
            info!(cancelled, "cancelled stale active tasks from previous run");
        }
        Ok(cancelled)
    }

    /// Rebuilds the heap from queued rows after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn restore_queued_tasks(&self) -> Result<u64, EngineError> {
        let rows = self.store.queued_tasks_with_remaining_delay().await?;
        let mut restored = 0;
        let mut heap = self.heap_guard();
        for (row, remaining) in rows {
            let Some(stage) = row.stage() else {
                warn!(task_id = row.id, stage = %row.stage_str, "dropping task with unknown stage");
                continue;
            };
            let delay = u64::try_from(remaining.max(0)).unwrap_or(0);
            heap.push(std::cmp::Reverse(ScheduledTask {
                id: row.id,
                item_id: row.item_id,
                stage,
                priority: row.priority,
                seq: self.next_seq(),
                retry_count: u32::try_from(row.retry_count.max(0)).unwrap_or(0),
                max_retries: u32::try_from(row.max_retries.max(0)).unwrap_or(DEFAULT_MAX_RETRIES),
                next_run_time: Instant::now() + Duration::from_secs(delay),
            }));
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "restored queued tasks from the store");
        }
        Ok(restored)
    }

    /// Cancels one task: removes it from the heap and marks the row.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn cancel_task(&self, task_id: i64, reason: &str) -> Result<bool, EngineError> {
        let removed = {
            let mut heap = self.heap_guard();
            let before = heap.len();
            let remaining: BinaryHeap<_> = heap
                .drain()
                .filter(|std::cmp::Reverse(t)| t.id != task_id)
                .collect();
            let removed = before != remaining.len();
            *heap = remaining;
            removed
        };
        self.store
            .mark_task_terminal(task_id, TaskStatus::Cancelled, Some(reason), None)
            .await?;
        if removed {
            self.stats.cancelled.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(removed)
    }

    /// Drops every queued download task (heap and rows).
    ///
    /// Invoked when the remote download limit is exhausted so queued
    /// transfers stop consuming the allowance.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn drop_queued_download_tasks(&self, reason: &str) -> Result<u64, EngineError> {
        let dropped: Vec<i64> = {
            let mut heap = self.heap_guard();
            let (downloads, rest): (Vec<_>, Vec<_>) = heap
                .drain()
                .partition(|std::cmp::Reverse(t)| t.stage == Stage::Download);
            *heap = rest.into_iter().collect();
            downloads
                .into_iter()
                .map(|std::cmp::Reverse(t)| t.id)
                .collect()
        };
        let count = self.store.cancel_tasks(&dropped, reason).await?;
        self.stats
            .cancelled
            .fetch_add(dropped.len() as u64, AtomicOrdering::SeqCst);
        if count > 0 {
            info!(count, "dropped queued download tasks");
        }
        Ok(count)
    }

    /// Starts the supervisor loop.
    ///
    /// Returns the join handle; the loop runs until [`Self::stop`].
    pub fn start(scheduler: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        scheduler.running.store(true, AtomicOrdering::SeqCst);
        let scheduler = Arc::clone(scheduler);
        tokio::spawn(async move { scheduler.supervisor_loop().await })
    }

    async fn supervisor_loop(self: Arc<Self>) {
        info!(max_concurrent = self.max_concurrent, "task scheduler started");

        let mut rx = {
            let mut guard = match self.request_rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };

        let mut tick = tokio::time::interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_gc = Instant::now();

        while self.running.load(AtomicOrdering::SeqCst) {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = Self::dispatch_due(&self).await {
                        error!(error = %e, "dispatch pass failed");
                    }
                    if last_gc.elapsed() >= GC_INTERVAL {
                        last_gc = Instant::now();
                        match self
                            .store
                            .delete_expired_tasks(self.gc_completed_hours, self.gc_failed_hours)
                            .await
                        {
                            Ok(deleted) if deleted > 0 => {
                                info!(deleted, "garbage-collected task rows");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "task gc failed"),
                        }
                    }
                }
                request = recv_request(&mut rx) => {
                    match request {
                        Some(request) => {
                            if let Err(e) = self
                                .schedule_task(
                                    request.item_id,
                                    request.stage,
                                    request.priority,
                                    request.delay_seconds,
                                )
                                .await
                            {
                                warn!(error = %e, "schedule request failed");
                            }
                        }
                        None => rx = None,
                    }
                }
                () = self.shutdown.notified() => break,
            }
        }

        info!("task scheduler loop exited");
    }

    /// Pops due tasks and dispatches them up to the concurrency cap.
    async fn dispatch_due(this: &Arc<Self>) -> Result<(), EngineError> {
        loop {
            if !this.running.load(AtomicOrdering::SeqCst) {
                return Ok(());
            }
            // Bounded concurrency: |active| <= max_concurrent always
            if this.active.len() >= this.max_concurrent {
                return Ok(());
            }

            let task = {
                let mut heap = this.heap_guard();
                match heap.peek() {
                    Some(std::cmp::Reverse(task)) if task.next_run_time <= Instant::now() => {
                        heap.pop().map(|std::cmp::Reverse(task)| task)
                    }
                    _ => None,
                }
            };
            let Some(mut task) = task else {
                return Ok(());
            };

            // Stage-level pause gates dispatch without consuming the task
            if let Some(dispatcher) = this.dispatcher.get()
                && dispatcher.is_stage_paused(task.stage)
            {
                debug!(task_id = task.id, stage = %task.stage, "stage paused, deferring task");
                task.next_run_time = Instant::now() + Duration::from_secs(PAUSED_REQUEUE_SECS);
                this.heap_guard().push(std::cmp::Reverse(task));
                return Ok(());
            }

            // Re-check the committed item state just before dispatch;
            // a mismatch cancels the task, it does not fail it.
            if !this.can_schedule_for_stage(task.item_id, task.stage).await? {
                warn!(
                    task_id = task.id,
                    item_id = task.item_id,
                    stage = %task.stage,
                    "item state changed, cancelling task"
                );
                this.store
                    .mark_task_terminal(
                        task.id,
                        TaskStatus::Cancelled,
                        Some("item state does not match stage"),
                        Some(ErrorKind::StatusMismatch.as_str()),
                    )
                    .await?;
                this.stats.cancelled.fetch_add(1, AtomicOrdering::SeqCst);
                continue;
            }

            Self::spawn_worker(this, task).await?;
        }
    }

    async fn spawn_worker(this: &Arc<Self>, task: ScheduledTask) -> Result<(), EngineError> {
        let Some(dispatcher) = this.dispatcher.get().cloned() else {
            error!(task_id = task.id, "no dispatcher registered, failing task");
            this.store
                .mark_task_terminal(
                    task.id,
                    TaskStatus::Failed,
                    Some("no dispatcher registered"),
                    None,
                )
                .await?;
            this.stats.failed.fetch_add(1, AtomicOrdering::SeqCst);
            return Ok(());
        };

        this.store.mark_task_active(task.id).await?;
        let dispatched = DispatchedTask {
            task_id: task.id,
            item_id: task.item_id,
            stage: task.stage,
            retry_count: task.retry_count,
        };
        this.active.insert(task.id, dispatched.clone());

        info!(
            task_id = task.id,
            item_id = task.item_id,
            stage = %task.stage,
            retry_count = task.retry_count,
            "dispatching task"
        );

        let scheduler = Arc::clone(this);
        tokio::spawn(async move {
            let result = dispatcher.execute(&dispatched).await;
            scheduler.active.remove(&task.id);
            if let Err(e) = scheduler.handle_outcome(task, result).await {
                error!(error = %e, "task outcome handling failed");
            }
        });
        Ok(())
    }

    /// Applies the outcome of one execution: completion, classified
    /// retry, or permanent failure.
    async fn handle_outcome(
        &self,
        mut task: ScheduledTask,
        result: Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let error = match result {
            Ok(()) => {
                self.store
                    .mark_task_terminal(task.id, TaskStatus::Completed, None, None)
                    .await?;
                self.stats.completed.fetch_add(1, AtomicOrdering::SeqCst);
                debug!(task_id = task.id, "task completed");
                return Ok(());
            }
            Err(error) => error,
        };

        let info = classify_error(&error);
        let message = error.to_string();

        if error.is_download_limit() {
            // Stage pause and item rollback happen in the pipeline; here
            // the task fails and queued downloads stop consuming quota.
            self.store
                .mark_task_terminal(
                    task.id,
                    TaskStatus::Failed,
                    Some(&message),
                    Some(info.kind.as_str()),
                )
                .await?;
            self.stats.failed.fetch_add(1, AtomicOrdering::SeqCst);
            self.drop_queued_download_tasks("download limit exhausted")
                .await?;
            return Ok(());
        }

        if !info.retryable {
            warn!(
                task_id = task.id,
                kind = %info.kind,
                error = %message,
                "non-retryable failure, task failed permanently"
            );
            self.store
                .mark_task_terminal(
                    task.id,
                    TaskStatus::Failed,
                    Some(&message),
                    Some(info.kind.as_str()),
                )
                .await?;
            self.stats.failed.fetch_add(1, AtomicOrdering::SeqCst);
            return Ok(());
        }

        task.retry_count += 1;
        self.stats.retries.fetch_add(1, AtomicOrdering::SeqCst);

        if task.retry_count <= task.max_retries {
            let delay = retry_delay(info.kind, task.retry_count);
            self.store
                .requeue_task(
                    task.id,
                    i64::from(task.retry_count),
                    delay.as_secs(),
                    Some(&message),
                    Some(info.kind.as_str()),
                )
                .await?;
            warn!(
                task_id = task.id,
                item_id = task.item_id,
                stage = %task.stage,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                delay_secs = delay.as_secs(),
                error = %message,
                "task failed, retrying"
            );
            task.next_run_time = Instant::now() + delay;
            self.heap_guard().push(std::cmp::Reverse(task));
            return Ok(());
        }

        // Budget exhausted: the task fails and the item fails permanently.
        error!(
            task_id = task.id,
            item_id = task.item_id,
            stage = %task.stage,
            max_retries = task.max_retries,
            error = %message,
            "retry budget exhausted, task failed permanently"
        );
        self.store
            .mark_task_terminal(
                task.id,
                TaskStatus::Failed,
                Some(&message),
                Some(info.kind.as_str()),
            )
            .await?;
        self.stats.failed.fetch_add(1, AtomicOrdering::SeqCst);

        let reason = format!("{} stage retry budget exhausted", task.stage);
        let ctx = TransitionContext {
            retry_count: i64::from(task.retry_count),
            error: Some(&message),
            ..TransitionContext::default()
        };
        self.state
            .transition_full(task.item_id, ItemStatus::FailedPermanent, &reason, ctx)
            .await?;
        Ok(())
    }

    /// Stops the scheduler: cancels queued tasks and waits (bounded) for
    /// in-flight workers to finish.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when cancelling queued rows fails.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), EngineError> {
        if !self.running.swap(false, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_waiters();

        let queued: Vec<i64> = self
            .heap_guard()
            .drain()
            .map(|std::cmp::Reverse(task)| task.id)
            .collect();
        let cancelled = self.store.cancel_tasks(&queued, "scheduler stopping").await?;
        self.stats
            .cancelled
            .fetch_add(queued.len() as u64, AtomicOrdering::SeqCst);

        let drained = tokio::time::timeout(STOP_DRAIN_TIMEOUT, async {
            while !self.active.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                still_active = self.active.len(),
                "stop timed out waiting for in-flight tasks"
            );
        }

        info!(cancelled, "task scheduler stopped");
        Ok(())
    }
}

async fn recv_request(
    rx: &mut Option<mpsc::UnboundedReceiver<ScheduleRequest>>,
) -> Option<ScheduleRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        // Channel gone: park this select arm forever
        None => std::future::pending().await,
    }
}

/// Computes the retry delay per the dispatch rules.
///
/// Status-mismatch failures use a short linear fuse for the first two
/// retries (5 s, 10 s); everything else uses exponential backoff from
/// 30 s capped at 300 s. Jitter of up to 5 s avoids thundering herds.
fn retry_delay(kind: ErrorKind, retry_count: u32) -> Duration {
    let base = if kind == ErrorKind::StatusMismatch && retry_count <= 2 {
        u64::from(retry_count) * 5
    } else {
        let factor = 2u64.saturating_pow(retry_count.saturating_sub(1).min(32));
        (RETRY_BACKOFF_BASE_SECS.saturating_mul(factor)).min(RETRY_BACKOFF_CAP_SECS)
    };
    let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_SECS);
    Duration::from_secs(base + jitter)
}
