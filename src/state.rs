//! Item state machine: transition validation, history, and the hand-off
//! to the task scheduler.
//!
//! The state manager is the sole writer of `items.status` and of history
//! rows. Every transition validates the edge against the allowed set and
//! writes the item row and a history row in the same transaction. When
//! the new state is a `_COMPLETE` precursor, the implicit pre-queue
//! transition for the next stage runs and its task is scheduled.
//!
//! The reference cycle with the scheduler is broken by a channel: the
//! state manager publishes [`ScheduleRequest`]s; the scheduler owns the
//! receiving end.

use std::sync::{Arc, OnceLock};

use sqlx::sqlite::SqliteConnection;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::EngineError;
use crate::scheduler::{ScheduleRequest, TaskPriority};
use crate::sources::notify::notify_detached;
use crate::sources::Notifier;
use crate::store::{Item, ItemStatus, Stage, Store, TaskStatus};

/// Delay before the next stage's task runs, so workers observe the
/// committed row even behind write-behind caches.
pub const NEXT_STAGE_DELAY_SECS: u64 = 3;

/// Statuses that should never have an open task (beyond the strictly
/// terminal set, `UPLOAD_COMPLETE` and `SEARCH_NO_RESULTS` park items).
const TASKLESS_STATUSES: &[ItemStatus] = &[
    ItemStatus::Completed,
    ItemStatus::SkippedExists,
    ItemStatus::FailedPermanent,
    ItemStatus::UploadComplete,
    ItemStatus::SearchNoResults,
];

/// Allowed outgoing edges per status.
#[must_use]
pub fn allowed_targets(from: ItemStatus) -> &'static [ItemStatus] {
    use ItemStatus as S;
    match from {
        // Collection
        S::New => &[
            S::DetailFetching,
            S::DetailComplete,
            S::SkippedExists,
            S::FailedPermanent,
        ],
        S::DetailFetching => &[S::DetailComplete, S::FailedPermanent, S::New],
        S::DetailComplete => &[S::SearchQueued, S::SkippedExists, S::FailedPermanent],

        // Search
        S::SearchQueued => &[S::SearchActive, S::SkippedExists, S::FailedPermanent],
        S::SearchActive => &[
            S::SearchComplete,
            S::SearchNoResults,
            S::SkippedExists,
            S::FailedPermanent,
            S::SearchQueued,
        ],
        S::SearchComplete => &[
            S::DownloadQueued,
            S::DownloadActive,
            S::SearchCompleteQuotaExhausted,
            S::FailedPermanent,
        ],
        S::SearchCompleteQuotaExhausted => &[
            S::DownloadQueued,
            S::DownloadActive,
            S::SearchComplete,
            S::FailedPermanent,
        ],
        S::SearchNoResults => &[S::SearchQueued, S::FailedPermanent],

        // Download
        S::DownloadQueued => &[
            S::DownloadActive,
            S::FailedPermanent,
            S::SearchComplete,
            S::SearchCompleteQuotaExhausted,
        ],
        S::DownloadActive => &[
            S::DownloadComplete,
            S::DownloadFailed,
            S::FailedPermanent,
            S::DownloadQueued,
            S::SearchComplete,
            S::SearchCompleteQuotaExhausted,
        ],
        S::DownloadComplete => &[S::UploadQueued, S::Completed, S::FailedPermanent],
        S::DownloadFailed => &[S::DownloadQueued, S::FailedPermanent, S::SearchComplete],

        // Upload
        S::UploadQueued => &[S::UploadActive, S::FailedPermanent],
        S::UploadActive => &[
            S::UploadComplete,
            S::UploadFailed,
            S::FailedPermanent,
            S::UploadQueued,
        ],
        S::UploadComplete => &[S::Completed],
        S::UploadFailed => &[S::UploadQueued, S::FailedPermanent],

        // Terminal: COMPLETED and SKIPPED_EXISTS never leave; permanent
        // failure has an explicit re-open path.
        S::Completed | S::SkippedExists => &[],
        S::FailedPermanent => &[
            S::New,
            S::SearchQueued,
            S::DownloadQueued,
            S::UploadQueued,
        ],
    }
}

/// `true` when `from -> to` is in the allowed set.
#[must_use]
pub fn is_valid_transition(from: ItemStatus, to: ItemStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// The stage whose task must be scheduled once `status` commits, if any.
#[must_use]
pub fn next_stage_after(status: ItemStatus) -> Option<Stage> {
    match status {
        ItemStatus::DetailComplete => Some(Stage::Search),
        ItemStatus::SearchComplete => Some(Stage::Download),
        ItemStatus::DownloadComplete => Some(Stage::Upload),
        _ => None,
    }
}

/// The fixed status set shown for a stage in `items by stage` lookups.
#[must_use]
pub fn stage_statuses(stage: Stage) -> &'static [ItemStatus] {
    match stage {
        Stage::Detail => &[
            ItemStatus::New,
            ItemStatus::DetailFetching,
            ItemStatus::DetailComplete,
        ],
        Stage::Search => &[
            ItemStatus::SearchQueued,
            ItemStatus::SearchActive,
            ItemStatus::SearchComplete,
            ItemStatus::SearchCompleteQuotaExhausted,
            ItemStatus::SearchNoResults,
        ],
        Stage::Download => &[
            ItemStatus::DownloadQueued,
            ItemStatus::DownloadActive,
            ItemStatus::DownloadComplete,
            ItemStatus::DownloadFailed,
        ],
        Stage::Upload => &[
            ItemStatus::UploadQueued,
            ItemStatus::UploadActive,
            ItemStatus::UploadComplete,
            ItemStatus::UploadFailed,
        ],
    }
}

/// Extra context for a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext<'a> {
    /// Handler wall time in seconds, recorded in the history row.
    pub processing_time: Option<f64>,
    /// Retry counter carried into the history row.
    pub retry_count: i64,
    /// Error message recorded on the item and the history row.
    pub error: Option<&'a str>,
}

/// Guards item state-machine transitions and writes history.
pub struct StateManager {
    store: Store,
    schedule_tx: OnceLock<mpsc::UnboundedSender<ScheduleRequest>>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager").finish_non_exhaustive()
    }
}

impl StateManager {
    /// Creates a state manager over the given store.
    #[must_use]
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            schedule_tx: OnceLock::new(),
            notifier,
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Attaches the scheduler's request channel.
    ///
    /// Called once during engine assembly, after both components exist.
    pub fn attach_scheduler(&self, tx: mpsc::UnboundedSender<ScheduleRequest>) {
        if self.schedule_tx.set(tx).is_err() {
            warn!("scheduler channel already attached");
        }
    }

    fn send_schedule_request(&self, request: ScheduleRequest) {
        match self.schedule_tx.get() {
            Some(tx) => {
                if tx.send(request).is_err() {
                    warn!("scheduler channel closed, request dropped");
                }
            }
            None => warn!("no scheduler attached, request dropped"),
        }
    }

    /// Performs a transition in its own short transaction.
    ///
    /// On success, commits; when the new state is a `_COMPLETE`
    /// precursor, the implicit pre-queue transition runs and the next
    /// stage's task is scheduled. Direct transitions *into* `_QUEUED`
    /// states never schedule anything themselves.
    ///
    /// Invalid edges return `Ok(false)` (logged); store errors propagate.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn transition(
        &self,
        item_id: i64,
        to: ItemStatus,
        reason: &str,
    ) -> Result<bool, EngineError> {
        self.transition_full(item_id, to, reason, TransitionContext::default())
            .await
    }

    /// [`Self::transition`] with processing time / retry / error context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self, reason, ctx), fields(to = %to))]
    pub async fn transition_full(
        &self,
        item_id: i64,
        to: ItemStatus,
        reason: &str,
        ctx: TransitionContext<'_>,
    ) -> Result<bool, EngineError> {
        self.transition_with(item_id, to, reason, ctx, true).await
    }

    /// Transition without the implicit next-stage follow-up.
    ///
    /// Administrative moves (limit-exhausted rollback, quota sweeps) use
    /// this so landing on `SEARCH_COMPLETE` does not immediately pre-queue
    /// the download stage again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn transition_quiet(
        &self,
        item_id: i64,
        to: ItemStatus,
        reason: &str,
        ctx: TransitionContext<'_>,
    ) -> Result<bool, EngineError> {
        self.transition_with(item_id, to, reason, ctx, false).await
    }

    async fn transition_with(
        &self,
        item_id: i64,
        to: ItemStatus,
        reason: &str,
        ctx: TransitionContext<'_>,
        schedule_next: bool,
    ) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let applied = self.transition_in(&mut tx, item_id, to, reason, ctx).await?;
        if !applied {
            return Ok(false);
        }
        tx.commit().await?;

        if schedule_next && !to.is_queued_family() {
            self.schedule_next_stage_if_needed(item_id, to).await?;
        }
        Ok(true)
    }

    /// Performs a transition inside the caller's session.
    ///
    /// The caller owns the commit; no next-stage scheduling happens here.
    /// Invalid edges and missing items return `Ok(false)` (logged).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn transition_in(
        &self,
        conn: &mut SqliteConnection,
        item_id: i64,
        to: ItemStatus,
        reason: &str,
        ctx: TransitionContext<'_>,
    ) -> Result<bool, EngineError> {
        let Some(item) = Store::get_item_in(conn, item_id).await? else {
            error!(item_id, "transition target item does not exist");
            return Ok(false);
        };

        let from = item.status();
        if !is_valid_transition(from, to) {
            error!(
                item_id,
                from = %from,
                to = %to,
                "invalid state transition"
            );
            return Ok(false);
        }

        info!(item_id, from = %from, to = %to, reason, "state transition");

        Store::update_item_status_in(conn, item_id, to, ctx.error).await?;
        Store::insert_history_in(
            conn,
            item_id,
            Some(from),
            to,
            Some(reason),
            ctx.error,
            ctx.processing_time,
            ctx.retry_count,
        )
        .await?;

        self.maybe_notify(&item, from, to, reason);
        Ok(true)
    }

    /// Schedules the next stage after a `_COMPLETE` precursor commits.
    ///
    /// Runs the implicit pre-queue transition (`X_COMPLETE -> next
    /// _QUEUED`) in its own transaction, guarded against concurrent
    /// movement, then publishes a schedule request with a small delay.
    /// The pre-queue transition does not re-trigger scheduling.
    ///
    /// Also exposed to the pipeline, whose in-session transitions need
    /// the same follow-up once their transaction commits.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn schedule_next_stage_if_needed(
        &self,
        item_id: i64,
        current: ItemStatus,
    ) -> Result<(), EngineError> {
        let Some(stage) = next_stage_after(current) else {
            return Ok(());
        };
        let queued = stage.retry_state();

        let mut tx = self.store.begin().await?;
        let Some(item) = Store::get_item_in(&mut tx, item_id).await? else {
            return Ok(());
        };
        if item.status() != current {
            // Someone moved the item between commit and here; their
            // transition owns the follow-up scheduling.
            warn!(item_id, status = %item.status(), "item moved, skipping pre-queue");
            return Ok(());
        }
        Store::update_item_status_in(&mut tx, item_id, queued, None).await?;
        Store::insert_history_in(
            &mut tx,
            item_id,
            Some(current),
            queued,
            Some(&format!("preparing {stage} stage")),
            None,
            None,
            0,
        )
        .await?;
        tx.commit().await?;

        debug!(item_id, stage = %stage, "scheduling next stage");
        self.send_schedule_request(ScheduleRequest {
            item_id,
            stage,
            priority: TaskPriority::Normal,
            delay_seconds: NEXT_STAGE_DELAY_SECS,
        });
        Ok(())
    }

    fn maybe_notify(&self, item: &Item, from: ItemStatus, to: ItemStatus, reason: &str) {
        let newsworthy = matches!(
            to,
            ItemStatus::Completed
                | ItemStatus::SkippedExists
                | ItemStatus::FailedPermanent
                | ItemStatus::SearchNoResults
                | ItemStatus::DownloadFailed
                | ItemStatus::UploadFailed
        );
        if !newsworthy {
            return;
        }
        notify_detached(
            &self.notifier,
            format!("{}: {from} -> {to} ({reason})", item.title),
        );
    }

    // ==================== Lookups ====================

    /// Items currently in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn items_by_status(
        &self,
        status: ItemStatus,
        limit: Option<i64>,
    ) -> Result<Vec<Item>, EngineError> {
        Ok(self.store.items_by_status(status, limit).await?)
    }

    /// Items currently anywhere inside a stage's status set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn items_by_stage(
        &self,
        stage: Stage,
        limit: Option<i64>,
    ) -> Result<Vec<Item>, EngineError> {
        Ok(self
            .store
            .items_with_status_in(stage_statuses(stage), limit)
            .await?)
    }

    /// `(status, count)` histogram over all items.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn status_histogram(&self) -> Result<Vec<(String, i64)>, EngineError> {
        Ok(self.store.status_histogram().await?)
    }

    /// Most recent transitions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn recent_history(
        &self,
        limit: i64,
    ) -> Result<Vec<crate::store::StatusHistoryEntry>, EngineError> {
        Ok(self.store.recent_history(limit).await?)
    }

    // ==================== Reconciliation helpers ====================

    /// Maps every in-flight (`*_ACTIVE` / `DETAIL_FETCHING`) item back to
    /// its stage's queued state. Run at startup; a crash mid-execution
    /// leaves items in the active family.
    ///
    /// Applying this twice has the same effect as once: the first pass
    /// drains the active family and queued states have no active targets.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self))]
    pub async fn recover_from_crash(&self) -> Result<u64, EngineError> {
        let active = self
            .store
            .items_with_status_in(
                &[
                    ItemStatus::DetailFetching,
                    ItemStatus::SearchActive,
                    ItemStatus::DownloadActive,
                    ItemStatus::UploadActive,
                ],
                None,
            )
            .await?;

        let mut recovered = 0;
        for item in active {
            let target = match item.status() {
                ItemStatus::DetailFetching => ItemStatus::New,
                ItemStatus::SearchActive => ItemStatus::SearchQueued,
                ItemStatus::DownloadActive => ItemStatus::DownloadQueued,
                ItemStatus::UploadActive => ItemStatus::UploadQueued,
                _ => continue,
            };
            if self.transition(item.id, target, "crash recovery").await? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "crash recovery reset in-flight items");
        }
        Ok(recovered)
    }

    /// Re-schedules tasks for queued items that have no open task row.
    ///
    /// Covers the window where a crash landed between committing a state
    /// and scheduling its follow-up task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    pub async fn reschedule_queued_items(&self) -> Result<u64, EngineError> {
        let mapping: &[(ItemStatus, Stage)] = &[
            (ItemStatus::New, Stage::Detail),
            (ItemStatus::SearchQueued, Stage::Search),
            (ItemStatus::DetailComplete, Stage::Search),
            (ItemStatus::DownloadQueued, Stage::Download),
            (ItemStatus::SearchComplete, Stage::Download),
            (ItemStatus::UploadQueued, Stage::Upload),
            (ItemStatus::DownloadComplete, Stage::Upload),
        ];

        let mut scheduled = 0;
        for (status, stage) in mapping {
            for item in self.store.items_by_status(*status, None).await? {
                if self.store.find_open_task(item.id, *stage).await?.is_none() {
                    self.send_schedule_request(ScheduleRequest {
                        item_id: item.id,
                        stage: *stage,
                        priority: TaskPriority::Normal,
                        delay_seconds: NEXT_STAGE_DELAY_SECS,
                    });
                    scheduled += 1;
                }
            }
        }
        if scheduled > 0 {
            info!(scheduled, "re-scheduled tasks for queued items");
        }
        Ok(scheduled)
    }

    /// Resets items that sat in an in-flight status longer than
    /// `timeout_minutes`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self))]
    pub async fn reset_stuck(&self, timeout_minutes: i64) -> Result<u64, EngineError> {
        let stuck = self
            .store
            .items_stuck_since(
                &[
                    ItemStatus::DetailFetching,
                    ItemStatus::SearchActive,
                    ItemStatus::DownloadActive,
                    ItemStatus::UploadActive,
                ],
                timeout_minutes,
            )
            .await?;

        let mut reset = 0;
        for item in stuck {
            let target = match item.status() {
                ItemStatus::DetailFetching => ItemStatus::New,
                ItemStatus::SearchActive => ItemStatus::SearchQueued,
                ItemStatus::DownloadActive => ItemStatus::DownloadQueued,
                ItemStatus::UploadActive => ItemStatus::UploadQueued,
                _ => continue,
            };
            let reason = format!("stuck reset after {timeout_minutes} minutes");
            if self.transition(item.id, target, &reason).await? {
                reset += 1;
            }
        }
        if reset > 0 {
            info!(reset, "reset stuck items");
        }
        Ok(reset)
    }

    /// Resets `DETAIL_FETCHING` items older than `timeout_hours` back to
    /// `NEW`. The history retry counter is carried, never zeroed here.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self))]
    pub async fn reset_stale_detail_fetching(&self, timeout_hours: i64) -> Result<u64, EngineError> {
        let stale = self
            .store
            .items_stuck_since(&[ItemStatus::DetailFetching], timeout_hours * 60)
            .await?;

        let mut reset = 0;
        for item in stale {
            let reason = format!("stale detail fetch reset after {timeout_hours} hours");
            if self.transition(item.id, ItemStatus::New, &reason).await? {
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Cancels open task rows that no longer match their item.
    ///
    /// A task is cancelled iff the item does not exist, the item's status
    /// is outside the stage's acceptable set, or the item is parked in a
    /// status that allows no tasks at all.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self))]
    pub async fn cleanup_mismatched_tasks(&self) -> Result<u64, EngineError> {
        let open = self
            .store
            .tasks_with_status_in(&[TaskStatus::Queued, TaskStatus::Active])
            .await?;

        let mut to_cancel = Vec::new();
        for task in open {
            let Some(stage) = task.stage() else {
                warn!(task_id = task.id, stage = %task.stage_str, "task has unknown stage");
                to_cancel.push(task.id);
                continue;
            };

            match self.store.get_item(task.item_id).await? {
                None => {
                    info!(task_id = task.id, item_id = task.item_id, "task item missing");
                    to_cancel.push(task.id);
                }
                Some(item) => {
                    let status = item.status();
                    if TASKLESS_STATUSES.contains(&status)
                        || !stage.acceptable_states().contains(&status)
                    {
                        info!(
                            task_id = task.id,
                            item_id = task.item_id,
                            status = %status,
                            stage = %stage,
                            "task does not match item state"
                        );
                        to_cancel.push(task.id);
                    }
                }
            }
        }

        let cancelled = self
            .store
            .cancel_tasks(&to_cancel, "item state does not match task stage")
            .await?;
        if cancelled > 0 {
            info!(cancelled, "cancelled mismatched tasks");
        }
        Ok(cancelled)
    }

    /// Rolls every item in `DOWNLOAD_{QUEUED,ACTIVE,FAILED}` back to
    /// `SEARCH_COMPLETE` after the remote download limit is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store fails.
    #[instrument(skip(self))]
    pub async fn rollback_download_tasks_when_limit_exhausted(
        &self,
        reset_time: Option<&str>,
    ) -> Result<u64, EngineError> {
        let mut reason = "download limit exhausted, returning to search complete".to_string();
        if let Some(reset) = reset_time {
            reason.push_str(&format!(", resets at {reset}"));
        }

        let affected = self
            .store
            .items_with_status_in(
                &[
                    ItemStatus::DownloadQueued,
                    ItemStatus::DownloadActive,
                    ItemStatus::DownloadFailed,
                ],
                None,
            )
            .await?;

        let mut rolled_back = 0;
        for item in affected {
            let ctx = TransitionContext {
                error: Some(&reason),
                ..TransitionContext::default()
            };
            if self
                .transition_quiet(item.id, ItemStatus::SearchComplete, &reason, ctx)
                .await?
            {
                rolled_back += 1;
            }
        }
        if rolled_back > 0 {
            info!(rolled_back, "rolled back download items to search complete");
        }
        Ok(rolled_back)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sources::NullNotifier;
    use crate::store::NewItem;

    async fn manager() -> (StateManager, mpsc::UnboundedReceiver<ScheduleRequest>) {
        let db = Database::in_memory().await.unwrap();
        let state = StateManager::new(Store::new(db), Arc::new(NullNotifier));
        let (tx, rx) = mpsc::unbounded_channel();
        state.attach_scheduler(tx);
        (state, rx)
    }

    async fn seed_item(state: &StateManager) -> i64 {
        state
            .store()
            .insert_item(&NewItem {
                title: "Dune".to_string(),
                author: Some("Frank Herbert".to_string()),
                external_id: Some("src-1".to_string()),
                source_url: None,
            })
            .await
            .unwrap()
    }

    // ==================== Edge Table Tests ====================

    #[test]
    fn test_forward_edges_per_stage() {
        assert!(is_valid_transition(ItemStatus::New, ItemStatus::DetailFetching));
        assert!(is_valid_transition(ItemStatus::SearchQueued, ItemStatus::SearchActive));
        assert!(is_valid_transition(ItemStatus::SearchActive, ItemStatus::SearchComplete));
        assert!(is_valid_transition(ItemStatus::SearchActive, ItemStatus::SearchNoResults));
        assert!(is_valid_transition(ItemStatus::DownloadQueued, ItemStatus::DownloadActive));
        assert!(is_valid_transition(ItemStatus::DownloadActive, ItemStatus::DownloadComplete));
        assert!(is_valid_transition(ItemStatus::UploadActive, ItemStatus::UploadComplete));
        assert!(is_valid_transition(ItemStatus::UploadComplete, ItemStatus::Completed));
    }

    #[test]
    fn test_retry_rollback_edges() {
        assert!(is_valid_transition(ItemStatus::DetailFetching, ItemStatus::New));
        assert!(is_valid_transition(ItemStatus::SearchActive, ItemStatus::SearchQueued));
        assert!(is_valid_transition(ItemStatus::DownloadActive, ItemStatus::DownloadQueued));
        assert!(is_valid_transition(ItemStatus::UploadActive, ItemStatus::UploadQueued));
    }

    #[test]
    fn test_quota_edges() {
        assert!(is_valid_transition(
            ItemStatus::SearchComplete,
            ItemStatus::SearchCompleteQuotaExhausted
        ));
        assert!(is_valid_transition(
            ItemStatus::SearchCompleteQuotaExhausted,
            ItemStatus::SearchComplete
        ));
        assert!(is_valid_transition(
            ItemStatus::SearchCompleteQuotaExhausted,
            ItemStatus::DownloadQueued
        ));
        assert!(is_valid_transition(
            ItemStatus::DownloadQueued,
            ItemStatus::SearchCompleteQuotaExhausted
        ));
        assert!(is_valid_transition(
            ItemStatus::DownloadActive,
            ItemStatus::SearchCompleteQuotaExhausted
        ));
    }

    #[test]
    fn test_download_limit_rollback_edges() {
        for from in [
            ItemStatus::DownloadQueued,
            ItemStatus::DownloadActive,
            ItemStatus::DownloadFailed,
        ] {
            assert!(
                is_valid_transition(from, ItemStatus::SearchComplete),
                "{from} must roll back to search complete"
            );
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        assert!(allowed_targets(ItemStatus::Completed).is_empty());
        assert!(allowed_targets(ItemStatus::SkippedExists).is_empty());
    }

    #[test]
    fn test_failed_permanent_reopen_paths() {
        for to in [
            ItemStatus::New,
            ItemStatus::SearchQueued,
            ItemStatus::DownloadQueued,
            ItemStatus::UploadQueued,
        ] {
            assert!(is_valid_transition(ItemStatus::FailedPermanent, to));
        }
        assert!(!is_valid_transition(ItemStatus::FailedPermanent, ItemStatus::Completed));
    }

    #[test]
    fn test_any_non_terminal_can_fail_permanently() {
        for from in [
            ItemStatus::New,
            ItemStatus::DetailFetching,
            ItemStatus::SearchQueued,
            ItemStatus::SearchActive,
            ItemStatus::DownloadQueued,
            ItemStatus::DownloadActive,
            ItemStatus::UploadQueued,
            ItemStatus::UploadActive,
        ] {
            assert!(is_valid_transition(from, ItemStatus::FailedPermanent));
        }
    }

    // ==================== Transition Tests ====================

    #[tokio::test]
    async fn test_transition_writes_item_and_history_atomically() {
        let (state, _rx) = manager().await;
        let id = seed_item(&state).await;

        assert!(
            state
                .transition(id, ItemStatus::DetailFetching, "detail stage started")
                .await
                .unwrap()
        );

        let item = state.store().get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::DetailFetching);

        let history = state.store().history_for_item(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].old_status(), Some(ItemStatus::New));
        assert_eq!(history[1].new_status(), Some(ItemStatus::DetailFetching));
        assert_eq!(history[1].change_reason.as_deref(), Some("detail stage started"));
    }

    #[tokio::test]
    async fn test_invalid_transition_returns_false_without_history() {
        let (state, _rx) = manager().await;
        let id = seed_item(&state).await;

        assert!(
            !state
                .transition(id, ItemStatus::UploadComplete, "nonsense")
                .await
                .unwrap()
        );

        let item = state.store().get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::New);
        assert_eq!(state.store().history_for_item(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_missing_item_returns_false() {
        let (state, _rx) = manager().await;
        assert!(
            !state
                .transition(999, ItemStatus::DetailFetching, "ghost")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_transition_records_error_message() {
        let (state, _rx) = manager().await;
        let id = seed_item(&state).await;

        let ctx = TransitionContext {
            error: Some("dns lookup failed"),
            retry_count: 2,
            ..TransitionContext::default()
        };
        state
            .transition_full(id, ItemStatus::FailedPermanent, "detail stage failed", ctx)
            .await
            .unwrap();

        let item = state.store().get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::FailedPermanent);
        assert_eq!(item.error_message.as_deref(), Some("dns lookup failed"));

        let history = state.store().history_for_item(id).await.unwrap();
        assert_eq!(history[1].retry_count, 2);
        assert_eq!(history[1].error_message.as_deref(), Some("dns lookup failed"));
    }

    // ==================== Pre-queue / Scheduling Tests ====================

    #[tokio::test]
    async fn test_complete_precursor_prequeues_and_schedules() {
        let (state, mut rx) = manager().await;
        let id = seed_item(&state).await;

        state
            .transition(id, ItemStatus::DetailFetching, "detail stage started")
            .await
            .unwrap();
        state
            .transition(id, ItemStatus::DetailComplete, "detail stage succeeded")
            .await
            .unwrap();

        // Implicit pre-queue transition happened
        let item = state.store().get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::SearchQueued);

        // Exactly one schedule request for the search stage
        let request = rx.try_recv().unwrap();
        assert_eq!(request.item_id, id);
        assert_eq!(request.stage, Stage::Search);
        assert_eq!(request.delay_seconds, NEXT_STAGE_DELAY_SECS);
        assert!(rx.try_recv().is_err());

        // History shows the pre-queue hop
        let history = state.store().history_for_item(id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.old_status(), Some(ItemStatus::DetailComplete));
        assert_eq!(last.new_status(), Some(ItemStatus::SearchQueued));
    }

    #[tokio::test]
    async fn test_queued_transition_does_not_schedule() {
        let (state, mut rx) = manager().await;
        let id = seed_item(&state).await;

        state
            .transition(id, ItemStatus::DetailFetching, "detail stage started")
            .await
            .unwrap();
        state
            .transition(id, ItemStatus::New, "recoverable failure")
            .await
            .unwrap();

        assert!(rx.try_recv().is_err(), "queued re-entry must not schedule");
    }

    #[tokio::test]
    async fn test_upload_complete_has_no_next_stage() {
        assert_eq!(next_stage_after(ItemStatus::UploadComplete), None);
        assert_eq!(next_stage_after(ItemStatus::DetailComplete), Some(Stage::Search));
        assert_eq!(next_stage_after(ItemStatus::SearchComplete), Some(Stage::Download));
        assert_eq!(next_stage_after(ItemStatus::DownloadComplete), Some(Stage::Upload));
    }

    // ==================== Reconciliation Tests ====================

    #[tokio::test]
    async fn test_recover_from_crash_is_idempotent() {
        let (state, _rx) = manager().await;
        let id = seed_item(&state).await;
        state
            .transition(id, ItemStatus::DetailFetching, "detail stage started")
            .await
            .unwrap();

        assert_eq!(state.recover_from_crash().await.unwrap(), 1);
        let item = state.store().get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::New);

        // Second application is a no-op
        assert_eq!(state.recover_from_crash().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_stuck_only_touches_old_items() {
        let (state, _rx) = manager().await;
        let id = seed_item(&state).await;
        state
            .transition(id, ItemStatus::DetailFetching, "detail stage started")
            .await
            .unwrap();

        assert_eq!(state.reset_stuck(30).await.unwrap(), 0, "fresh item untouched");

        sqlx::query("UPDATE items SET updated_at = datetime('now', '-1 hours') WHERE id = ?")
            .bind(id)
            .execute(state.store().database().pool())
            .await
            .unwrap();

        assert_eq!(state.reset_stuck(30).await.unwrap(), 1);
        let item = state.store().get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::New);
    }

    #[tokio::test]
    async fn test_reset_stale_detail_fetching_uses_hour_cutoff() {
        let (state, _rx) = manager().await;
        let id = seed_item(&state).await;
        state
            .transition(id, ItemStatus::DetailFetching, "detail stage started")
            .await
            .unwrap();

        sqlx::query("UPDATE items SET updated_at = datetime('now', '-4 hours') WHERE id = ?")
            .bind(id)
            .execute(state.store().database().pool())
            .await
            .unwrap();

        assert_eq!(state.reset_stale_detail_fetching(3).await.unwrap(), 1);
        let item = state.store().get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::New);
    }

    #[tokio::test]
    async fn test_cleanup_mismatched_tasks_cancels_terminal_and_mismatched() {
        let (state, _rx) = manager().await;
        let id = seed_item(&state).await;

        // A detail task is fine while the item is NEW
        let ok_task = state
            .store()
            .insert_task(id, Stage::Detail, 5, 3, 0, None)
            .await
            .unwrap();
        // A download task does not match a NEW item
        let bad_task = state
            .store()
            .insert_task(id, Stage::Download, 5, 3, 0, None)
            .await
            .unwrap();

        assert_eq!(state.cleanup_mismatched_tasks().await.unwrap(), 1);
        assert_eq!(
            state.store().get_task(ok_task).await.unwrap().unwrap().status(),
            TaskStatus::Queued
        );
        assert_eq!(
            state.store().get_task(bad_task).await.unwrap().unwrap().status(),
            TaskStatus::Cancelled
        );

        // Terminal item invalidates the remaining task too
        state
            .transition(id, ItemStatus::FailedPermanent, "operator gave up")
            .await
            .unwrap();
        assert_eq!(state.cleanup_mismatched_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_download_tasks_when_limit_exhausted() {
        let (state, _rx) = manager().await;

        let mut ids = Vec::new();
        for n in 0..3 {
            let id = state
                .store()
                .insert_item(&NewItem {
                    title: format!("Book {n}"),
                    external_id: Some(format!("src-{n}")),
                    ..NewItem::default()
                })
                .await
                .unwrap();
            // Walk to DOWNLOAD_QUEUED through valid edges
            for (to, why) in [
                (ItemStatus::DetailFetching, "detail stage started"),
                (ItemStatus::DetailComplete, "detail stage succeeded"),
            ] {
                state.transition(id, to, why).await.unwrap();
            }
            // Pre-queue moved it to SEARCH_QUEUED
            for (to, why) in [
                (ItemStatus::SearchActive, "search stage started"),
                (ItemStatus::SearchComplete, "search stage succeeded"),
            ] {
                state.transition(id, to, why).await.unwrap();
            }
            ids.push(id);
        }

        // All three sit in DOWNLOAD_QUEUED after the pre-queue hop
        for id in &ids {
            let item = state.store().get_item(*id).await.unwrap().unwrap();
            assert_eq!(item.status(), ItemStatus::DownloadQueued);
        }

        let rolled = state
            .rollback_download_tasks_when_limit_exhausted(Some("2026-08-02T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(rolled, 3);

        for id in &ids {
            let item = state.store().get_item(*id).await.unwrap().unwrap();
            assert_eq!(item.status(), ItemStatus::SearchComplete);
            assert!(item.error_message.unwrap().contains("2026-08-02T00:00:00Z"));
        }
    }

    #[tokio::test]
    async fn test_reschedule_queued_items_skips_open_tasks() {
        let (state, mut rx) = manager().await;
        let id = seed_item(&state).await;

        // NEW item without a task gets one request
        assert_eq!(state.reschedule_queued_items().await.unwrap(), 1);
        let request = rx.try_recv().unwrap();
        assert_eq!(request.stage, Stage::Detail);

        // With an open task row, nothing is re-scheduled
        state
            .store()
            .insert_task(id, Stage::Detail, 5, 3, 0, None)
            .await
            .unwrap();
        assert_eq!(state.reschedule_queued_items().await.unwrap(), 0);
    }
}
