//! CLI entry point for the bookflow engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use bookflow_core::feed::Feeder;
use bookflow_core::pipeline::PipelineManager;
use bookflow_core::reconciler::Reconciler;
use bookflow_core::scheduler::{StageDispatcher, TaskScheduler};
use bookflow_core::sources::{
    BookDownloader, HttpLibraryClient, HttpRepoClient, HttpTransfer, JsonFeedSource,
    LibraryIngest, ListSource, Notifier, NullNotifier, QuotaSource, SearchProvider,
    WebhookNotifier,
};
use bookflow_core::stages::{DetailStage, DownloadStage, SearchStage, UploadStage};
use bookflow_core::store::TaskStatus;
use bookflow_core::{Database, EngineConfig, QuotaManager, StateManager, Store};

mod cli;

use cli::{Args, Command};

/// Upper bound on draining the pipeline in `run-once` mode.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often the quota watcher polls.
const QUOTA_POLL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.debug {
        config = config.with_debug();
    }

    info!("bookflow starting");

    match args.command {
        Command::RunOnce => run_once(config).await,
        Command::Daemon { feed_interval_secs } => daemon(config, feed_interval_secs).await,
        Command::Status => status(config).await,
        Command::Cleanup => cleanup(config).await,
    }
}

/// Fully assembled engine for the run modes.
struct Engine {
    store: Store,
    scheduler: Arc<TaskScheduler>,
    pipeline: Arc<PipelineManager>,
    reconciler: Arc<Reconciler>,
    feeder: Feeder,
}

async fn open_store(config: &EngineConfig) -> Result<Store> {
    let db = Database::open(&config.store_url)
        .await
        .with_context(|| format!("opening store at {}", config.store_url.display()))?;
    Ok(Store::new(db))
}

async fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let Some(feed_path) = config.endpoints.feed_path.clone() else {
        bail!("endpoints.feed_path is not configured");
    };
    let Some(repository_url) = config.endpoints.repository_url.clone() else {
        bail!("endpoints.repository_url is not configured");
    };
    let Some(library_url) = config.endpoints.library_url.clone() else {
        bail!("endpoints.library_url is not configured");
    };

    let store = open_store(config).await?;

    let notifier: Arc<dyn Notifier> = match config.endpoints.notify_webhook.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(NullNotifier),
    };

    let state = Arc::new(StateManager::new(store.clone(), Arc::clone(&notifier)));
    let (schedule_tx, schedule_rx) = tokio::sync::mpsc::unbounded_channel();
    state.attach_scheduler(schedule_tx.clone());

    let transfer = HttpTransfer::new(config.http_timeout_secs);
    let repo = Arc::new(HttpRepoClient::new(&repository_url, transfer));
    let library = Arc::new(HttpLibraryClient::new(&library_url, config.http_timeout_secs));
    let feed_source = Arc::new(JsonFeedSource::new(feed_path));

    let quota = Arc::new(QuotaManager::new(
        Arc::clone(&repo) as Arc<dyn QuotaSource>,
        config.quota.cache_ttl_minutes,
    ));

    let scheduler = TaskScheduler::new(
        store.clone(),
        Arc::clone(&state),
        config.max_concurrent_tasks,
        config.scheduler.task_gc_completed_hours,
        config.scheduler.task_gc_failed_hours,
        schedule_rx,
    );

    let pipeline = PipelineManager::new(
        store.clone(),
        Arc::clone(&state),
        Arc::clone(&quota),
        schedule_tx.clone(),
        Arc::clone(&notifier),
        config.max_workers,
        config.quota.check_every_n_dispatches,
        QUOTA_POLL_SECS,
    );
    pipeline.register_stage(Arc::new(DetailStage::new(
        Arc::clone(&feed_source) as Arc<dyn ListSource>,
    )));
    pipeline.register_stage(Arc::new(SearchStage::new(
        Arc::clone(&repo) as Arc<dyn SearchProvider>,
        Arc::clone(&library) as Arc<dyn LibraryIngest>,
        &config.search,
    )));
    pipeline.register_stage(Arc::new(DownloadStage::new(
        Arc::clone(&repo) as Arc<dyn BookDownloader>,
        Arc::clone(&quota),
        config.download_dir.clone(),
    )));
    pipeline.register_stage(Arc::new(UploadStage::new(
        Arc::clone(&library) as Arc<dyn LibraryIngest>,
    )));

    scheduler.register_dispatcher(Arc::clone(&pipeline) as Arc<dyn StageDispatcher>);
    pipeline.attach_scheduler(&scheduler);

    let reconciler = Reconciler::new(
        Arc::clone(&state),
        config.scheduler.stuck_minutes,
        config.detail_stale_hours,
    );

    let feeder = Feeder::new(store.clone(), feed_source, schedule_tx);

    Ok(Engine {
        store,
        scheduler,
        pipeline,
        reconciler,
        feeder,
    })
}

/// Waits until the scheduler has neither queued nor in-flight tasks.
async fn wait_for_drain(scheduler: &Arc<TaskScheduler>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut idle_passes = 0;
    while tokio::time::Instant::now() < deadline {
        let snapshot = scheduler.snapshot();
        if snapshot.queue_size == 0 && snapshot.active_tasks == 0 {
            idle_passes += 1;
            // A few quiet passes in a row: follow-up scheduling settled
            if idle_passes >= 3 {
                return true;
            }
        } else {
            idle_passes = 0;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}

async fn run_once(config: EngineConfig) -> Result<()> {
    let engine = build_engine(&config).await?;

    engine.pipeline.reset_stage_flags().await;
    engine.scheduler.cancel_stale_active_tasks().await?;
    engine.reconciler.run_startup().await?;
    engine.scheduler.restore_queued_tasks().await?;

    let summary = engine.feeder.feed_once().await?;
    info!(
        discovered = summary.discovered,
        inserted = summary.inserted,
        "feed finished"
    );

    let scheduler_handle = TaskScheduler::start(&engine.scheduler);
    let watcher_handle = PipelineManager::start_quota_watcher(&engine.pipeline);

    let drained = wait_for_drain(&engine.scheduler, DRAIN_TIMEOUT).await;
    if !drained {
        warn!("drain timeout reached, stopping with work remaining");
    }
    report_gating(&engine.pipeline);

    engine.pipeline.stop();
    engine.scheduler.stop().await?;
    let _ = scheduler_handle.await;
    let _ = watcher_handle.await;

    print_histogram(&engine.store).await?;
    Ok(())
}

/// Logs stage pauses and the quota view at the end of a run, so an
/// operator sees why items were left behind.
fn report_gating(pipeline: &PipelineManager) {
    for (stage, reason) in pipeline.paused_stages() {
        warn!(stage = %stage, reason, "stage is paused");
    }
    let quota = pipeline.get_quota_status();
    if let (Some(remaining), Some(daily_limit)) = (quota.remaining, quota.daily_limit) {
        info!(remaining, daily_limit, "download quota");
    }
}

async fn daemon(config: EngineConfig, feed_interval_secs: u64) -> Result<()> {
    let engine = build_engine(&config).await?;

    engine.pipeline.reset_stage_flags().await;
    engine.scheduler.cancel_stale_active_tasks().await?;
    engine.reconciler.run_startup().await?;
    engine.scheduler.restore_queued_tasks().await?;

    let scheduler_handle = TaskScheduler::start(&engine.scheduler);
    let watcher_handle = PipelineManager::start_quota_watcher(&engine.pipeline);
    let reconciler_handle = Reconciler::start(&engine.reconciler);

    let feed_interval = Duration::from_secs(feed_interval_secs.max(60));
    info!(
        feed_interval_secs = feed_interval.as_secs(),
        "daemon running, ctrl-c to stop"
    );

    loop {
        match engine.feeder.feed_once().await {
            Ok(summary) if summary.inserted > 0 => {
                info!(inserted = summary.inserted, "new items discovered");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "feed pass failed"),
        }
        report_gating(&engine.pipeline);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = tokio::time::sleep(feed_interval) => {}
        }
    }

    info!("shutting down");
    engine.reconciler.stop();
    engine.pipeline.stop();
    engine.scheduler.stop().await?;
    let _ = scheduler_handle.await;
    let _ = watcher_handle.await;
    let _ = reconciler_handle.await;
    Ok(())
}

async fn status(config: EngineConfig) -> Result<()> {
    let store = open_store(&config).await?;

    println!("items by status:");
    let histogram = store.status_histogram().await?;
    if histogram.is_empty() {
        println!("  (no items)");
    }
    for (status, count) in &histogram {
        println!("  {status:<32} {count}");
    }

    println!("tasks:");
    for status in [
        TaskStatus::Queued,
        TaskStatus::Active,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        let count = store.tasks_with_status_in(&[status]).await?.len();
        println!("  {:<32} {count}", status.as_str());
    }

    println!("paused stages:");
    let paused: Vec<_> = store
        .stage_flags()
        .await?
        .into_iter()
        .filter(|flag| flag.paused)
        .collect();
    if paused.is_empty() {
        println!("  (none)");
    }
    for flag in &paused {
        println!(
            "  {:<32} {}",
            flag.stage,
            flag.pause_reason.as_deref().unwrap_or("no reason recorded")
        );
    }

    println!("quota:");
    match store.quota_state().await? {
        Some(quota) => {
            println!(
                "  {}/{} remaining (checked {}{})",
                quota.remaining,
                quota.daily_limit,
                quota.checked_at,
                quota
                    .next_reset
                    .as_deref()
                    .map(|reset| format!(", resets {reset}"))
                    .unwrap_or_default()
            );
        }
        None => println!("  (never checked)"),
    }

    println!("recent transitions:");
    for entry in store.recent_history(10).await? {
        println!(
            "  item {:<6} {} -> {} ({})",
            entry.item_id,
            entry.old_status.as_deref().unwrap_or("-"),
            entry.new_status,
            entry.change_reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cleanup(config: EngineConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let state = Arc::new(StateManager::new(store.clone(), Arc::new(NullNotifier)));
    // No scheduler in this one-shot mode; requests are drained and dropped
    let (schedule_tx, mut schedule_rx) = tokio::sync::mpsc::unbounded_channel();
    state.attach_scheduler(schedule_tx);
    tokio::spawn(async move { while schedule_rx.recv().await.is_some() {} });

    let reconciler = Reconciler::new(
        Arc::clone(&state),
        config.scheduler.stuck_minutes,
        config.detail_stale_hours,
    );

    let pass = reconciler.run_startup().await?;
    let stale = reconciler.run_stale_pass().await?;
    let collected = store
        .delete_expired_tasks(
            config.scheduler.task_gc_completed_hours,
            config.scheduler.task_gc_failed_hours,
        )
        .await?;

    println!("recovered items:      {}", pass.recovered);
    println!("cancelled tasks:      {}", pass.cancelled_tasks);
    println!("rescheduled items:    {}", pass.rescheduled);
    println!("stale detail resets:  {stale}");
    println!("gc'd task rows:       {collected}");
    Ok(())
}

async fn print_histogram(store: &Store) -> Result<()> {
    let histogram = store.status_histogram().await?;
    for (status, count) in &histogram {
        info!(status = %status, count, "final item status");
    }
    Ok(())
}
