//! Presence counter - anonymous WiFi presence sensing
//!
//! Captures device addresses on a monitor-mode adapter, rebuilds presence
//! intervals from the periodic snapshots, closes a session per day and
//! exports each session as a chart and as records posted to the analytics
//! endpoint.
//!
//! Module structure:
//! - `domain/` - Core types (Entry, intervals, sessions)
//! - `io/` - External interfaces (capture tool, sysfs, HTTP export, charts)
//! - `services/` - Pipeline stages (scheduler, resolver, sessionizer, consumers)
//! - `infra/` - Infrastructure (Config, Clock, SQLite, Metrics, Supervisor)

use anyhow::Context;
use clap::Parser;
use presence_counter::domain::SessionLabels;
use presence_counter::infra::{Clock, Config, Db, DurationStore, Metrics, Supervisor, SystemClock};
use presence_counter::io::{BatchExporter, SysfsDiscovery, TsharkCapture};
use presence_counter::services::queue::{IMAGES_QUEUE, SENDS_QUEUE};
use presence_counter::services::{
    CaptureScheduler, ConsumerStage, DurableQueue, IdentifierResolver, ImageExporter,
    SchedulerSettings, SessionSender, Sessionizer,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Presence counter - anonymous WiFi presence sensing
#[derive(Parser, Debug)]
#[command(name = "presence-counter", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Extra time granted to stages after the kill signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-cycle events
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // LOG_FORMAT=json for log shippers on deployed units
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        builder.json().init();
    } else {
        builder.init();
    }

    let args = Args::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "presence_counter_starting"
    );

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    info!(
        config_file = %config.config_file(),
        adapter = %config.capture_adapter(),
        capture_secs = config.capture_duration().as_secs(),
        rediscover_every = config.capture_rediscover_every(),
        fcfs_seq_id = %config.fcfs_seq_id(),
        device_tag = %config.device_tag(),
        durations_db = %config.durations_db(),
        queues_db = %config.queues_db(),
        export_enabled = config.export_enabled(),
        export_endpoint = %config.export_endpoint(),
        "config_loaded"
    );

    // Storage is required; no point capturing what cannot be kept
    let durations_db = Db::open(config.durations_db())
        .with_context(|| format!("opening durations database {}", config.durations_db()))?;
    let queues_db = Db::open(config.queues_db())
        .with_context(|| format!("opening queue database {}", config.queues_db()))?;
    let store = DurationStore::new(durations_db).context("preparing duration ledger")?;
    let images_queue = DurableQueue::new(queues_db.clone(), IMAGES_QUEUE)?;
    let sends_queue = DurableQueue::new(queues_db, SENDS_QUEUE)?;
    info!(
        images_pending = images_queue.len()?,
        sends_pending = sends_queue.len()?,
        "queues_opened"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new());
    let labels = SessionLabels {
        fcfs_seq_id: config.fcfs_seq_id().to_string(),
        device_tag: config.device_tag().to_string(),
    };

    let (kill_tx, kill_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(config.probe_interval());

    // Pipeline: capture -> resolver -> sessionizer, one batch in flight per hop
    let (snapshots_tx, snapshots_rx) = mpsc::channel(1);
    let (entries_tx, entries_rx) = mpsc::channel(1);

    let scheduler = CaptureScheduler::new(
        Arc::new(TsharkCapture::new(config.capture_tool_path(), config.capture_field())),
        Arc::new(SysfsDiscovery::new(config.adapter_prefix())),
        SchedulerSettings::from_config(&config),
        metrics.clone(),
    );
    // Probes are answered while a capture runs, so the common budget applies
    let liveness = supervisor.subscribe("capture", config.stage_timeout());
    let mut capture_task = tokio::spawn(scheduler.run(snapshots_tx, liveness, kill_rx.clone()));

    let resolver = Arc::new(IdentifierResolver::load(config.manufacturers_path()));
    let liveness = supervisor.subscribe("resolver", config.stage_timeout());
    let mut stage_tasks =
        vec![tokio::spawn(resolver.run(snapshots_rx, entries_tx, liveness, kill_rx.clone()))];

    let sessionizer = Sessionizer::new(
        store.clone(),
        vec![images_queue.clone(), sends_queue.clone()],
        clock.clone(),
        metrics.clone(),
    )
    .with_reset_interval(config.reset_interval_secs());
    let liveness = supervisor.subscribe("sessionizer", config.stage_timeout());
    stage_tasks.push(tokio::spawn(sessionizer.run(
        entries_rx,
        config.reset_check(),
        liveness,
        kill_rx.clone(),
    )));

    let images = ImageExporter::new(
        store.clone(),
        images_queue,
        clock.clone(),
        Path::new(config.www_root()),
        Path::new(config.images_dir()),
        labels.clone(),
        metrics.clone(),
    );
    let liveness = supervisor.subscribe("images", config.stage_timeout());
    stage_tasks.push(tokio::spawn(
        ConsumerStage::new(images, config.images_interval()).run(liveness, kill_rx.clone()),
    ));

    let exporter = BatchExporter::new(config.api_key()).context("building export client")?;
    let sender = SessionSender::new(
        store,
        sends_queue,
        exporter,
        config.export_endpoint(),
        labels,
        metrics.clone(),
    )
    .with_enabled(config.export_enabled());
    let liveness = supervisor.subscribe("sends", config.stage_timeout());
    stage_tasks.push(tokio::spawn(
        ConsumerStage::new(sender, config.export_interval()).run(liveness, kill_rx.clone()),
    ));

    // Metrics reporter
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut reporter_kill = kill_rx.clone();
    stage_tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        // First tick fires immediately; skip the empty report
        interval.tick().await;
        loop {
            tokio::select! {
                _ = presence_counter::services::stage::killed(&mut reporter_kill) => break,
                _ = interval.tick() => reporter_metrics.report().log(),
            }
        }
    }));

    let mut supervisor_task = tokio::spawn(supervisor.run(kill_rx));
    let mut capture_done = false;
    let mut supervisor_done = false;

    let outcome: anyhow::Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            Ok(())
        }
        joined = &mut supervisor_task => {
            supervisor_done = true;
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("stage supervision failed")),
                Err(e) => Err(anyhow::Error::new(e).context("supervisor task failed")),
            }
        }
        joined = &mut capture_task => {
            capture_done = true;
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("capture stage failed")),
                Err(e) => Err(anyhow::Error::new(e).context("capture task failed")),
            }
        }
    };

    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "fatal_shutting_down");
    }
    let _ = kill_tx.send(true);

    // An in-flight capture runs to completion before the stage sees the kill
    if !capture_done {
        stage_tasks.push(tokio::spawn(async move {
            let _ = capture_task.await;
        }));
    }
    if !supervisor_done {
        stage_tasks.push(tokio::spawn(async move {
            let _ = supervisor_task.await;
        }));
    }
    let grace = config.capture_duration() + SHUTDOWN_GRACE;
    let drained = tokio::time::timeout(grace, async {
        for task in stage_tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "shutdown_drain_timeout");
    }

    metrics.report().log();
    info!("presence_counter_shutdown_complete");
    outcome
}
