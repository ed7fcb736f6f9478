//! Doorway occupancy service
//!
//! Infers room occupancy from two ranging beams across a doorway and reports
//! it over webhooks, a session log and a small HTTP status server.
//!
//! Module structure:
//! - `domain/` - Core types (SensorSample, CrossingEvent, OccupancyState)
//! - `io/` - External interfaces (range sources, webhooks, session log, status)
//! - `services/` - Detection, tracking and the tick loop
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use doorway_occupancy::infra::{Config, Metrics};
use doorway_occupancy::io::{
    create_webhook_worker, start_status_server, ReplaySource, SessionLog, StatusContext,
    WebhookNotifier,
};
use doorway_occupancy::io::webhook::WEBHOOK_QUEUE_SIZE;
use doorway_occupancy::services::{DoorwayMonitor, DoorwayService, ServiceSink, TickClock};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Doorway occupancy - directional people counting from two range sensors
#[derive(Parser, Debug)]
#[command(name = "doorway-occupancy", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-tick detector decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("GIT_HASH"), "doorway-occupancy starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config)?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        threshold_distance = %config.threshold_distance(),
        sequence_timeout_ms = %config.sequence_timeout_ms(),
        no_echo = %config.detector_settings().no_echo.as_str(),
        tick_interval_ms = %config.tick_interval_ms(),
        capture_file = %config.capture_file(),
        webhook_enabled = %config.webhook_enabled(),
        status_port = %config.status_port(),
        sessions_file = %config.sessions_file(),
        "config_loaded"
    );

    let source = ReplaySource::from_file(config.capture_file(), config.loop_playback())
        .context("Failed to open range source")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Webhook worker (if enabled)
    let webhook_tx = if config.webhook_enabled() {
        let notifier = Arc::new(WebhookNotifier::new(&config, metrics.clone()));
        let (tx, worker) = create_webhook_worker(notifier, WEBHOOK_QUEUE_SIZE);
        tokio::spawn(worker.run());
        Some(tx)
    } else {
        None
    };

    let session_log = (!config.sessions_file().is_empty())
        .then(|| SessionLog::new(config.sessions_file(), config.site_id()));

    let sink = ServiceSink::new(metrics.clone(), webhook_tx, session_log);
    let monitor =
        DoorwayMonitor::new(config.detector_settings(), config.unresponsive_after(), sink);

    let clock = TickClock::new();
    let (snapshot_tx, snapshot_rx) = watch::channel(monitor.snapshot(clock.now_ms()));
    let (control_tx, control_rx) = mpsc::channel(8);

    // Status server (if port > 0)
    let status_port = config.status_port();
    if status_port > 0 {
        let ctx = Arc::new(StatusContext {
            site_id: config.site_id().to_string(),
            version: env!("GIT_HASH"),
            started_at: Instant::now(),
            snapshot_rx,
            metrics: metrics.clone(),
            control_tx,
        });
        let bind_address = config.status_bind_address().to_string();
        let status_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_status_server(&bind_address, status_port, ctx, status_shutdown).await
            {
                tracing::error!(error = %format!("{:#}", e), "status_server_error");
            }
        });
    }

    // Periodic metrics report
    let metrics_reporter = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
            loop {
                interval.tick().await;
                metrics_reporter.report().log();
            }
        });
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let service = DoorwayService::new(
        monitor,
        source,
        metrics,
        snapshot_tx,
        control_rx,
        config.tick_interval_ms(),
    );
    service.run(clock, shutdown_rx).await;

    info!("doorway-occupancy shutdown complete");
    Ok(())
}
