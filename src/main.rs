// ===============================
// src/main.rs
// ===============================
/*
 # jalankan lokal tanpa ClickHouse
 SOURCE_MODE=mock SINK_MODE=jsonl RECORD_FILE=logs/trades.jsonl cargo run -- --calendar config/calendar.yml

 # status loop
curl -s localhost:9898/metrics | egrep '^(market_open|ingest_cursor|ingest_batches_total)'

*/
/*
=============================================================================
Project : moex_stream_rust — MOEX trade stream ingestion service in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Polls MOEX ISS for new trades while the exchange calendar says the
          market is open, normalizes them and writes them to ClickHouse (or a
          JSONL file) with an at-least-once cursor. Exposes Prometheus metrics.
=============================================================================
*/
mod calendar;
mod clickhouse;
mod config;
mod domain;
mod feed;       // ISS (reqwest) + mock
mod ingest;     // calendar-gated fetch/transform/write loop
mod metrics;
mod recorder;   // JSONL sink
mod schema;
mod sink;
mod transform;

use chrono_tz::Tz;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::calendar::CalendarEngine;
use crate::clickhouse::ClickHouseSink;
use crate::config::{Args, ConfigError, SinkMode, SourceMode};
use crate::feed::{IssFeed, MarketDataSource, MockFeed};
use crate::ingest::{Clock, IngestError, IngestSettings, Ingestor, SystemClock};
use crate::recorder::RecorderSink;
use crate::sink::Sink;

const MOCK_SYMBOL: &str = "SBER";

#[derive(Debug, Error)]
enum AppError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AppError> {
    // ---- Load config & calendar ----
    let (args, schedule) = config::load()?;

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_SOURCE_MODE
        .with_label_values(&[args.source_mode.as_str()])
        .set(1);
    metrics::CONFIG_SINK_MODE
        .with_label_values(&[args.sink_mode.as_str()])
        .set(1);

    info!(
        source_mode = args.source_mode.as_str(),
        sink_mode = args.sink_mode.as_str(),
        target = %args.ingest.target,
        calendar = %args.calendar_file.display(),
        timezone = %schedule.timezone(),
        cursor = ?args.initial_cursor,
        "startup config"
    );

    if !schedule.has_work_days() {
        warn!("trading calendar has no work day at all");
    }

    // ---- Shutdown flag (SIGINT / SIGTERM) ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    tokio::spawn(watch_signals(shutdown_tx.clone()));

    let metrics_task = if args.metrics_port != 0 {
        Some(tokio::spawn(metrics::serve_metrics(
            args.metrics_port,
            shutdown_rx.clone(),
        )))
    } else {
        info!("metrics disabled (METRICS_PORT=0)");
        None
    };

    // ---- Collaborators ----
    let calendar = CalendarEngine::new(schedule);
    let source = build_source(&args, calendar.timezone());
    let sink = build_sink(&args)?;

    let result = supervise(
        calendar,
        source,
        sink,
        Arc::new(SystemClock),
        args.ingest.clone(),
        args.initial_cursor,
        shutdown_rx,
    )
    .await;

    let _ = shutdown_tx.send(true);
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    info!("bye");
    result
}

/// Run the ingest loop (parallel connect + schema happen inside, retried
/// until ready or shutdown), then close source and sink whatever the result.
async fn supervise(
    calendar: CalendarEngine,
    source: Arc<dyn MarketDataSource>,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    settings: IngestSettings,
    initial_cursor: Option<u64>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let mut ingestor = Ingestor::new(calendar, source.clone(), sink.clone(), clock, settings, shutdown);
    let result = ingestor.run(initial_cursor).await;

    // ---- Cleanup: selalu tutup source & sink, apa pun hasilnya ----
    tokio::join!(source.close(), sink.close());
    info!(source = source.name(), sink = sink.name(), "collaborators closed");
    result.map_err(AppError::from)
}

fn build_source(args: &Args, tz: Tz) -> Arc<dyn MarketDataSource> {
    match args.source_mode {
        SourceMode::Iss => Arc::new(IssFeed::new(args.iss_url.clone(), args.iss_timeout)),
        SourceMode::Mock => Arc::new(MockFeed::new(MOCK_SYMBOL.to_string(), tz)),
    }
}

fn build_sink(args: &Args) -> Result<Arc<dyn Sink>, AppError> {
    match args.sink_mode {
        SinkMode::ClickHouse => {
            let ch = args
                .clickhouse
                .as_ref()
                .ok_or(ConfigError::MissingVar("CLICKHOUSE_HOST"))?;
            Ok(Arc::new(ClickHouseSink::new(
                ch.url()?,
                ch.user.clone(),
                ch.password.clone(),
                ch.timeout,
            )))
        }
        SinkMode::Jsonl => {
            let path = args
                .record_file
                .clone()
                .ok_or(ConfigError::MissingVar("RECORD_FILE"))?;
            Ok(Arc::new(RecorderSink::new(path)))
        }
    }
}

async fn watch_signals(tx: Arc<watch::Sender<bool>>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!(?e, "cannot install SIGTERM handler, Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received");
    }

    info!("shutting down after the current step...");
    let _ = tx.send(true);
}
