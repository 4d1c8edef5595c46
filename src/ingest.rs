// ===============================
// src/ingest.rs
// ===============================
//
// Loop ingest:
//   tunggu pasar buka -> fetch sejak cursor -> transform -> insert -> majukan cursor
//
// Aturan utama:
// - Cursor hanya maju SETELAH insert sukses, ke max TRADENO di batch (tidak
//   pernah mundur). Insert gagal = cursor tetap, cycle berikutnya fetch ulang
//   range yang sama (at-least-once, duplikat dirapikan di sink).
// - Batch dengan kolom kunci hilang / baris rusak ditolak utuh, tunggu
//   reject_delay, lalu coba lagi dengan cursor yang sama.
// - Saat pasar tutup: tidur sampai next_open, tapi next_open dihitung ulang
//   tiap bangun (max_closed_sleep per tidur) supaya tahan suspend/clock jump.
// - Shutdown diamati di batas cycle dan selama tidur.
//
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::calendar::{CalendarEngine, CalendarError};
use crate::domain::TradeRecord;
use crate::feed::{FeedError, MarketDataSource};
use crate::metrics::{
    BATCHES, CURSOR, CYCLE_SECONDS, FETCH_ERRORS, INSERT_ERRORS, MARKET_OPEN, REJECTED, TRADES,
};
use crate::schema;
use crate::sink::{Sink, SinkError};
use crate::transform::{transform, TransformError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Uninitialized,
    AwaitingOpen,
    ClosedWait,
    Fetching,
    Transforming,
    Writing,
    AdvancingCursor,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub target: String,
    /// Pause after a written, empty or failed cycle.
    pub poll_interval: Duration,
    /// Pause after a rejected batch.
    pub reject_delay: Duration,
    pub cursor_retry_delay: Duration,
    /// Longest single sleep while closed; next_open is recomputed after each.
    pub max_closed_sleep: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            target: schema::DEFAULT_TARGET.to_string(),
            poll_interval: Duration::from_millis(500),
            reject_delay: Duration::from_secs(5),
            cursor_retry_delay: Duration::from_secs(5),
            max_closed_sleep: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("trading calendar: {0}")]
    Calendar(#[from] CalendarError),
}

#[derive(Debug)]
pub enum CycleOutcome {
    Written { rows: usize, cursor: u64 },
    Empty,
    Rejected(TransformError),
    FetchFailed(FeedError),
    WriteFailed(SinkError),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Written { .. } => "written",
            CycleOutcome::Empty => "empty",
            CycleOutcome::Rejected(_) => "rejected",
            CycleOutcome::FetchFailed(_) => "fetch_failed",
            CycleOutcome::WriteFailed(_) => "write_failed",
        }
    }
}

pub struct Ingestor {
    calendar: CalendarEngine,
    source: Arc<dyn MarketDataSource>,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    settings: IngestSettings,
    shutdown: watch::Receiver<bool>,
    cursor: Option<u64>,
    state: IngestState,
}

impl Ingestor {
    pub fn new(
        calendar: CalendarEngine,
        source: Arc<dyn MarketDataSource>,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
        settings: IngestSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            calendar,
            source,
            sink,
            clock,
            settings,
            shutdown,
            cursor: None,
            state: IngestState::Uninitialized,
        }
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_cursor(&mut self, cursor: u64) {
        self.cursor = Some(cursor);
        CURSOR.set(i64::try_from(cursor).unwrap_or(i64::MAX));
    }

    /// Sleep for `dur`, waking early on shutdown. `false` = shutdown requested.
    async fn pause(&mut self, dur: Duration) -> bool {
        if self.stopping() {
            return false;
        }
        let deadline = Instant::now() + dur;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return !self.stopping(),
                res = self.shutdown.changed() => match res {
                    Ok(()) if *self.shutdown.borrow() => return false,
                    Ok(()) => continue,
                    // sender sudah drop: tidak ada lagi yang bisa minta stop
                    Err(_) => {
                        sleep_until(deadline).await;
                        return true;
                    }
                },
            }
        }
    }

    /// Connect source and sink in parallel, then make sure the target table
    /// exists. Any failure is retried after `cursor_retry_delay`; both
    /// `connect` calls are idempotent. `false` = shutdown before ready.
    pub async fn prepare(&mut self) -> bool {
        self.state = IngestState::Uninitialized;
        loop {
            if self.stopping() {
                return false;
            }

            let (src, snk) = tokio::join!(self.source.connect(), self.sink.connect());
            let ready = match (src, snk) {
                (Ok(()), Ok(())) => match schema::ensure(self.sink.as_ref(), &self.settings.target).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(sink = self.sink.name(), error = %e, "schema bootstrap failed");
                        false
                    }
                },
                (src, snk) => {
                    if let Err(e) = src {
                        error!(source = self.source.name(), error = %e, "source connect failed");
                    }
                    if let Err(e) = snk {
                        error!(sink = self.sink.name(), error = %e, "sink connect failed");
                    }
                    false
                }
            };
            if ready {
                info!(source = self.source.name(), sink = self.sink.name(), "connected");
                return true;
            }

            let delay = self.settings.cursor_retry_delay;
            warn!(retry_in = ?delay, "collaborators not ready, retrying");
            if !self.pause(delay).await {
                return false;
            }
        }
    }

    /// Establish the starting cursor: caller-supplied value, else the sink's
    /// current max, else 0 for an empty store. Sink failures are retried
    /// forever with `cursor_retry_delay`. `false` = shutdown before done.
    pub async fn init_cursor(&mut self, initial: Option<u64>) -> bool {
        self.state = IngestState::Uninitialized;
        if let Some(cursor) = initial {
            self.set_cursor(cursor);
            info!(cursor, "cursor supplied by caller");
            return true;
        }

        info!(sink = self.sink.name(), "getting initial cursor from sink...");
        let stmt = schema::max_trade_no_statement(&self.settings.target);
        loop {
            if self.stopping() {
                return false;
            }
            let result = match self.sink.query(&stmt).await {
                Ok(rows) => schema::cursor_from_rows(&rows),
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(cursor)) if cursor > 0 => {
                    self.set_cursor(cursor);
                    info!(cursor, "cursor initialized");
                    return true;
                }
                Ok(_) => {
                    warn!("table is empty or NULL returned, setting cursor to 0");
                    self.set_cursor(0);
                    info!(cursor = 0, "cursor initialized");
                    return true;
                }
                Err(e) => {
                    let delay = self.settings.cursor_retry_delay;
                    error!(error = %e, retry_in = ?delay, "failed to get cursor");
                    if !self.pause(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Block until the calendar reports open. `Ok(false)` = shutdown.
    pub async fn wait_until_open(&mut self) -> Result<bool, CalendarError> {
        let mut announced = false;
        loop {
            if self.stopping() {
                return Ok(false);
            }
            self.state = IngestState::AwaitingOpen;
            let now = self.clock.now();
            if self.calendar.is_open(now) {
                MARKET_OPEN.set(1);
                if announced {
                    info!("market is open, resuming");
                }
                return Ok(true);
            }

            MARKET_OPEN.set(0);
            self.state = IngestState::ClosedWait;
            let next = self.calendar.next_open(now)?;
            let wait = (next - now).to_std().unwrap_or_default();
            let local_next = next.with_timezone(&self.calendar.timezone());
            if announced {
                debug!(wait_secs = wait.as_secs(), next_open = %local_next, "still closed, recomputed");
            } else {
                info!(wait_secs = wait.as_secs(), next_open = %local_next, "market is closed, waiting until it opens");
                announced = true;
            }

            let nap = wait
                .min(self.settings.max_closed_sleep)
                .max(Duration::from_millis(1));
            if !self.pause(nap).await {
                return Ok(false);
            }
        }
    }

    /// One fetch -> transform -> write -> advance pass. Never advances the
    /// cursor unless the insert returned success.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let cursor = self.cursor;

        self.state = IngestState::Fetching;
        let batch = match self.source.fetch(cursor).await {
            Ok(b) => b,
            Err(e) => {
                FETCH_ERRORS.inc();
                return CycleOutcome::FetchFailed(e);
            }
        };
        if batch.is_empty() {
            return CycleOutcome::Empty;
        }

        self.state = IngestState::Transforming;
        let loaded_at = self.calendar.local_time(self.clock.now());
        let out = match transform(&batch, loaded_at) {
            Ok(o) => o,
            Err(e) => {
                REJECTED.with_label_values(&[e.reason()]).inc();
                return CycleOutcome::Rejected(e);
            }
        };
        let rows: Vec<Vec<Value>> = out.records.iter().map(TradeRecord::to_row).collect();

        self.state = IngestState::Writing;
        if let Err(e) = self
            .sink
            .insert(&self.settings.target, &TradeRecord::COLUMNS, &rows)
            .await
        {
            INSERT_ERRORS.inc();
            return CycleOutcome::WriteFailed(e);
        }

        self.state = IngestState::AdvancingCursor;
        let base = cursor.unwrap_or(0);
        let next = out.max_trade_no.map_or(base, |m| m.max(base));
        self.set_cursor(next);
        TRADES.inc_by(rows.len() as u64);

        CycleOutcome::Written {
            rows: rows.len(),
            cursor: next,
        }
    }

    /// Run until shutdown. Only a calendar without reachable work days ends
    /// it with an error; collaborator outages at startup are waited out.
    pub async fn run(&mut self, initial_cursor: Option<u64>) -> Result<(), IngestError> {
        if !self.prepare().await || !self.init_cursor(initial_cursor).await {
            self.state = IngestState::Stopped;
            info!("stopped before cursor was initialized");
            return Ok(());
        }

        loop {
            match self.wait_until_open().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.state = IngestState::Stopped;
                    error!(error = %e, "trading calendar has no reachable work day");
                    return Err(e.into());
                }
            }

            let started = std::time::Instant::now();
            let outcome = self.run_cycle().await;
            CYCLE_SECONDS.observe(started.elapsed().as_secs_f64());
            BATCHES.with_label_values(&[outcome.label()]).inc();

            let delay = match &outcome {
                CycleOutcome::Written { rows, cursor } => {
                    info!(rows, cursor, "inserted trades");
                    self.settings.poll_interval
                }
                CycleOutcome::Empty => {
                    debug!("received empty trades list");
                    self.settings.poll_interval
                }
                CycleOutcome::Rejected(e) => {
                    error!(error = %e, cursor = ?self.cursor, "batch rejected, retrying same cursor");
                    self.settings.reject_delay
                }
                CycleOutcome::FetchFailed(e) => {
                    error!(error = %e, cursor = ?self.cursor, "fetch failed");
                    self.settings.poll_interval
                }
                CycleOutcome::WriteFailed(e) => {
                    error!(error = %e, cursor = ?self.cursor, "insert failed, cursor unchanged");
                    self.settings.poll_interval
                }
            };

            self.state = IngestState::AwaitingOpen;
            if !self.pause(delay).await {
                break;
            }
        }

        self.state = IngestState::Stopped;
        info!(cursor = ?self.cursor(), state = ?self.state(), "ingestion loop stopped");
        Ok(())
    }
}
