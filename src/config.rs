// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : moex_stream_rust — MOEX trade stream ingestion service in Rust
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Polls MOEX ISS for new trades while the exchange calendar says the
          market is open, normalizes them and writes them to ClickHouse (or a
          JSONL file) with an at-least-once cursor. Exposes Prometheus metrics.
=============================================================================
*/
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use clap::Parser;
use dotenvy::dotenv;
use serde::{de, Deserialize, Deserializer};
use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use url::Url;

use crate::calendar::{DayRule, ScheduleError, TradingSchedule};
use crate::ingest::IngestSettings;
use crate::schema::DEFAULT_TARGET;

pub const DEFAULT_ISS_TRADES_URL: &str =
    "https://iss.moex.com/iss/engines/stock/markets/shares/trades.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad calendar file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown timezone {0:?}")]
    Timezone(String),
    #[error("bad time {0:?} (expected HH:MM:SS)")]
    Time(String),
    #[error("bad date {0:?} (expected YYYY-MM-DD)")]
    Date(String),
    #[error("work day {0} needs start_time and stop_time")]
    MissingTimes(String),
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("{0} must be set")]
    MissingVar(&'static str),
    #[error("{key}: bad value {value:?}")]
    BadVar { key: &'static str, value: String },
    #[error("bad url {value:?}: {source}")]
    Url {
        value: String,
        #[source]
        source: url::ParseError,
    },
}

/// Sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceMode {
    Iss,
    Mock,
}

impl SourceMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "iss" | "moex" => Some(SourceMode::Iss),
            "mock" => Some(SourceMode::Mock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Iss => "iss",
            SourceMode::Mock => "mock",
        }
    }
}

/// Tujuan penulisan trade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkMode {
    ClickHouse,
    Jsonl,
}

impl SinkMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clickhouse" | "ch" => Some(SinkMode::ClickHouse),
            "jsonl" | "file" => Some(SinkMode::Jsonl),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkMode::ClickHouse => "clickhouse",
            SinkMode::Jsonl => "jsonl",
        }
    }
}

/// Command line. Connection settings come from the environment / `.env`.
#[derive(Parser, Debug, Clone)]
#[command(name = "moex_stream_rust", version, about = "MOEX trade stream ingestion")]
pub struct Cli {
    /// Trading calendar (YAML)
    #[arg(long, default_value = "config/calendar.yml")]
    pub calendar: PathBuf,

    /// Start from this trade number instead of asking the sink
    #[arg(long)]
    pub cursor: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub secure: bool,
    pub timeout: Duration,
}

impl ClickHouseConfig {
    pub fn url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.secure { "https" } else { "http" };
        let value = format!("{scheme}://{}:{}/", self.host, self.port);
        Url::parse(&value).map_err(|source| ConfigError::Url { value, source })
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub source_mode: SourceMode,
    pub sink_mode: SinkMode,

    // ISS
    pub iss_url: Url,
    pub iss_timeout: Duration,

    // sink
    pub clickhouse: Option<ClickHouseConfig>,
    pub record_file: Option<PathBuf>,

    // loop pacing + target table
    pub ingest: IngestSettings,

    pub metrics_port: u16,
    pub calendar_file: PathBuf,
    pub initial_cursor: Option<u64>,
}

// nilai kosong dianggap tidak di-set
fn var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(lookup, key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::BadVar { key, value }),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match var(lookup, key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::BadVar { key, value }),
        },
    }
}

impl Args {
    /// Build from any key lookup; `load()` passes the process environment.
    pub fn from_lookup(cli: Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // ===== Mode =====
        let source_mode = match var(&lookup, "SOURCE_MODE") {
            None => SourceMode::Iss,
            Some(value) => SourceMode::parse(&value).ok_or(ConfigError::BadVar {
                key: "SOURCE_MODE",
                value,
            })?,
        };
        let sink_mode = match var(&lookup, "SINK_MODE") {
            None => SinkMode::ClickHouse,
            Some(value) => SinkMode::parse(&value).ok_or(ConfigError::BadVar {
                key: "SINK_MODE",
                value,
            })?,
        };

        // ===== ISS =====
        let iss_raw = var(&lookup, "ISS_TRADES_URL").unwrap_or_else(|| DEFAULT_ISS_TRADES_URL.to_string());
        let iss_url = Url::parse(&iss_raw).map_err(|source| ConfigError::Url {
            value: iss_raw.clone(),
            source,
        })?;
        let iss_timeout = Duration::from_secs(parse_or(&lookup, "ISS_TIMEOUT_SECS", 10u64)?);

        // ===== Sink =====
        let clickhouse = match var(&lookup, "CLICKHOUSE_HOST") {
            Some(host) => Some(ClickHouseConfig {
                host,
                port: parse_or(&lookup, "CLICKHOUSE_PORT", 8123u16)?,
                user: var(&lookup, "CLICKHOUSE_USER").unwrap_or_else(|| "default".to_string()),
                password: lookup("CLICKHOUSE_PASSWORD").unwrap_or_default(),
                secure: parse_bool(&lookup, "CLICKHOUSE_SECURE", false)?,
                timeout: Duration::from_secs(parse_or(&lookup, "CLICKHOUSE_TIMEOUT_SECS", 30u64)?),
            }),
            None => None,
        };
        let record_file = var(&lookup, "RECORD_FILE").map(PathBuf::from);

        match sink_mode {
            SinkMode::ClickHouse => {
                let Some(ch) = clickhouse.as_ref() else {
                    return Err(ConfigError::MissingVar("CLICKHOUSE_HOST"));
                };
                ch.url()?;
            }
            SinkMode::Jsonl if record_file.is_none() => {
                return Err(ConfigError::MissingVar("RECORD_FILE"));
            }
            SinkMode::Jsonl => {}
        }

        // ===== Loop =====
        let defaults = IngestSettings::default();
        let ingest = IngestSettings {
            target: var(&lookup, "TARGET_TABLE").unwrap_or_else(|| DEFAULT_TARGET.to_string()),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            reject_delay: Duration::from_millis(parse_or(
                &lookup,
                "REJECT_DELAY_MS",
                defaults.reject_delay.as_millis() as u64,
            )?),
            cursor_retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "CURSOR_RETRY_MS",
                defaults.cursor_retry_delay.as_millis() as u64,
            )?),
            max_closed_sleep: Duration::from_secs(parse_or(
                &lookup,
                "MAX_CLOSED_SLEEP_SECS",
                defaults.max_closed_sleep.as_secs(),
            )?),
        };
        if ingest.max_closed_sleep.is_zero() {
            return Err(ConfigError::BadVar {
                key: "MAX_CLOSED_SLEEP_SECS",
                value: "0".into(),
            });
        }

        let metrics_port = parse_or(&lookup, "METRICS_PORT", 9898u16)?;

        Ok(Args {
            source_mode,
            sink_mode,
            iss_url,
            iss_timeout,
            clickhouse,
            record_file,
            ingest,
            metrics_port,
            calendar_file: cli.calendar,
            initial_cursor: cli.cursor,
        })
    }
}

/// `.env` -> CLI -> environment -> calendar file. Any error is fatal at startup.
pub fn load() -> Result<(Args, TradingSchedule), ConfigError> {
    // Pastikan .env dibaca (CLICKHOUSE_*, SINK_MODE, dll)
    let _ = dotenv();
    let cli = Cli::parse();
    let args = Args::from_lookup(cli, |k| env::var(k).ok())?;
    let schedule = load_schedule(&args.calendar_file)?;
    Ok((args, schedule))
}

// ===== Trading calendar (YAML) =====

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalendarFile {
    pub timezone: String,
    #[serde(default)]
    pub lag_start_minutes: i64,
    #[serde(default)]
    pub lag_stop_minutes: i64,
    #[serde(default)]
    pub weekly: Vec<WeeklyEntry>,
    #[serde(default)]
    pub special: Vec<SpecialEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeeklyEntry {
    pub week_day: u32,
    #[serde(deserialize_with = "flag")]
    pub is_work_day: bool,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub stop_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialEntry {
    pub date: String,
    #[serde(deserialize_with = "flag")]
    pub is_work_day: bool,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub stop_time: Option<String>,
}

// is_work_day: true/false atau 1/0
fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Str(String),
    }
    match Flag::deserialize(d)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(1) => Ok(true),
        Flag::Int(0) => Ok(false),
        Flag::Str(s) if s == "1" || s.eq_ignore_ascii_case("true") => Ok(true),
        Flag::Str(s) if s == "0" || s.eq_ignore_ascii_case("false") => Ok(false),
        Flag::Int(n) => Err(de::Error::custom(format!("is_work_day must be 0 or 1, got {n}"))),
        Flag::Str(s) => Err(de::Error::custom(format!("is_work_day must be 0 or 1, got {s:?}"))),
    }
}

fn parse_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M:%S").map_err(|_| ConfigError::Time(value.to_string()))
}

fn day_rule(
    what: &str,
    is_work_day: bool,
    start: Option<&str>,
    stop: Option<&str>,
) -> Result<DayRule, ConfigError> {
    if !is_work_day {
        return Ok(DayRule::closed());
    }
    let (Some(start), Some(stop)) = (start, stop) else {
        return Err(ConfigError::MissingTimes(what.to_string()));
    };
    Ok(DayRule::work(parse_time(start)?, parse_time(stop)?))
}

impl CalendarFile {
    pub fn into_schedule(self) -> Result<TradingSchedule, ConfigError> {
        let tz: Tz = self
            .timezone
            .parse()
            .map_err(|_| ConfigError::Timezone(self.timezone.clone()))?;

        let weekly = self
            .weekly
            .iter()
            .map(|w| {
                let rule = day_rule(
                    &format!("week_day {}", w.week_day),
                    w.is_work_day,
                    w.start_time.as_deref(),
                    w.stop_time.as_deref(),
                )?;
                Ok((w.week_day, rule))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let special = self
            .special
            .iter()
            .map(|s| {
                let date = NaiveDate::parse_from_str(s.date.trim(), "%Y-%m-%d")
                    .map_err(|_| ConfigError::Date(s.date.clone()))?;
                let rule = day_rule(&s.date, s.is_work_day, s.start_time.as_deref(), s.stop_time.as_deref())?;
                Ok((date, rule))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(TradingSchedule::new(
            tz,
            weekly,
            special,
            ChronoDuration::minutes(self.lag_start_minutes),
            ChronoDuration::minutes(self.lag_stop_minutes),
        )?)
    }
}

pub fn parse_schedule(text: &str) -> Result<TradingSchedule, ConfigError> {
    serde_yaml::from_str::<CalendarFile>(text)?.into_schedule()
}

pub fn load_schedule(path: &Path) -> Result<TradingSchedule, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_schedule(&text)
}
