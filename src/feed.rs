// ===============================
// src/feed.rs
// ===============================
//
// Market Data adapters:
// - IssFeed  : MOEX ISS REST (`trades.json`, next_trade=1 & tradeno=<cursor>)
// - MockFeed : random-walk trade generator, column order diacak tiap response
//
// Notes:
// - Sumber menentukan sendiri batas baris per call (ISS: 5000). Loop tidak
//   menganggap satu fetch menguras semua data.
// - Client HTTP dibuat lazy di connect() di bawah Mutex, close() idempotent.
//
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};
use url::Url;

use crate::domain::RawBatch;

pub const USER_AGENT: &str = "moex-stream-service/1.0";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("{0} client is not connected")]
    NotConnected(&'static str),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed payload: {0}")]
    Payload(String),
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<(), FeedError>;

    /// Trades with sequence id strictly greater than `since`.
    async fn fetch(&self, since: Option<u64>) -> Result<RawBatch, FeedError>;

    async fn close(&self);
}

// ---- MOEX ISS ----

#[derive(Debug, Deserialize)]
struct IssResponse {
    #[serde(default)]
    trades: Option<IssTable>,
}

#[derive(Debug, Deserialize)]
struct IssTable {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

pub struct IssFeed {
    url: Url,
    timeout: Duration,
    client: Mutex<Option<reqwest::Client>>,
}

impl IssFeed {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            client: Mutex::new(None),
        }
    }
}

/// Decode an ISS `trades.json` body. A response without a `trades` block is
/// an empty batch.
pub fn parse_iss_trades(body: &[u8]) -> Result<RawBatch, FeedError> {
    let rsp: IssResponse =
        serde_json::from_slice(body).map_err(|e| FeedError::Payload(e.to_string()))?;
    Ok(match rsp.trades {
        Some(t) => RawBatch {
            fields: t.columns,
            rows: t.data,
        },
        None => RawBatch::default(),
    })
}

#[async_trait]
impl MarketDataSource for IssFeed {
    fn name(&self) -> &'static str {
        "iss"
    }

    async fn connect(&self) -> Result<(), FeedError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let client = reqwest::Client::builder()
                .timeout(self.timeout)
                .user_agent(USER_AGENT)
                .build()?;
            *guard = Some(client);
            info!(url = %self.url, "ISS client initialized");
        }
        Ok(())
    }

    async fn fetch(&self, since: Option<u64>) -> Result<RawBatch, FeedError> {
        // reqwest::Client murah di-clone (Arc), lock tidak ditahan selama request
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or(FeedError::NotConnected("iss"))?;

        let mut req = client
            .get(self.url.clone())
            .query(&[("iss.meta", "off"), ("next_trade", "1")]);
        if let Some(cursor) = since {
            req = req.query(&[("tradeno", cursor)]);
        }

        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body = rsp.bytes().await?;
        parse_iss_trades(&body)
    }

    async fn close(&self) {
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            info!("ISS client closed");
        }
    }
}

// ---- Mock ----

const MOCK_FIELDS: [&str; 15] = [
    "TRADENO",
    "TRADEDATE",
    "TRADETIME",
    "BOARDID",
    "SECID",
    "PRICE",
    "QUANTITY",
    "VALUE",
    "PERIOD",
    "TRADETIME_GRP",
    "SYSTIME",
    "BUYSELL",
    "DECIMALS",
    "TRADINGSESSION",
    "TRADE_SESSION_DATE",
];

#[derive(Debug)]
struct MockState {
    connected: bool,
    last_no: u64,
    px: i64, // 2 desimal
}

/// Offline generator: 0..=5 trades per call, ids continue above the cursor.
pub struct MockFeed {
    symbol: String,
    tz: Tz,
    state: Mutex<MockState>,
}

impl MockFeed {
    pub fn new(symbol: String, tz: Tz) -> Self {
        Self {
            symbol,
            tz,
            state: Mutex::new(MockState {
                connected: false,
                last_no: 0,
                px: 270_00,
            }),
        }
    }
}

// jangan simpan ThreadRng melewati .await
fn mock_batch(st: &mut MockState, symbol: &str, tz: Tz, since: Option<u64>) -> RawBatch {
    let mut rng = rand::thread_rng();
    let now = Utc::now().with_timezone(&tz).naive_local();
    let date = now.format("%Y-%m-%d").to_string();
    let time = now.format("%H:%M:%S").to_string();
    let systime = now.format("%Y-%m-%d %H:%M:%S").to_string();

    let mut fields: Vec<&str> = MOCK_FIELDS.to_vec();
    fields.shuffle(&mut rng);

    let mut rows = Vec::new();
    let mut next_no = st.last_no.max(since.unwrap_or(0));
    for _ in 0..rng.gen_range(0..=5) {
        next_no += 1;
        st.px = (st.px + rng.gen_range(-3..=3)).max(50_00);
        let qty: u64 = rng.gen_range(1..=50);
        let px = st.px as f64 / 100.0;
        let cell = |name: &str| -> Value {
            match name {
                "TRADENO" => json!(next_no),
                "TRADEDATE" | "TRADE_SESSION_DATE" => json!(date),
                "TRADETIME" => json!(time),
                "BOARDID" => json!("TQBR"),
                "SECID" => json!(symbol),
                "PRICE" => json!(px),
                "QUANTITY" => json!(qty),
                "VALUE" => json!(px * qty as f64 * 10.0),
                "PERIOD" => json!("N"),
                "TRADETIME_GRP" => json!(1000),
                "SYSTIME" => json!(systime),
                "BUYSELL" => json!(if next_no % 2 == 0 { "B" } else { "S" }),
                "DECIMALS" => json!(2),
                "TRADINGSESSION" => json!("1"),
                _ => Value::Null,
            }
        };
        rows.push(fields.iter().map(|f| cell(f)).collect());
    }
    st.last_no = next_no;

    RawBatch {
        fields: fields.into_iter().map(String::from).collect(),
        rows,
    }
}

#[async_trait]
impl MarketDataSource for MockFeed {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<(), FeedError> {
        let mut st = self.state.lock().await;
        if !st.connected {
            st.connected = true;
            info!(symbol = %self.symbol, "mock feed initialized");
        }
        Ok(())
    }

    async fn fetch(&self, since: Option<u64>) -> Result<RawBatch, FeedError> {
        let mut st = self.state.lock().await;
        if !st.connected {
            error!("mock feed fetch before connect");
            return Err(FeedError::NotConnected("mock"));
        }
        Ok(mock_batch(&mut st, &self.symbol, self.tz, since))
    }

    async fn close(&self) {
        let mut st = self.state.lock().await;
        if st.connected {
            st.connected = false;
            info!("mock feed closed");
        }
    }
}
