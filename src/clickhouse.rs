// ===============================
// src/clickhouse.rs
// ===============================
//
// ClickHouse lewat HTTP interface (port 8123/8443).
// - insert : satu POST `INSERT ... FORMAT JSONEachRow` per batch (atomic per call)
// - query  : POST statement, hasil `default_format=JSONCompact` -> rows
//
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::sink::{row_object, Sink, SinkError};

pub struct ClickHouseSink {
    base: Url,
    user: String,
    password: String,
    timeout: Duration,
    client: Mutex<Option<reqwest::Client>>,
}

#[derive(Debug, Deserialize)]
struct CompactResult {
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

impl ClickHouseSink {
    pub fn new(base: Url, user: String, password: String, timeout: Duration) -> Self {
        Self {
            base,
            user,
            password,
            timeout,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<reqwest::Client, SinkError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(SinkError::NotConnected("clickhouse"))
    }

    fn endpoint(&self, query: &str) -> String {
        format!("{}/?{}", self.base.as_str().trim_end_matches('/'), query)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
    }
}

async fn check_status(rsp: reqwest::Response) -> Result<reqwest::Response, SinkError> {
    let status = rsp.status();
    if status.is_success() {
        return Ok(rsp);
    }
    let body = rsp.text().await.unwrap_or_default();
    Err(SinkError::Status {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}

pub fn insert_statement(target: &str, fields: &[&str]) -> String {
    format!("INSERT INTO {target} ({}) FORMAT JSONEachRow", fields.join(", "))
}

/// JSONEachRow body: one object per line.
pub fn json_each_row(fields: &[&str], rows: &[Vec<Value>]) -> Result<String, SinkError> {
    let mut body = String::new();
    for row in rows {
        let obj = row_object(fields, row)?;
        let line = serde_json::to_string(&obj).map_err(|e| SinkError::Payload(e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

/// DDL answers with an empty body; SELECT with JSONCompact.
pub fn parse_compact(body: &str) -> Result<Vec<Vec<Value>>, SinkError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<CompactResult>(body)
        .map(|r| r.data)
        .map_err(|e| SinkError::Payload(e.to_string()))
}

#[async_trait]
impl Sink for ClickHouseSink {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn connect(&self) -> Result<(), SinkError> {
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let ping = format!("{}/ping", self.base.as_str().trim_end_matches('/'));
        check_status(client.get(ping).send().await?).await?;
        *guard = Some(client);
        info!(url = %self.base, user = %self.user, "ClickHouse client initialized");
        Ok(())
    }

    async fn insert(&self, target: &str, fields: &[&str], rows: &[Vec<Value>]) -> Result<(), SinkError> {
        let client = self.client().await?;
        let body = json_each_row(fields, rows)?;
        let sql = insert_statement(target, fields);
        let url = self.endpoint(&format!("query={}", urlencoding::encode(&sql)));

        check_status(self.authed(client.post(url)).body(body).send().await?).await?;
        debug!(%target, rows = rows.len(), "ClickHouse insert ok");
        Ok(())
    }

    async fn query(&self, statement: &str) -> Result<Vec<Vec<Value>>, SinkError> {
        let client = self.client().await?;
        let url = self.endpoint("default_format=JSONCompact");
        let rsp = check_status(
            self.authed(client.post(url))
                .body(statement.to_string())
                .send()
                .await?,
        )
        .await?;
        let body = rsp.text().await?;
        parse_compact(&body)
    }

    async fn close(&self) {
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            info!("ClickHouse client closed");
        }
    }
}
