// ===============================
// src/sink.rs
// ===============================
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{0} sink is not connected")]
    NotConnected(&'static str),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response: {0}")]
    Payload(String),
    #[error("row has {got} values, expected {expected}")]
    RowWidth { got: usize, expected: usize },
    #[error("unsupported statement: {0}")]
    Unsupported(String),
}

/// Append-oriented store. `insert` is atomic per call: on error nothing of
/// the batch is persisted.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<(), SinkError>;

    async fn insert(&self, target: &str, fields: &[&str], rows: &[Vec<Value>]) -> Result<(), SinkError>;

    async fn query(&self, statement: &str) -> Result<Vec<Vec<Value>>, SinkError>;

    async fn close(&self);
}

/// Zip a positional row with its field names into one JSON object.
pub fn row_object(fields: &[&str], row: &[Value]) -> Result<serde_json::Map<String, Value>, SinkError> {
    if row.len() != fields.len() {
        return Err(SinkError::RowWidth {
            got: row.len(),
            expected: fields.len(),
        });
    }
    Ok(fields
        .iter()
        .zip(row)
        .map(|(f, v)| (f.to_string(), v.clone()))
        .collect())
}
