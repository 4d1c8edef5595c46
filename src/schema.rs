// ===============================
// src/schema.rs
// ===============================
//
// Target table DDL + statement untuk bootstrap cursor.
// ReplacingMergeTree ORDER BY (sec_id, trade_dttm, trade_no): duplikat dari
// retry (at-least-once) dirapikan oleh ClickHouse saat merge.
//
use serde_json::Value;
use tracing::info;

use crate::sink::{Sink, SinkError};

pub const DEFAULT_TARGET: &str = "ods_moex.trades";

pub fn bootstrap_statements(target: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(2);
    if let Some((db, _)) = target.split_once('.') {
        out.push(format!("CREATE DATABASE IF NOT EXISTS {db}"));
    }
    out.push(format!(
        "CREATE TABLE IF NOT EXISTS {target}
(
    loaded_dttm         DateTime,
    trade_no            UInt64,
    trade_dttm          DateTime,
    board_id            LowCardinality(String),
    sec_id              LowCardinality(String),
    price_amt           Decimal(18, 6),
    quantity_cnt        UInt64,
    trade_value         Decimal(18, 6),
    period_code         LowCardinality(String),
    tradetime_grp       Int32,
    systime_dttm        DateTime,
    buysell_code        LowCardinality(String),
    decimals_cnt        UInt8,
    tradingsession_code LowCardinality(String),
    trade_session_dt    Date,

    INDEX idx_sec_id sec_id TYPE set(100) GRANULARITY 1,
    INDEX idx_trade_dttm trade_dttm TYPE minmax GRANULARITY 1
)
ENGINE = ReplacingMergeTree
PARTITION BY toYYYYMM(trade_dttm)
ORDER BY (sec_id, trade_dttm, trade_no)
SETTINGS index_granularity = 8192"
    ));
    out
}

pub fn max_trade_no_statement(target: &str) -> String {
    format!("SELECT max(trade_no) FROM {target}")
}

/// First cell of the max() result. `None` for an empty result or NULL.
/// ClickHouse quotes 64-bit integers in JSON, so strings are accepted.
pub fn cursor_from_rows(rows: &[Vec<Value>]) -> Result<Option<u64>, SinkError> {
    let Some(cell) = rows.first().and_then(|r| r.first()) else {
        return Ok(None);
    };
    match cell {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| SinkError::Payload(format!("bad max(trade_no): {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SinkError::Payload(format!("bad max(trade_no) {s:?}: {e}"))),
        other => Err(SinkError::Payload(format!("bad max(trade_no): {other}"))),
    }
}

pub async fn ensure(sink: &dyn Sink, target: &str) -> Result<(), SinkError> {
    for stmt in bootstrap_statements(target) {
        sink.query(&stmt).await?;
    }
    info!(sink = sink.name(), %target, "schema ensured (database/table present)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statements_follow_target() {
        let stmts = bootstrap_statements("ods_moex.trades");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "CREATE DATABASE IF NOT EXISTS ods_moex");
        assert!(stmts[1].starts_with("CREATE TABLE IF NOT EXISTS ods_moex.trades"));

        let stmts = bootstrap_statements("trades");
        assert_eq!(stmts.len(), 1);
        assert_eq!(max_trade_no_statement("trades"), "SELECT max(trade_no) FROM trades");
    }

    #[test]
    fn reads_max_cell() {
        assert_eq!(cursor_from_rows(&[]).unwrap(), None);
        assert_eq!(cursor_from_rows(&[vec![]]).unwrap(), None);
        assert_eq!(cursor_from_rows(&[vec![Value::Null]]).unwrap(), None);
        assert_eq!(cursor_from_rows(&[vec![json!(0)]]).unwrap(), Some(0));
        assert_eq!(cursor_from_rows(&[vec![json!(12_345)]]).unwrap(), Some(12_345));
        assert_eq!(
            cursor_from_rows(&[vec![json!("11223344556")]]).unwrap(),
            Some(11_223_344_556)
        );
        assert!(cursor_from_rows(&[vec![json!("abc")]]).is_err());
        assert!(cursor_from_rows(&[vec![json!(-1)]]).is_err());
    }
}
