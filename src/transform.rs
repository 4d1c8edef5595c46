// ===============================
// src/transform.rs
// ===============================
//
// RawBatch -> TradeRecord.
//
// Urutan kolom dari ISS bisa berubah antar response, jadi indeks kolom
// di-resolve ulang berdasarkan nama untuk setiap batch. Satu baris gagal
// parse = seluruh batch ditolak (tidak ada partial write).
//
use ahash::AHashMap as HashMap;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{RawBatch, TradeRecord, DATETIME_FMT, DATE_FMT};

/// Fields that identify and order a trade. Without them the batch is unusable.
pub const KEY_FIELDS: [&str; 2] = ["TRADENO", "TRADETIME"];

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("key field {0} missing from response")]
    MissingKeyField(&'static str),
    #[error("field {0} missing from response")]
    MissingField(&'static str),
    #[error("row {row}: no value for {field}")]
    ShortRow { row: usize, field: &'static str },
    #[error("row {row}: bad {field} value {value}: {reason}")]
    BadValue {
        row: usize,
        field: &'static str,
        value: String,
        reason: String,
    },
}

impl TransformError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            TransformError::MissingKeyField(_) => "missing_key_field",
            TransformError::MissingField(_) => "missing_field",
            TransformError::ShortRow { .. } | TransformError::BadValue { .. } => "bad_row",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub records: Vec<TradeRecord>,
    /// Highest TRADENO among the rows, stale ones included.
    pub max_trade_no: Option<u64>,
}

struct Columns {
    tradeno: usize,
    tradedate: usize,
    tradetime: usize,
    boardid: usize,
    secid: usize,
    price: usize,
    quantity: usize,
    value: usize,
    period: usize,
    tradetime_grp: usize,
    systime: usize,
    buysell: usize,
    decimals: usize,
    tradingsession: usize,
    trade_session_date: usize,
}

impl Columns {
    fn resolve(fields: &[String]) -> Result<Self, TransformError> {
        let idx: HashMap<&str, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        for key in KEY_FIELDS {
            if !idx.contains_key(key) {
                return Err(TransformError::MissingKeyField(key));
            }
        }

        let get = |name: &'static str| {
            idx.get(name)
                .copied()
                .ok_or(TransformError::MissingField(name))
        };

        Ok(Self {
            tradeno: get("TRADENO")?,
            tradedate: get("TRADEDATE")?,
            tradetime: get("TRADETIME")?,
            boardid: get("BOARDID")?,
            secid: get("SECID")?,
            price: get("PRICE")?,
            quantity: get("QUANTITY")?,
            value: get("VALUE")?,
            period: get("PERIOD")?,
            tradetime_grp: get("TRADETIME_GRP")?,
            systime: get("SYSTIME")?,
            buysell: get("BUYSELL")?,
            decimals: get("DECIMALS")?,
            tradingsession: get("TRADINGSESSION")?,
            trade_session_date: get("TRADE_SESSION_DATE")?,
        })
    }
}

pub fn transform(batch: &RawBatch, loaded_at: NaiveDateTime) -> Result<Transformed, TransformError> {
    let cols = Columns::resolve(&batch.fields)?;

    let mut records = Vec::with_capacity(batch.rows.len());
    let mut max_trade_no: Option<u64> = None;

    for (n, row) in batch.rows.iter().enumerate() {
        let r = Row { cells: row, n };

        let trade_no = r.u64(cols.tradeno, "TRADENO")?;
        max_trade_no = Some(max_trade_no.map_or(trade_no, |m| m.max(trade_no)));

        let trade_date = r.date(cols.tradedate, "TRADEDATE")?;
        let trade_time = r.time(cols.tradetime, "TRADETIME")?;

        records.push(TradeRecord {
            loaded_at,
            trade_no,
            trade_at: trade_date.and_time(trade_time),
            board_id: r.text(cols.boardid, "BOARDID")?,
            sec_id: r.text(cols.secid, "SECID")?,
            price: r.f64(cols.price, "PRICE")?,
            quantity: r.u64(cols.quantity, "QUANTITY")?,
            value: r.f64(cols.value, "VALUE")?,
            period: r.text(cols.period, "PERIOD")?,
            tradetime_grp: r.int(cols.tradetime_grp, "TRADETIME_GRP")?,
            systime: r.datetime(cols.systime, "SYSTIME")?,
            buysell: r.text(cols.buysell, "BUYSELL")?,
            decimals: r.int(cols.decimals, "DECIMALS")?,
            trading_session: r.text(cols.tradingsession, "TRADINGSESSION")?,
            session_date: r.date(cols.trade_session_date, "TRADE_SESSION_DATE")?,
        });
    }

    Ok(Transformed {
        records,
        max_trade_no,
    })
}

struct Row<'a> {
    cells: &'a [Value],
    n: usize,
}

impl<'a> Row<'a> {
    fn cell(&self, idx: usize, field: &'static str) -> Result<&'a Value, TransformError> {
        self.cells
            .get(idx)
            .ok_or(TransformError::ShortRow { row: self.n, field })
    }

    fn bad(&self, field: &'static str, value: &Value, reason: impl ToString) -> TransformError {
        TransformError::BadValue {
            row: self.n,
            field,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn str(&self, idx: usize, field: &'static str) -> Result<&'a str, TransformError> {
        let v = self.cell(idx, field)?;
        v.as_str().ok_or_else(|| self.bad(field, v, "expected a string"))
    }

    // null -> empty string; numbers are rendered as text
    fn text(&self, idx: usize, field: &'static str) -> Result<String, TransformError> {
        match self.cell(idx, field)? {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(self.bad(field, other, "expected a string")),
        }
    }

    fn u64(&self, idx: usize, field: &'static str) -> Result<u64, TransformError> {
        let v = self.cell(idx, field)?;
        match v {
            Value::Number(n) => n.as_u64().ok_or_else(|| self.bad(field, v, "not an unsigned integer")),
            Value::String(s) => s.trim().parse().map_err(|e| self.bad(field, v, e)),
            _ => Err(self.bad(field, v, "not an unsigned integer")),
        }
    }

    fn int<T>(&self, idx: usize, field: &'static str) -> Result<T, TransformError>
    where
        T: TryFrom<i64> + std::str::FromStr,
        <T as std::str::FromStr>::Err: ToString,
    {
        let v = self.cell(idx, field)?;
        match v {
            Value::Number(n) => n
                .as_i64()
                .and_then(|x| T::try_from(x).ok())
                .ok_or_else(|| self.bad(field, v, "integer out of range")),
            Value::String(s) => s.trim().parse::<T>().map_err(|e| self.bad(field, v, e)),
            _ => Err(self.bad(field, v, "not an integer")),
        }
    }

    fn f64(&self, idx: usize, field: &'static str) -> Result<f64, TransformError> {
        let v = self.cell(idx, field)?;
        match v {
            Value::Number(n) => n.as_f64().ok_or_else(|| self.bad(field, v, "not a number")),
            Value::String(s) => s.trim().parse().map_err(|e| self.bad(field, v, e)),
            _ => Err(self.bad(field, v, "not a number")),
        }
    }

    fn date(&self, idx: usize, field: &'static str) -> Result<NaiveDate, TransformError> {
        let s = self.str(idx, field)?;
        NaiveDate::parse_from_str(s, DATE_FMT).map_err(|e| self.bad(field, &Value::from(s), e))
    }

    fn time(&self, idx: usize, field: &'static str) -> Result<NaiveTime, TransformError> {
        let s = self.str(idx, field)?;
        NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|e| self.bad(field, &Value::from(s), e))
    }

    fn datetime(&self, idx: usize, field: &'static str) -> Result<NaiveDateTime, TransformError> {
        let s = self.str(idx, field)?;
        NaiveDateTime::parse_from_str(s, DATETIME_FMT)
            .map_err(|e| self.bad(field, &Value::from(s), e))
    }
}
