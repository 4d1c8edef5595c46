// ===============================
// src/domain.rs
// ===============================
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

pub const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FMT: &str = "%Y-%m-%d";

/// One source response: field names in the order the source chose this time,
/// rows positional against those names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RawBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub loaded_at: NaiveDateTime,
    pub trade_no: u64,
    pub trade_at: NaiveDateTime,
    pub board_id: String,
    pub sec_id: String,
    pub price: f64,
    pub quantity: u64,
    pub value: f64,
    pub period: String,
    pub tradetime_grp: i32,
    pub systime: NaiveDateTime,
    pub buysell: String,
    pub decimals: u8,
    pub trading_session: String,
    pub session_date: NaiveDate,
}

impl TradeRecord {
    /// Sink column names, same order as [`TradeRecord::to_row`].
    pub const COLUMNS: [&'static str; 15] = [
        "loaded_dttm",
        "trade_no",
        "trade_dttm",
        "board_id",
        "sec_id",
        "price_amt",
        "quantity_cnt",
        "trade_value",
        "period_code",
        "tradetime_grp",
        "systime_dttm",
        "buysell_code",
        "decimals_cnt",
        "tradingsession_code",
        "trade_session_dt",
    ];

    pub fn to_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.loaded_at.format(DATETIME_FMT).to_string()),
            Value::from(self.trade_no),
            Value::from(self.trade_at.format(DATETIME_FMT).to_string()),
            Value::from(self.board_id.clone()),
            Value::from(self.sec_id.clone()),
            Value::from(self.price),
            Value::from(self.quantity),
            Value::from(self.value),
            Value::from(self.period.clone()),
            Value::from(self.tradetime_grp),
            Value::from(self.systime.format(DATETIME_FMT).to_string()),
            Value::from(self.buysell.clone()),
            Value::from(self.decimals),
            Value::from(self.trading_session.clone()),
            Value::from(self.session_date.format(DATE_FMT).to_string()),
        ]
    }
}
