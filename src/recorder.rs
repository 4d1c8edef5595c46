// ===============================
// src/recorder.rs
// ===============================
//
// JSONL sink yang ringan & tahan banting:
// - Setiap row ditulis sebagai satu baris JSON {"target": .., "row": {..}} (append).
// - Satu batch = satu write_all + flush; cursor baru maju setelah flush sukses.
// - Otomatis membuat parent directory jika belum ada.
// - Jika tulis gagal, file dipotong kembali ke panjang sebelum batch (tidak ada
//   row setengah jadi), writer dibuang dan dibuka ulang pada insert berikutnya.
// - query() hanya paham DDL (no-op) dan `SELECT max(<col>) FROM <target>`.
//
// ENV: SINK_MODE=jsonl dan RECORD_FILE=/path/to/trades.jsonl (lihat config.rs).
//
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use tracing::{error, info, warn};

use crate::sink::{row_object, Sink, SinkError};

#[derive(Debug, Serialize, Deserialize)]
struct RecordLine {
    target: String,
    row: Map<String, Value>,
}

#[derive(Default)]
struct RecorderState {
    connected: bool,
    writer: Option<BufWriter<File>>,
}

pub struct RecorderSink {
    path: PathBuf,
    state: Mutex<RecorderState>,
}

async fn open_writer(path: &Path) -> Result<BufWriter<File>, SinkError> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

/// Append `buf` as one unit. On a write or flush error the file is cut back
/// to its length before the batch, so readers never see a partial batch.
async fn append_batch<W: AsyncWrite + Unpin>(path: &Path, out: &mut W, buf: &[u8]) -> Result<(), SinkError> {
    let pre_len = match fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    let written = match out.write_all(buf).await {
        Ok(()) => out.flush().await,
        Err(e) => Err(e),
    };
    let Err(e) = written else {
        return Ok(());
    };

    let truncated = match OpenOptions::new().write(true).open(path).await {
        Ok(file) => file.set_len(pre_len).await,
        Err(e) => Err(e),
    };
    if let Err(te) = truncated {
        error!(?te, len = pre_len, path = %path.display(), "recorder: cannot roll back partial batch");
    }
    Err(e.into())
}

/// `SELECT max(col) FROM target` -> (col, target), lower-cased.
fn parse_max(statement: &str) -> Option<(String, String)> {
    let lower = statement.trim().trim_end_matches(';').to_ascii_lowercase();
    let rest = lower.strip_prefix("select max(")?;
    let (col, rest) = rest.split_once(')')?;
    let target = rest.trim().strip_prefix("from")?.trim();
    let col = col.trim();
    if col.is_empty() || target.is_empty() || target.contains(char::is_whitespace) {
        return None;
    }
    Some((col.to_string(), target.to_string()))
}

fn cell_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl RecorderSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(RecorderState::default()),
        }
    }

    async fn scan_max(&self, col: &str, target: &str) -> Result<Option<u64>, SinkError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut max: Option<u64> = None;
        let mut corrupt = 0usize;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let rec: RecordLine = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(_) => {
                    corrupt += 1;
                    continue;
                }
            };
            if !rec.target.eq_ignore_ascii_case(target) {
                continue;
            }
            if let Some(v) = rec.row.get(col).and_then(cell_u64) {
                max = Some(max.map_or(v, |m| m.max(v)));
            }
        }
        if corrupt > 0 {
            warn!(corrupt, path = %self.path.display(), "recorder: skipped unreadable lines");
        }
        Ok(max)
    }
}

#[async_trait]
impl Sink for RecorderSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn connect(&self) -> Result<(), SinkError> {
        let mut st = self.state.lock().await;
        if st.writer.is_none() {
            st.writer = Some(open_writer(&self.path).await?);
        }
        if !st.connected {
            st.connected = true;
            info!(path = %self.path.display(), "recorder: started");
        }
        Ok(())
    }

    async fn insert(&self, target: &str, fields: &[&str], rows: &[Vec<Value>]) -> Result<(), SinkError> {
        let mut st = self.state.lock().await;
        if !st.connected {
            return Err(SinkError::NotConnected("jsonl"));
        }

        // Serialize seluruh batch dulu: kalau satu row gagal, tidak ada yang ditulis
        let mut buf = String::new();
        for row in rows {
            let line = RecordLine {
                target: target.to_string(),
                row: row_object(fields, row)?,
            };
            buf.push_str(&serde_json::to_string(&line).map_err(|e| SinkError::Payload(e.to_string()))?);
            buf.push('\n');
        }

        if st.writer.is_none() {
            st.writer = Some(open_writer(&self.path).await?);
        }
        let Some(writer) = st.writer.as_mut() else {
            return Err(SinkError::NotConnected("jsonl"));
        };

        if let Err(e) = append_batch(&self.path, writer, buf.as_bytes()).await {
            // sisa buffer ikut dibuang bersama writer
            error!(error = %e, "recorder: write failed, reopening on next insert");
            st.writer = None;
            return Err(e);
        }
        Ok(())
    }

    async fn query(&self, statement: &str) -> Result<Vec<Vec<Value>>, SinkError> {
        let head = statement.trim_start().to_ascii_lowercase();
        if head.starts_with("create ") {
            return Ok(Vec::new());
        }

        let (col, target) =
            parse_max(statement).ok_or_else(|| SinkError::Unsupported(statement.to_string()))?;

        let st = self.state.lock().await;
        if !st.connected {
            return Err(SinkError::NotConnected("jsonl"));
        }
        let max = self.scan_max(&col, &target).await?;
        drop(st);

        Ok(vec![vec![max.map(Value::from).unwrap_or(Value::Null)]])
    }

    async fn close(&self) {
        let mut st = self.state.lock().await;
        if let Some(mut w) = st.writer.take() {
            let _ = w.flush().await;
        }
        if st.connected {
            st.connected = false;
            info!("recorder: stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FIELDS: [&str; 2] = ["trade_no", "sec_id"];

    fn rows(ids: &[u64]) -> Vec<Vec<Value>> {
        ids.iter().map(|id| vec![json!(id), json!("SBER")]).collect()
    }

    #[test]
    fn parses_max_statement() {
        assert_eq!(
            parse_max("SELECT max(trade_no) FROM ods_moex.trades"),
            Some(("trade_no".into(), "ods_moex.trades".into()))
        );
        assert_eq!(
            parse_max("select MAX( trade_no ) from t;"),
            Some(("trade_no".into(), "t".into()))
        );
        assert_eq!(parse_max("SELECT count() FROM t"), None);
        assert_eq!(parse_max("SELECT max(x) FROM a b"), None);
    }

    #[tokio::test]
    async fn appends_and_reads_back_max() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trades.jsonl");
        let sink = RecorderSink::new(&path);
        sink.connect().await.unwrap();

        let q = "SELECT max(trade_no) FROM ods_moex.trades";
        assert_eq!(sink.query(q).await.unwrap(), vec![vec![Value::Null]]);
        assert!(sink.query("CREATE DATABASE IF NOT EXISTS ods_moex").await.unwrap().is_empty());

        sink.insert("ods_moex.trades", &FIELDS, &rows(&[101, 102, 99])).await.unwrap();
        sink.insert("other.table", &FIELDS, &rows(&[5000])).await.unwrap();
        assert_eq!(sink.query(q).await.unwrap(), vec![vec![json!(102)]]);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
        sink.close().await;
        sink.close().await;
    }

    #[tokio::test]
    async fn bad_row_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let sink = RecorderSink::new(&path);
        sink.connect().await.unwrap();

        let mut batch = rows(&[1, 2]);
        batch[1].pop();
        assert!(matches!(
            sink.insert("t", &FIELDS, &batch).await,
            Err(SinkError::RowWidth { .. })
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        std::fs::write(
            &path,
            "{\"target\":\"t\",\"row\":{\"trade_no\":\"7\"}}\n{\"target\":\"t\",\"ro\n",
        )
        .unwrap();
        let sink = RecorderSink::new(&path);
        sink.connect().await.unwrap();
        assert_eq!(
            sink.query("SELECT max(trade_no) FROM t").await.unwrap(),
            vec![vec![json!(7)]]
        );
    }

    // disk yang penuh setelah `room` byte
    struct ShortDisk {
        file: std::fs::File,
        room: usize,
    }

    impl AsyncWrite for ShortDisk {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            use std::io::Write;
            let me = self.get_mut();
            if me.room == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::new(ErrorKind::Other, "no space left on device")));
            }
            let n = buf.len().min(me.room);
            me.room -= n;
            std::task::Poll::Ready(me.file.write(&buf[..n]))
        }

        fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_failing_midway_leaves_no_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let sink = RecorderSink::new(&path);
        sink.connect().await.unwrap();
        sink.insert("t", &FIELDS, &rows(&[10, 11])).await.unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let batch = "{\"target\":\"t\",\"row\":{\"trade_no\":500}}\n".repeat(3);
        let mut disk = ShortDisk {
            file: std::fs::OpenOptions::new().append(true).open(&path).unwrap(),
            room: 50,
        };
        assert!(append_batch(&path, &mut disk, batch.as_bytes()).await.is_err());

        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        let q = "SELECT max(trade_no) FROM t";
        assert_eq!(sink.query(q).await.unwrap(), vec![vec![json!(11)]]);

        // sink tetap bisa append setelah rollback
        sink.insert("t", &FIELDS, &rows(&[12])).await.unwrap();
        assert_eq!(sink.query(q).await.unwrap(), vec![vec![json!(12)]]);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn rejects_unknown_statements_and_closed_use() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecorderSink::new(dir.path().join("t.jsonl"));
        assert!(matches!(
            sink.insert("t", &FIELDS, &rows(&[1])).await,
            Err(SinkError::NotConnected("jsonl"))
        ));
        sink.connect().await.unwrap();
        assert!(matches!(
            sink.query("DELETE FROM t").await,
            Err(SinkError::Unsupported(_))
        ));
    }
}
