// ===============================
// src/metrics.rs
// ===============================
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Calendar gate --------
pub static MARKET_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("market_open", "1 if the trading calendar reports open").unwrap()
});

// -------- Ingestion --------
pub static CURSOR: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("ingest_cursor", "highest trade number durably written").unwrap()
});

pub static BATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ingest_batches_total", "ingest cycles by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static TRADES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ingest_trades_total", "trades handed to the sink successfully").unwrap()
});

pub static REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ingest_rejected_total", "batches rejected before write (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static FETCH_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("source_fetch_errors_total", "failed source fetches").unwrap()
});

pub static INSERT_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("sink_insert_errors_total", "failed sink inserts").unwrap()
});

// fetch -> transform -> write, seconds
pub static CYCLE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "ingest_cycle_seconds",
        "duration of one fetch/transform/write cycle",
    ))
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_SOURCE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_source_mode", "market data source (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_SINK_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_sink_mode", "sink (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(MARKET_OPEN.clone())),
        REGISTRY.register(Box::new(CURSOR.clone())),
        REGISTRY.register(Box::new(BATCHES.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(REJECTED.clone())),
        REGISTRY.register(Box::new(FETCH_ERRORS.clone())),
        REGISTRY.register(Box::new(INSERT_ERRORS.clone())),
        REGISTRY.register(Box::new(CYCLE_SECONDS.clone())),
        REGISTRY.register(Box::new(CONFIG_SOURCE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SINK_MODE.clone())),
    ] {
        // AlreadyReg diabaikan (init bisa terpanggil dua kali di test)
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found\n")),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` until the shutdown flag flips.
pub async fn serve_metrics(port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    info!("metrics listening on http://{addr}/ (and /metrics)");
    let server = builder.serve(make_svc).with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    });
    if let Err(e) = server.await {
        error!(?e, "metrics server error");
    }
}
