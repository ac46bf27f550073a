// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Bus --------
pub static EVENTS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_events_published_total", "events enqueued (label: category)"),
        &["category"],
    )
    .unwrap()
});

pub static EVENTS_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("bus_events_delivered_total", "successful handler invocations").unwrap()
});

pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("bus_events_dropped_total", "events lost to queue overflow or shutdown").unwrap()
});

pub static DELIVERY_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("bus_delivery_errors_total", "handlers that failed or panicked").unwrap()
});

// -------- Normalizer --------
pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "normalized ticks per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static LAST_PRICE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("last_price", "last price cache (label: symbol)"), &["symbol"]).unwrap()
});

pub static BARS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("bars_total", "bars published per symbol"), &["symbol"]).unwrap()
});

pub static GATEWAY_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gateway_errors_total", "errors reported through write_error"),
        &["gateway"],
    )
    .unwrap()
});

pub static LOG_SINK_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("log_sink_failures_total", "durable log lines that could not be queued").unwrap()
});

// -------- Tables --------
pub static TABLE_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("table_updates_rejected_total", "updates dropped for missing key fields"),
        &["table"],
    )
    .unwrap()
});

// -------- Gateways --------
pub static GATEWAY_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("gateway_connected", "1 if gateway reports healthy, 0 otherwise"),
        &["gateway"],
    )
    .unwrap()
});

pub static CONFIG_GATEWAYS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_gateways", "configured gateways").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(EVENTS_PUBLISHED.clone())),
        REGISTRY.register(Box::new(EVENTS_DELIVERED.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(DELIVERY_ERRORS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(LAST_PRICE.clone())),
        REGISTRY.register(Box::new(BARS.clone())),
        REGISTRY.register(Box::new(GATEWAY_ERRORS.clone())),
        REGISTRY.register(Box::new(LOG_SINK_FAILURES.clone())),
        REGISTRY.register(Box::new(TABLE_REJECTS.clone())),
        REGISTRY.register(Box::new(GATEWAY_CONNECTED.clone())),
        REGISTRY.register(Box::new(CONFIG_GATEWAYS.clone())),
    ] {
        // double registration only happens in tests
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

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        info!(%addr, "metrics listening on / and /metrics");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        init();
        TICKS_BY_SYMBOL.with_label_values(&["METRICS.TEST"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ticks_total_by_symbol"));
    }
}
