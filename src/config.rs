// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : gateway_bus — in-process event bus for trading gateways
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Gateways normalize native updates into canonical events, an
          in-process bus fans them out by topic, keyed tables mirror the
          streams for display, a last-price cache tracks every instrument.
          Ships a mock venue, Prometheus metrics and a JSONL durable log.
=============================================================================
*/
use std::env;
use dotenvy::dotenv;

use crate::domain::split_vt_symbol;

#[derive(Clone, Debug)]
pub struct Args {
    // instruments, as <symbol>.<exchange>
    pub symbols: Vec<String>,
    // one mock gateway per name
    pub gateways: Vec<String>,

    // files/metrics
    pub log_file: Option<String>,
    pub metrics_port: u16,

    // bus
    pub queue_capacity: Option<usize>, // None = unbounded

    // bars + mock venue timing
    pub bar_interval_secs: u64,
    pub fill_ms: u64,
    pub tick_ms: u64,
}

impl Args {
    /// (symbol, exchange) pairs; entries without an exchange suffix are skipped.
    pub fn instruments(&self) -> Vec<(String, String)> {
        self.symbols
            .iter()
            .filter_map(|s| split_vt_symbol(s))
            .map(|(sym, ex)| (sym.to_string(), ex.to_string()))
            .collect()
    }
}

/// Comma separated, trimmed, upper-cased, empty entries dropped.
pub fn parse_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect();
    out.dedup();
    out
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|s| parse_list(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| parse_list(default))
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

pub fn load() -> Args {
    // Pastikan .env dibaca (agar LOG_FILE, SYMBOLS, dll ter-load)
    let _ = dotenv();

    // Multi-symbol: SYMBOLS=BTCUSDT.MOCK,ETHUSDT.MOCK
    let symbols  = env_list("SYMBOLS", "BTCUSDT.MOCK");
    // GATEWAYS=MOCK,SIM
    let gateways = env_list("GATEWAYS", "MOCK");

    let log_file = env::var("LOG_FILE").ok().filter(|s| !s.trim().is_empty());
    let metrics_port = env_num("METRICS_PORT", 9898);

    // 0 / kosong = unbounded
    let queue_capacity = Some(env_num::<usize>("BUS_QUEUE_CAPACITY", 0)).filter(|c| *c > 0);

    let bar_interval_secs = env_num("BAR_INTERVAL_SECS", 60);
    let fill_ms = env_num("FILL_MS", 50);
    let tick_ms = env_num("TICK_MS", 200);

    Args {
        symbols,
        gateways,
        log_file,
        metrics_port,
        queue_capacity,
        bar_interval_secs,
        fill_ms,
        tick_ms,
    }
}
