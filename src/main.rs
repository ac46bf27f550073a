// ===============================
// src/main.rs
// ===============================
/*
 # jalankan 30 detik dengan dua gateway mock
 SYMBOLS=BTCUSDT.MOCK,ETHUSDT.MOCK GATEWAYS=MOCK,SIM cargo run -- --duration-secs 30

 # aktivitas bus & cache
curl -s localhost:9898/metrics | grep '^bus_events'
curl -s localhost:9898/metrics | grep '^last_price'
*/
/*
=============================================================================
Project : gateway_bus — in-process event bus for trading gateways
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Starts the bus, one mock gateway per configured name, the
          consumer panels and a demo order flow; heartbeats bus statistics
          and the last-price cache until Ctrl-C or --duration-secs.
=============================================================================
*/
use clap::Parser;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::{
    select,
    time::{interval, sleep, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gateway_bus::bar::BarGenerator;
use gateway_bus::bus::{BusConfig, EventBus};
use gateway_bus::config;
use gateway_bus::domain::{vt_symbol, Direction, Offset, OrderRequest, Payload, SubscribeRequest};
use gateway_bus::event::Category;
use gateway_bus::gateway::{GatewayAdapter, MockConfig, MockGateway};
use gateway_bus::metrics;
use gateway_bus::monitors::MonitorSet;
use gateway_bus::normalizer::EventNormalizer;
use gateway_bus::recorder::{JsonlRecorder, LogSink};

#[derive(Parser, Debug)]
#[command(name = "gateway_bus", about = "Mock trading gateways on an in-process event bus")]
struct Cli {
    /// Comma list of <symbol>.<exchange>; overrides SYMBOLS
    #[arg(long)]
    symbols: Option<String>,
    /// Comma list of gateway names; overrides GATEWAYS
    #[arg(long)]
    gateways: Option<String>,
    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long)]
    duration_secs: Option<u64>,
    /// Seconds between demo orders, 0 disables them
    #[arg(long, default_value_t = 2)]
    order_every_secs: u64,
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config (env) + CLI overrides ----
    let cli = Cli::parse();
    let mut args = config::load();
    if let Some(s) = cli.symbols.as_deref() {
        args.symbols = config::parse_list(s);
    }
    if let Some(g) = cli.gateways.as_deref() {
        args.gateways = config::parse_list(g);
    }
    let instruments = args.instruments();
    if instruments.is_empty() {
        error!(symbols = ?args.symbols, "no usable <symbol>.<exchange> in SYMBOLS");
        return;
    }

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);
    metrics::CONFIG_GATEWAYS.set(args.gateways.len() as i64);

    info!(
        symbols = ?args.symbols,
        gateways = ?args.gateways,
        queue_capacity = ?args.queue_capacity,
        bar_interval_secs = args.bar_interval_secs,
        log_file = ?args.log_file,
        "startup config"
    );

    // ---- Bus ----
    let bus = match EventBus::new(BusConfig { name: "EventBus".into(), queue_capacity: args.queue_capacity }) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "bus configuration rejected");
            return;
        }
    };

    // ---- Durable log (optional) ----
    let recorder = args.log_file.clone().map(|path| JsonlRecorder::spawn(path, 8192));

    // ---- Consumers ----
    let monitors = match MonitorSet::spawn(&bus) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "monitor configuration rejected");
            return;
        }
    };
    let fills = bus.subscribe(Category::Trade.as_str(), |ev| {
        if let Payload::Trade(t) = &ev.payload {
            info!(vt_trade_id = %t.vt_trade_id, vt_symbol = %t.vt_symbol, px = t.price, qty = t.volume, "fill");
        }
        Ok(())
    });
    if let Err(e) = fills {
        warn!(error = %e, "fill logger not attached");
    }

    if let Err(e) = bus.start() {
        error!(error = %e, "bus start failed");
        return;
    }

    // ---- Gateways ----
    let mut gateways: Vec<Arc<dyn GatewayAdapter>> = Vec::new();
    for name in &args.gateways {
        let mut normalizer = EventNormalizer::new(name.clone(), bus.clone());
        if let Some((rec, _)) = &recorder {
            normalizer = normalizer.with_log_sink(Arc::new(rec.clone()) as Arc<dyn LogSink>);
        }
        for (sym, ex) in &instruments {
            normalizer.register_bar_aggregator(vt_symbol(sym, ex), Box::new(BarGenerator::new(args.bar_interval_secs)));
        }
        let cfg = MockConfig { tick_ms: args.tick_ms, fill_ms: args.fill_ms, ..Default::default() };
        let gw = MockGateway::new(Arc::new(normalizer), cfg, instruments.clone());
        gw.connect();
        for (sym, ex) in &instruments {
            gw.subscribe(SubscribeRequest { symbol: sym.clone(), exchange: ex.clone() });
        }
        gateways.push(Arc::new(gw));
    }

    // ---- Demo order flow: open long, close it next round ----
    let trader = {
        let gws = gateways.clone();
        let prices = bus.last_prices().clone();
        let instruments = instruments.clone();
        let every = cli.order_every_secs;
        tokio::spawn(async move {
            if every == 0 {
                return;
            }
            let mut round: u64 = 0;
            let mut tick = interval(Duration::from_secs(every));
            loop {
                tick.tick().await;
                round += 1;
                let (direction, offset) =
                    if round % 2 == 1 { (Direction::Long, Offset::Open) } else { (Direction::Short, Offset::Close) };
                for gw in &gws {
                    for (sym, ex) in &instruments {
                        let Some(px) = prices.get(&vt_symbol(sym, ex)) else { continue };
                        gw.send_order(OrderRequest {
                            symbol: sym.clone(),
                            exchange: ex.clone(),
                            direction,
                            offset,
                            price: px,
                            volume: 1.0,
                        });
                    }
                }
            }
        })
    };

    // ---- Heartbeat until Ctrl-C / deadline ----
    let deadline = async {
        match cli.duration_secs {
            Some(s) => sleep(Duration::from_secs(s)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut heartbeat = interval(Duration::from_secs(1));

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                break;
            }
            _ = &mut deadline => {
                info!("run duration reached, shutting down");
                break;
            }
            _ = heartbeat.tick() => {
                let s = bus.stats();
                let healthy = gateways.iter().filter(|g| g.check_status()).count();
                info!(
                    published = s.published,
                    delivered = s.delivered,
                    dropped = s.dropped,
                    delivery_errors = s.delivery_errors,
                    gateways_up = healthy,
                    panels = %monitors.summary(),
                    prices = ?bus.last_prices().snapshot(),
                    "heartbeat"
                );
            }
        }
    }

    // ---- Shutdown: producers, bus (drains), consumers, durable log ----
    trader.abort();
    for gw in &gateways {
        gw.close();
    }
    drop(gateways);
    bus.shutdown().await;
    let final_panels = monitors.summary();
    monitors.close(&bus).await;

    let mut tasks = vec![trader];
    if let Some((rec, handle)) = recorder {
        drop(rec);
        tasks.push(handle);
    }
    for res in join_all(tasks).await {
        if let Err(e) = res {
            if !e.is_cancelled() {
                warn!(error = %e, "task ended abnormally");
            }
        }
    }
    info!(stats = ?bus.stats(), panels = %final_panels, "stopped");
}
