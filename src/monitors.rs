// ===============================
// src/monitors.rs
// ===============================
//
// Consumer-side panels. Each monitor = one KeyedTableSync bound to one
// topic through a hand-off queue: the dispatch loop only forwards, a
// dedicated task owns every table mutation (single owner, publish order).
//
// Preset key specs:
//   market        [vt_symbol, gateway_name]
//   order         vt_order_id
//   working order vt_order_id (+ terminal rows hidden)
//   trade         [vt_trade_id, gateway_name]
//   position      [vt_symbol, direction, gateway_name]
//   account       [vt_account_id, gateway_name, currency]
//   log / error   append-only
//
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{EventBus, SubscriptionHandle};
use crate::domain::{Account, ErrorRecord, LogRecord, Order, Payload, Position, Tick, Trade};
use crate::error::ConfigError;
use crate::event::{Category, Event};
use crate::table::{KeySpec, KeyedTableSync, Row, TableRecord, TableSpec};

/// error_id carried by ERROR events for rejected table updates.
pub const TABLE_ERROR_ID: i64 = 9002;

pub fn market() -> TableSpec {
    TableSpec::new(
        "market",
        KeySpec::fields(&["vt_symbol", "gateway_name"]),
        &[
            "symbol", "vt_symbol", "last_price", "pre_close_price", "volume", "open_interest", "open_price",
            "high_price", "low_price", "bid_price_1", "bid_volume_1", "ask_price_1", "ask_volume_1", "datetime",
            "gateway_name",
        ],
    )
}

const ORDER_FIELDS: &[&str] = &[
    "order_id", "symbol", "vt_symbol", "direction", "offset", "price", "total_volume", "traded_volume", "status",
    "order_time", "cancel_time", "gateway_name",
];

pub fn orders() -> TableSpec {
    TableSpec::new("order", KeySpec::field("vt_order_id"), ORDER_FIELDS)
}

/// Orders still alive at the venue.
pub fn working_orders() -> TableSpec {
    TableSpec::new("working_order", KeySpec::field("vt_order_id"), ORDER_FIELDS).hide_terminal()
}

pub fn trades() -> TableSpec {
    TableSpec::new(
        "trade",
        KeySpec::fields(&["vt_trade_id", "gateway_name"]),
        &[
            "trade_id", "order_id", "symbol", "vt_symbol", "direction", "offset", "price", "volume", "trade_time",
            "gateway_name",
        ],
    )
}

pub fn positions() -> TableSpec {
    TableSpec::new(
        "position",
        KeySpec::fields(&["vt_symbol", "direction", "gateway_name"]),
        &[
            "symbol", "vt_symbol", "direction", "position", "yd_position", "frozen", "price", "position_profit",
            "gateway_name",
        ],
    )
}

pub fn accounts() -> TableSpec {
    TableSpec::new(
        "account",
        KeySpec::fields(&["vt_account_id", "gateway_name", "currency"]),
        &[
            "account_id", "pre_balance", "balance", "available", "commission", "margin", "close_profit",
            "position_profit", "gateway_name", "currency",
        ],
    )
}

pub fn logs() -> TableSpec {
    TableSpec::new("log", KeySpec::None, &["log_time", "log_content", "gateway_name"])
}

pub fn errors() -> TableSpec {
    TableSpec::new(
        "error",
        KeySpec::None,
        &["error_time", "error_id", "error_msg", "gateway_name", "additional_info"],
    )
}

pub struct Monitor<R: TableRecord> {
    name: String,
    handle: SubscriptionHandle,
    table: Arc<Mutex<KeyedTableSync<R>>>,
    task: JoinHandle<()>,
}

/// Binds a fresh table to `topic`. Bad specs fail here, not at dispatch time.
pub fn spawn_monitor<R: TableRecord>(bus: &EventBus, topic: &str, spec: TableSpec) -> Result<Monitor<R>, ConfigError> {
    if !topic.is_empty() && !R::accepts_topic(topic) {
        return Err(ConfigError::TopicMismatch { kind: R::KIND, topic: topic.to_string() });
    }
    let table = Arc::new(Mutex::new(KeyedTableSync::<R>::new(spec)?));
    let (handle, mut rx) = bus.subscribe_handoff(topic)?;
    let name = table.lock().unwrap_or_else(|e| e.into_inner()).name().to_string();

    let t = table.clone();
    // weak: the bus registry already owns our sender
    let b = bus.downgrade();
    let n = name.clone();
    let task = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let res = t.lock().unwrap_or_else(|e| e.into_inner()).apply_event(&ev);
            if let Err(e) = res {
                warn!(monitor = %n, topic = %ev.topic, error = %e, "table update rejected");
                // a rejection on ERROR stays in the log, never back on ERROR
                if R::CATEGORY == Category::Error || ev.category() == Category::Error {
                    continue;
                }
                let Some(bus) = b.upgrade() else { continue };
                let mut rec = ErrorRecord::new(ev.payload.gateway_name(), TABLE_ERROR_ID, e.to_string());
                rec.additional_info = n.clone();
                bus.publish(Event::general(Payload::Error(rec)));
            }
        }
        debug!(monitor = %n, "monitor task stopped");
    });

    debug!(monitor = %name, %topic, "monitor attached");
    Ok(Monitor { name, handle, table, task })
}

impl<R: TableRecord> Monitor<R> {
    pub fn name(&self) -> &str { &self.name }

    pub fn topic(&self) -> &str { self.handle.topic() }

    /// Read access to the live table. Keep the guard short.
    pub fn table(&self) -> MutexGuard<'_, KeyedTableSync<R>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize { self.table().len() }

    pub fn is_empty(&self) -> bool { self.table().is_empty() }

    pub fn visible_len(&self) -> usize { self.table().visible_len() }

    pub fn rows(&self) -> Vec<Row<R>> { self.table().rows().to_vec() }

    /// Reconnect/reset.
    pub fn clear(&self) { self.table().clear() }

    /// Detaches from the bus, applies whatever was already handed off,
    /// and returns the final rows.
    pub async fn close(self, bus: &EventBus) -> Vec<Row<R>> {
        bus.unsubscribe(&self.handle);
        if let Err(e) = self.task.await {
            warn!(monitor = %self.name, error = %e, "monitor task ended abnormally");
        }
        let rows = self.table.lock().unwrap_or_else(|e| e.into_inner()).rows().to_vec();
        rows
    }
}

/// The full panel set a trading front end shows.
pub struct MonitorSet {
    pub market: Monitor<Tick>,
    pub orders: Monitor<Order>,
    pub working_orders: Monitor<Order>,
    pub trades: Monitor<Trade>,
    pub positions: Monitor<Position>,
    pub accounts: Monitor<Account>,
    pub logs: Monitor<LogRecord>,
    pub errors: Monitor<ErrorRecord>,
}

impl MonitorSet {
    pub fn spawn(bus: &EventBus) -> Result<Self, ConfigError> {
        Ok(Self {
            market: spawn_monitor(bus, Category::Tick.as_str(), market())?,
            orders: spawn_monitor(bus, Category::Order.as_str(), orders())?,
            working_orders: spawn_monitor(bus, Category::Order.as_str(), working_orders())?,
            trades: spawn_monitor(bus, Category::Trade.as_str(), trades())?,
            positions: spawn_monitor(bus, Category::Position.as_str(), positions())?,
            accounts: spawn_monitor(bus, Category::Account.as_str(), accounts())?,
            logs: spawn_monitor(bus, Category::Log.as_str(), logs())?,
            errors: spawn_monitor(bus, Category::Error.as_str(), errors())?,
        })
    }

    /// One line per panel: name=rows/visible.
    pub fn summary(&self) -> String {
        format!(
            "market={} orders={} working={}/{} trades={} positions={} accounts={} logs={} errors={}",
            self.market.len(),
            self.orders.len(),
            self.working_orders.visible_len(),
            self.working_orders.len(),
            self.trades.len(),
            self.positions.len(),
            self.accounts.len(),
            self.logs.len(),
            self.errors.len(),
        )
    }

    pub fn clear(&self) {
        self.market.clear();
        self.orders.clear();
        self.working_orders.clear();
        self.trades.clear();
        self.positions.clear();
        self.accounts.clear();
        self.logs.clear();
        self.errors.clear();
    }

    pub async fn close(self, bus: &EventBus) {
        self.market.close(bus).await;
        self.orders.close(bus).await;
        self.working_orders.close(bus).await;
        self.trades.close(bus).await;
        self.positions.close(bus).await;
        self.accounts.close(bus).await;
        self.logs.close(bus).await;
        self.errors.close(bus).await;
    }
}
