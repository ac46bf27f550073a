// ===============================
// src/gateway.rs
// ===============================
//
// Gateway side of the bus.
// - GatewayAdapter : what every connector exposes to the process
// - MockGateway    : simulated venue, no network
//     * ticks      : random walk per subscribed instrument, 5 book levels
//     * orders     : Submitted -> (fill_ms) -> Filled, or Cancelled if
//                    cancelled first; bad price/volume -> Rejected
//     * fills      : Trade + Position + Account updates
//     * connect    : Contract snapshot for every configured instrument
//
// Adapters never publish and never return errors to the bus: every update
// goes through the normalizer, every failure through `report_fault`.
// All methods spawn on the current tokio runtime.
//
use ahash::AHashMap as HashMap;
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::domain::{
    vt_id, vt_symbol, Account, CancelRequest, Contract, Direction, Offset, Order, OrderRequest, OrderStatus,
    Position, ProductClass, SubscribeRequest, Tick, Trade, DEPTH,
};
use crate::error::GatewayFault;
use crate::metrics::GATEWAY_CONNECTED;
use crate::normalizer::EventNormalizer;

pub trait GatewayAdapter: Send + Sync {
    fn gateway_name(&self) -> &str;
    fn connect(&self);
    fn subscribe(&self, req: SubscribeRequest);
    /// Returns the gateway-qualified order id, `None` if the request never
    /// reached the venue (the reason is on the ERROR topic).
    fn send_order(&self, req: OrderRequest) -> Option<String>;
    fn cancel_order(&self, req: CancelRequest);
    fn query_account(&self);
    fn query_position(&self);
    fn close(&self);
    fn check_status(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub tick_ms: u64,
    pub fill_ms: u64,
    pub start_price: f64,
    pub price_tick: f64,
    pub account_id: String,
    pub currency: String,
    pub balance: f64,
    /// commission = notional * fee_rate
    pub fee_rate: f64,
    /// margin = notional * margin_rate
    pub margin_rate: f64,
    /// Simulates an unreachable venue.
    pub fail_connect: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            fill_ms: 50,
            start_price: 100.0,
            price_tick: 0.01,
            account_id: "SIM001".to_string(),
            currency: "USD".to_string(),
            balance: 1_000_000.0,
            fee_rate: 0.0002,
            margin_rate: 0.1,
            fail_connect: false,
        }
    }
}

#[derive(Default)]
struct MockState {
    orders: HashMap<String, Order>,
    positions: HashMap<(String, Direction), Position>,
    // listed (symbol, exchange) pairs
    instruments: Vec<(String, String)>,
    feeds: HashMap<String, JoinHandle<()>>,
    fills: Vec<JoinHandle<()>>,
    pre_balance: f64,
    balance: f64,
    commission: f64,
    close_profit: f64,
}

pub struct MockGateway {
    normalizer: Arc<EventNormalizer>,
    cfg: MockConfig,
    connected: Arc<AtomicBool>,
    next_order: AtomicU64,
    next_trade: Arc<AtomicU64>,
    state: Arc<Mutex<MockState>>,
}

impl MockGateway {
    /// `instruments` are (symbol, exchange) pairs whose contracts the venue lists.
    pub fn new(normalizer: Arc<EventNormalizer>, cfg: MockConfig, instruments: Vec<(String, String)>) -> Self {
        let state = MockState {
            instruments,
            pre_balance: cfg.balance,
            balance: cfg.balance,
            ..Default::default()
        };
        Self {
            normalizer,
            cfg,
            connected: Arc::new(AtomicBool::new(false)),
            next_order: AtomicU64::new(1),
            next_trade: Arc::new(AtomicU64::new(1)),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn normalizer(&self) -> &Arc<EventNormalizer> { &self.normalizer }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(&self) -> bool {
        if self.connected.load(Ordering::Acquire) {
            return true;
        }
        self.normalizer.report_fault(&GatewayFault::NotConnected);
        false
    }

    fn is_listed(&self, symbol: &str, exchange: &str) -> bool {
        self.lock().instruments.iter().any(|(s, e)| s == symbol && e == exchange)
    }

    fn contract(&self, symbol: &str, exchange: &str) -> Contract {
        Contract {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            vt_symbol: vt_symbol(symbol, exchange),
            name: symbol.to_string(),
            product_class: ProductClass::Spot,
            size: 1.0,
            price_tick: self.cfg.price_tick,
            strike_price: None,
            underlying_symbol: None,
            option_type: None,
            gateway_name: self.gateway_name().to_string(),
        }
    }
}

fn account_snapshot(st: &MockState, cfg: &MockConfig, gateway: &str) -> Account {
    let (margin, position_profit) = st
        .positions
        .values()
        .fold((0.0, 0.0), |(m, p), pos| (m + pos.position * pos.price * cfg.margin_rate, p + pos.position_profit));
    Account {
        account_id: cfg.account_id.clone(),
        vt_account_id: vt_id(gateway, &cfg.account_id),
        pre_balance: st.pre_balance,
        balance: st.balance,
        available: st.balance - margin,
        commission: st.commission,
        margin,
        close_profit: st.close_profit,
        position_profit,
        currency: cfg.currency.clone(),
        gateway_name: gateway.to_string(),
    }
}

/// Applies a fill to the long/short books. Open adds to `direction`,
/// close reduces the opposite side and realizes PnL against its avg price.
fn apply_fill(st: &mut MockState, trade: &Trade, gateway: &str) -> Position {
    let (side, opening) = match trade.offset {
        Offset::Close | Offset::CloseToday | Offset::CloseYesterday => (opposite(trade.direction), false),
        _ => (trade.direction, true),
    };
    let pos = st.positions.entry((trade.vt_symbol.clone(), side)).or_insert_with(|| Position {
        symbol: trade.symbol.clone(),
        exchange: trade.exchange.clone(),
        vt_symbol: trade.vt_symbol.clone(),
        direction: Some(side),
        position: 0.0,
        yd_position: 0.0,
        frozen: 0.0,
        price: 0.0,
        position_profit: 0.0,
        gateway_name: gateway.to_string(),
    });

    let mut realized = 0.0;
    if opening {
        // arah sama -> update avg cost
        let qty = pos.position + trade.volume;
        pos.price = if qty > 0.0 { (pos.price * pos.position + trade.price * trade.volume) / qty } else { 0.0 };
        pos.position = qty;
    } else {
        let closed = trade.volume.min(pos.position);
        realized = (trade.price - pos.price) * closed * side.sign();
        pos.position -= closed;
        if pos.position <= 0.0 {
            pos.position = 0.0;
            pos.price = 0.0;
        }
    }
    pos.position_profit = (trade.price - pos.price) * pos.position * side.sign();
    let snapshot = pos.clone();
    st.close_profit += realized;
    st.balance += realized;
    snapshot
}

fn opposite(d: Direction) -> Direction {
    match d {
        Direction::Long => Direction::Short,
        Direction::Short => Direction::Long,
        Direction::Net => Direction::Net,
    }
}

/// One random-walk step. The book is symmetric around `last`.
fn mock_tick(symbol: &str, exchange: &str, gateway: &str, last: f64, price_tick: f64, volume: f64, open: f64) -> Tick {
    let mut t = Tick {
        symbol: symbol.to_string(),
        exchange: exchange.to_string(),
        vt_symbol: vt_symbol(symbol, exchange),
        last_price: Some(last),
        pre_close_price: open,
        volume,
        open_price: open,
        high_price: last.max(open),
        low_price: last.min(open),
        datetime: Utc::now(),
        gateway_name: gateway.to_string(),
        ..Default::default()
    };
    for i in 0..DEPTH {
        let off = price_tick * (i + 1) as f64;
        t.bid_price[i] = Some(last - off);
        t.ask_price[i] = Some(last + off);
        t.bid_volume[i] = (10 * (i + 1)) as f64;
        t.ask_volume[i] = (10 * (i + 1)) as f64;
    }
    t
}

impl GatewayAdapter for MockGateway {
    fn gateway_name(&self) -> &str { self.normalizer.gateway_name() }

    fn connect(&self) {
        if self.cfg.fail_connect {
            self.normalizer.report_fault(&GatewayFault::Connect("mock venue unreachable".to_string()));
            return;
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            debug!(gateway = %self.gateway_name(), "already connected");
            return;
        }
        GATEWAY_CONNECTED.with_label_values(&[self.gateway_name()]).set(1);
        self.normalizer.write_log("connected");
        info!(gateway = %self.gateway_name(), "mock gateway connected");

        let listed = self.lock().instruments.clone();
        for (sym, ex) in &listed {
            self.normalizer.on_contract(self.contract(sym, ex));
        }
        self.normalizer.write_log(format!("contracts loaded: {}", listed.len()));
        self.query_account();
        self.query_position();
    }

    fn subscribe(&self, req: SubscribeRequest) {
        if !self.ensure_connected() {
            return;
        }
        if !self.is_listed(&req.symbol, &req.exchange) {
            self.normalizer
                .report_fault(&GatewayFault::Rejected(format!("unknown instrument {}.{}", req.symbol, req.exchange)));
            return;
        }
        let key = vt_symbol(&req.symbol, &req.exchange);
        let mut st = self.lock();
        if st.feeds.contains_key(&key) {
            return;
        }

        let normalizer = self.normalizer.clone();
        let connected = self.connected.clone();
        let (tick_ms, price_tick, open) = (self.cfg.tick_ms.max(1), self.cfg.price_tick, self.cfg.start_price);
        let (symbol, exchange) = (req.symbol, req.exchange);
        let handle = tokio::spawn(async move {
            let gateway = normalizer.gateway_name().to_string();
            let mut last = open;
            let mut volume = 0.0;
            while connected.load(Ordering::Acquire) {
                // jangan simpan ThreadRng melewati .await
                let (step, traded) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(-3..=3), rng.gen_range(1..=10))
                };
                last = (last + step as f64 * price_tick).max(price_tick);
                volume += traded as f64;
                normalizer.on_tick(mock_tick(&symbol, &exchange, &gateway, last, price_tick, volume, open));
                sleep(Duration::from_millis(tick_ms)).await;
            }
        });
        st.feeds.insert(key.clone(), handle);
        drop(st);
        self.normalizer.write_log(format!("subscribed {key}"));
    }

    fn send_order(&self, req: OrderRequest) -> Option<String> {
        if !self.ensure_connected() {
            return None;
        }
        let gateway = self.gateway_name().to_string();
        let order_id = self.next_order.fetch_add(1, Ordering::Relaxed).to_string();
        let vt_order_id = vt_id(&gateway, &order_id);
        let mut order = Order {
            symbol: req.symbol.clone(),
            exchange: req.exchange.clone(),
            vt_symbol: vt_symbol(&req.symbol, &req.exchange),
            order_id: order_id.clone(),
            vt_order_id: vt_order_id.clone(),
            direction: req.direction,
            offset: req.offset,
            price: req.price,
            total_volume: req.volume,
            traded_volume: 0.0,
            status: OrderStatus::Submitted,
            order_time: Utc::now(),
            cancel_time: None,
            gateway_name: gateway.clone(),
        };

        if req.price <= 0.0 || req.volume <= 0.0 || !self.is_listed(&req.symbol, &req.exchange) {
            order.status = OrderStatus::Rejected;
            self.lock().orders.insert(vt_order_id.clone(), order.clone());
            self.normalizer.on_order(order);
            self.normalizer.report_fault(&GatewayFault::Rejected(format!(
                "order {vt_order_id}: px={} qty={} on {}.{}",
                req.price, req.volume, req.symbol, req.exchange
            )));
            return Some(vt_order_id);
        }

        self.lock().orders.insert(vt_order_id.clone(), order.clone());
        self.normalizer.on_order(order);

        // ack -> fill after fill_ms, unless cancelled in between
        let normalizer = self.normalizer.clone();
        let state = self.state.clone();
        let next_trade = self.next_trade.clone();
        let cfg = self.cfg.clone();
        let id = vt_order_id.clone();
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(cfg.fill_ms)).await;
            let updates = {
                let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
                let Some(o) = st.orders.get_mut(&id) else { return };
                if o.status.is_terminal() {
                    return;
                }
                o.status = OrderStatus::Filled;
                o.traded_volume = o.total_volume;
                let filled = o.clone();

                let trade_id = next_trade.fetch_add(1, Ordering::Relaxed).to_string();
                let trade = Trade {
                    symbol: filled.symbol.clone(),
                    exchange: filled.exchange.clone(),
                    vt_symbol: filled.vt_symbol.clone(),
                    trade_id: trade_id.clone(),
                    vt_trade_id: vt_id(&filled.gateway_name, &trade_id),
                    order_id: filled.order_id.clone(),
                    vt_order_id: filled.vt_order_id.clone(),
                    direction: filled.direction,
                    offset: filled.offset,
                    price: filled.price,
                    volume: filled.total_volume,
                    trade_time: Utc::now(),
                    gateway_name: filled.gateway_name.clone(),
                };
                let fee = trade.price * trade.volume * cfg.fee_rate;
                st.commission += fee;
                st.balance -= fee;
                let position = apply_fill(&mut st, &trade, &filled.gateway_name);
                let account = account_snapshot(&st, &cfg, &filled.gateway_name);
                (filled, trade, position, account)
            };
            let (filled, trade, position, account) = updates;
            normalizer.on_order(filled);
            normalizer.on_trade(trade);
            normalizer.on_position(position);
            normalizer.on_account(account);
        });
        let mut st = self.lock();
        st.fills.retain(|h| !h.is_finished());
        st.fills.push(handle);
        Some(vt_order_id)
    }

    fn cancel_order(&self, req: CancelRequest) {
        if !self.ensure_connected() {
            return;
        }
        let vt_order_id = vt_id(self.gateway_name(), &req.order_id);
        let cancelled = {
            let mut st = self.lock();
            match st.orders.get_mut(&vt_order_id) {
                Some(o) if !o.status.is_terminal() => {
                    o.status = OrderStatus::Cancelled;
                    o.cancel_time = Some(Utc::now());
                    Some(o.clone())
                }
                _ => None,
            }
        };
        match cancelled {
            Some(o) => self.normalizer.on_order(o),
            None => self
                .normalizer
                .report_fault(&GatewayFault::Rejected(format!("cancel {vt_order_id}: no working order"))),
        }
    }

    fn query_account(&self) {
        if !self.ensure_connected() {
            return;
        }
        let account = account_snapshot(&self.lock(), &self.cfg, self.gateway_name());
        self.normalizer.on_account(account);
    }

    fn query_position(&self) {
        if !self.ensure_connected() {
            return;
        }
        let positions: Vec<Position> = self.lock().positions.values().cloned().collect();
        for p in positions {
            self.normalizer.on_position(p);
        }
    }

    fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut st = self.lock();
            for (_, h) in st.feeds.drain() {
                h.abort();
            }
            for h in st.fills.drain(..) {
                h.abort();
            }
        }
        self.normalizer.flush_bars();
        GATEWAY_CONNECTED.with_label_values(&[self.gateway_name()]).set(0);
        self.normalizer.write_log("disconnected");
        info!(gateway = %self.gateway_name(), "mock gateway closed");
    }

    fn check_status(&self) -> bool {
        self.connected.load(Ordering::Acquire)
            && self.lock().feeds.values().all(|h| !h.is_finished())
    }
}
