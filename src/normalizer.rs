// ===============================
// src/normalizer.rs
// ===============================
//
// Gateway-side entry points. One normalizer per gateway; gateways call
// exactly one `on_*` per native update and never publish directly.
//
// Topic pairs (general + specific, always both):
//   on_tick     -> TICK,     TICK:<vt_symbol>
//   on_trade    -> TRADE,    TRADE:<vt_symbol>
//   on_order    -> ORDER,    ORDER:<vt_order_id>
//   on_position -> POSITION, POSITION:<vt_symbol>
//   on_account  -> ACCOUNT,  ACCOUNT:<vt_account_id>
// Single topic:
//   on_contract -> CONTRACT
//   on_bar      -> BAR (or caller topic)
//   on_log      -> LOG
//   on_error    -> ERROR
//
// Every delivery gets its own clone of the record.
//
use ahash::AHashMap as HashMap;
use chrono::Utc;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::bar::BarAggregator;
use crate::bus::EventBus;
use crate::domain::{Account, Bar, Contract, ErrorRecord, LogRecord, Order, Payload, Position, Tick, Trade};
use crate::error::GatewayFault;
use crate::event::{Category, Event};
use crate::metrics::{BARS, GATEWAY_ERRORS, LOG_SINK_FAILURES, TICKS_BY_SYMBOL};
use crate::recorder::{LogLine, LogSink};

pub struct EventNormalizer {
    gateway_name: String,
    bus: EventBus,
    account_id: RwLock<String>,
    aggregators: Mutex<HashMap<String, Box<dyn BarAggregator>>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for EventNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNormalizer")
            .field("gateway_name", &self.gateway_name)
            .field("account_id", &self.account_id())
            .field("durable_sink", &self.sink.is_some())
            .finish()
    }
}

impl EventNormalizer {
    pub fn new(gateway_name: impl Into<String>, bus: EventBus) -> Self {
        Self {
            gateway_name: gateway_name.into(),
            bus,
            account_id: RwLock::new(String::new()),
            aggregators: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn gateway_name(&self) -> &str { &self.gateway_name }

    pub fn bus(&self) -> &EventBus { &self.bus }

    /// Account id of the most recent ACCOUNT update.
    pub fn account_id(&self) -> String {
        self.account_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ticks of `vt_symbol` are forwarded to `agg`; completed bars go
    /// through `on_bar`. Returns the aggregator it replaced.
    pub fn register_bar_aggregator(
        &self,
        vt_symbol: impl Into<String>,
        agg: Box<dyn BarAggregator>,
    ) -> Option<Box<dyn BarAggregator>> {
        self.aggregators.lock().unwrap_or_else(|e| e.into_inner()).insert(vt_symbol.into(), agg)
    }

    pub fn remove_bar_aggregator(&self, vt_symbol: &str) -> Option<Box<dyn BarAggregator>> {
        self.aggregators.lock().unwrap_or_else(|e| e.into_inner()).remove(vt_symbol)
    }

    /// Publishes every bar still under construction.
    pub fn flush_bars(&self) {
        let pending: Vec<Bar> = {
            let mut aggs = self.aggregators.lock().unwrap_or_else(|e| e.into_inner());
            aggs.values_mut().filter_map(|a| a.flush()).collect()
        };
        for bar in pending {
            self.on_bar(bar, None);
        }
    }

    pub fn on_tick(&self, tick: Tick) {
        TICKS_BY_SYMBOL.with_label_values(&[&tick.vt_symbol]).inc();
        self.bus.publish(Event::general(Payload::Tick(tick.clone())));
        self.bus.last_prices().update(&tick);
        self.bus.publish(Event::specific(Payload::Tick(tick.clone()), &tick.vt_symbol));

        let completed = {
            let mut aggs = self.aggregators.lock().unwrap_or_else(|e| e.into_inner());
            aggs.get_mut(&tick.vt_symbol).and_then(|a| a.update_tick(&tick))
        };
        if let Some(bar) = completed {
            self.on_bar(bar, None);
        }
    }

    /// `topic = None` publishes on `BAR`.
    pub fn on_bar(&self, bar: Bar, topic: Option<&str>) {
        let topic = match topic {
            Some(t) if !t.is_empty() => t,
            _ => Category::Bar.as_str(),
        };
        BARS.with_label_values(&[&bar.vt_symbol]).inc();
        let summary = format!(
            "Onbar Event:{},{},o:{},h:{},l:{},c:{}",
            bar.vt_symbol, bar.datetime, bar.open, bar.high, bar.low, bar.close
        );
        self.bus.publish(Event::with_topic(topic, Payload::Bar(bar)));
        self.write_log(summary);
    }

    pub fn on_trade(&self, trade: Trade) {
        let key = trade.vt_symbol.clone();
        self.bus.publish(Event::general(Payload::Trade(trade.clone())));
        self.bus.publish(Event::specific(Payload::Trade(trade), &key));
    }

    pub fn on_order(&self, order: Order) {
        let key = order.vt_order_id.clone();
        self.bus.publish(Event::general(Payload::Order(order.clone())));
        self.bus.publish(Event::specific(Payload::Order(order), &key));
    }

    pub fn on_position(&self, position: Position) {
        let key = position.vt_symbol.clone();
        self.bus.publish(Event::general(Payload::Position(position.clone())));
        self.bus.publish(Event::specific(Payload::Position(position), &key));
    }

    pub fn on_account(&self, account: Account) {
        let key = account.vt_account_id.clone();
        *self.account_id.write().unwrap_or_else(|e| e.into_inner()) = account.account_id.clone();
        self.bus.publish(Event::general(Payload::Account(account.clone())));
        self.bus.publish(Event::specific(Payload::Account(account), &key));
    }

    /// Reference data: general topic only.
    pub fn on_contract(&self, contract: Contract) {
        self.bus.publish(Event::general(Payload::Contract(contract)));
    }

    pub fn on_log(&self, log: LogRecord) {
        debug!(gateway = %self.gateway_name, content = %log.log_content, "gateway log");
        let line = LogLine::info(&self.gateway_name, &log.log_content);
        self.bus.publish(Event::general(Payload::Log(log)));
        self.append_durable(&line);
    }

    pub fn on_error(&self, err: ErrorRecord) {
        self.bus.publish(Event::general(Payload::Error(err)));
    }

    pub fn write_log(&self, content: impl Into<String>) {
        self.on_log(LogRecord::new(&self.gateway_name, content));
    }

    /// The only failure path for adapters. Never fails itself.
    pub fn write_error(&self, content: impl Into<String>, code: i64) {
        let content = content.into();
        GATEWAY_ERRORS.with_label_values(&[&self.gateway_name]).inc();
        self.on_error(ErrorRecord::new(&self.gateway_name, code, content.clone()));

        // diagnostic stream
        eprintln!("{}:{} {}", Utc::now(), self.gateway_name, content);
        error!(gateway = %self.gateway_name, code, %content, "gateway error");
        self.append_durable(&LogLine::error(&self.gateway_name, &content, code));
    }

    pub fn report_fault(&self, fault: &GatewayFault) {
        self.write_error(fault.to_string(), fault.code());
    }

    fn append_durable(&self, line: &LogLine) {
        let Some(sink) = &self.sink else { return };
        if let Err(e) = sink.append(line) {
            LOG_SINK_FAILURES.inc();
            warn!(gateway = %self.gateway_name, error = %e, "durable log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::BarGenerator;
    use crate::domain::{Direction, Offset, OrderStatus, ProductClass};
    use crate::error::SinkError;
    use chrono::TimeZone;

    type Seen = Arc<Mutex<Vec<Event>>>;

    fn watch(bus: &EventBus, topic: &str) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(topic, move |ev| {
            s.lock().unwrap().push(ev.clone());
            Ok(())
        })
        .unwrap();
        seen
    }

    fn tick(vt: &str, last: Option<f64>) -> Tick {
        Tick { vt_symbol: vt.into(), last_price: last, gateway_name: "GW".into(), ..Default::default() }
    }

    fn order(status: OrderStatus) -> Order {
        Order {
            symbol: "X".into(),
            exchange: "EX".into(),
            vt_symbol: "X.EX".into(),
            order_id: "7".into(),
            vt_order_id: "GW.7".into(),
            direction: Direction::Long,
            offset: Offset::Open,
            price: 10.0,
            total_volume: 2.0,
            traded_volume: 0.0,
            status,
            order_time: Utc::now(),
            cancel_time: None,
            gateway_name: "GW".into(),
        }
    }

    fn account() -> Account {
        Account {
            account_id: "ACC1".into(),
            vt_account_id: "GW.ACC1".into(),
            pre_balance: 1000.0,
            balance: 1010.0,
            available: 900.0,
            commission: 1.0,
            margin: 100.0,
            close_profit: 5.0,
            position_profit: 6.0,
            currency: "USD".into(),
            gateway_name: "GW".into(),
        }
    }

    struct FailingSink;
    impl LogSink for FailingSink {
        fn append(&self, _: &LogLine) -> Result<(), SinkError> { Err(SinkError::Closed) }
    }

    struct MemorySink(Mutex<Vec<LogLine>>);
    impl LogSink for MemorySink {
        fn append(&self, l: &LogLine) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(l.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_publishes_general_and_specific_once() {
        let bus = EventBus::unbounded();
        let general = watch(&bus, "TICK");
        let specific = watch(&bus, "TICK:X.EX");
        let other = watch(&bus, "TICK:Y.EX");
        let n = EventNormalizer::new("GW", bus.clone());
        bus.start().unwrap();
        n.on_tick(tick("X.EX", Some(100.0)));
        bus.shutdown().await;
        assert_eq!(general.lock().unwrap().len(), 1);
        assert_eq!(specific.lock().unwrap().len(), 1);
        assert!(other.lock().unwrap().is_empty());
        assert_eq!(general.lock().unwrap()[0].payload, specific.lock().unwrap()[0].payload);
    }

    #[tokio::test]
    async fn last_price_scenario() {
        let bus = EventBus::unbounded();
        let n = EventNormalizer::new("GW", bus.clone());
        n.on_tick(tick("X.EX", Some(100.0)));
        assert_eq!(bus.last_prices().get("X.EX"), Some(100.0));

        let mut t = tick("X.EX", Some(0.0));
        t.bid_price[0] = Some(98.0);
        t.ask_price[0] = Some(102.0);
        n.on_tick(t);
        assert_eq!(bus.last_prices().get("X.EX"), Some(100.0));

        let mut fresh = tick("Z.EX", None);
        fresh.bid_price[0] = Some(10.0);
        fresh.ask_price[0] = Some(12.0);
        n.on_tick(fresh);
        assert_eq!(bus.last_prices().get("Z.EX"), Some(11.0));
    }

    #[tokio::test]
    async fn pairs_for_trade_order_position_account() {
        let bus = EventBus::unbounded();
        let topics = [
            "TRADE", "TRADE:X.EX", "ORDER", "ORDER:GW.7", "POSITION", "POSITION:X.EX", "ACCOUNT", "ACCOUNT:GW.ACC1",
        ];
        let seen: Vec<Seen> = topics.iter().map(|t| watch(&bus, t)).collect();
        let n = EventNormalizer::new("GW", bus.clone());
        bus.start().unwrap();

        n.on_trade(Trade {
            symbol: "X".into(),
            exchange: "EX".into(),
            vt_symbol: "X.EX".into(),
            trade_id: "T1".into(),
            vt_trade_id: "GW.T1".into(),
            order_id: "7".into(),
            vt_order_id: "GW.7".into(),
            direction: Direction::Long,
            offset: Offset::Open,
            price: 10.0,
            volume: 1.0,
            trade_time: Utc::now(),
            gateway_name: "GW".into(),
        });
        n.on_order(order(OrderStatus::Submitted));
        n.on_position(Position {
            symbol: "X".into(),
            exchange: "EX".into(),
            vt_symbol: "X.EX".into(),
            direction: Some(Direction::Long),
            position: 1.0,
            yd_position: 0.0,
            frozen: 0.0,
            price: 10.0,
            position_profit: 0.0,
            gateway_name: "GW".into(),
        });
        n.on_account(account());
        bus.shutdown().await;

        for (t, s) in topics.iter().zip(&seen) {
            assert_eq!(s.lock().unwrap().len(), 1, "topic {t}");
        }
        assert_eq!(n.account_id(), "ACC1");
    }

    #[tokio::test]
    async fn contract_is_general_only_and_last_write_wins() {
        let bus = EventBus::unbounded();
        let seen = watch(&bus, "CONTRACT");
        let specific = watch(&bus, "CONTRACT:X.EX");
        let n = EventNormalizer::new("GW", bus.clone());
        bus.start().unwrap();
        let mut c = Contract {
            symbol: "X".into(),
            exchange: "EX".into(),
            vt_symbol: "X.EX".into(),
            name: "X".into(),
            product_class: ProductClass::Futures,
            size: 10.0,
            price_tick: 0.5,
            strike_price: None,
            underlying_symbol: None,
            option_type: None,
            gateway_name: "GW".into(),
        };
        n.on_contract(c.clone());
        c.size = 20.0;
        n.on_contract(c);
        bus.shutdown().await;
        let got = seen.lock().unwrap();
        assert_eq!(got.len(), 2);
        match &got[1].payload {
            Payload::Contract(c) => assert_eq!(c.size, 20.0),
            p => panic!("unexpected payload {p:?}"),
        }
        assert!(specific.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bar_aggregator_receives_ticks_and_emits_bars() {
        let bus = EventBus::unbounded();
        let bars = watch(&bus, "BAR");
        let logs = watch(&bus, "LOG");
        let n = EventNormalizer::new("GW", bus.clone());
        n.register_bar_aggregator("X.EX", Box::new(BarGenerator::new(60)));
        bus.start().unwrap();
        for (secs, px) in [(0, 1.0), (30, 3.0), (61, 2.0)] {
            let mut t = tick("X.EX", Some(px));
            t.datetime = Utc.timestamp_opt(secs, 0).unwrap();
            n.on_tick(t);
        }
        n.flush_bars();
        bus.shutdown().await;

        let bars = bars.lock().unwrap();
        assert_eq!(bars.len(), 2);
        match &bars[0].payload {
            Payload::Bar(b) => assert_eq!((b.open, b.high, b.low, b.close), (1.0, 3.0, 1.0, 3.0)),
            p => panic!("unexpected payload {p:?}"),
        }
        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 2);
        match &logs[0].payload {
            Payload::Log(l) => assert!(l.log_content.starts_with("Onbar Event:X.EX")),
            p => panic!("unexpected payload {p:?}"),
        }
    }

    #[tokio::test]
    async fn custom_bar_topic() {
        let bus = EventBus::unbounded();
        let custom = watch(&bus, "BAR:X.EX.1m");
        let n = EventNormalizer::new("GW", bus.clone());
        bus.start().unwrap();
        let bar = Bar {
            vt_symbol: "X.EX".into(),
            datetime: Utc::now(),
            interval_secs: 60,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
            open_interest: 0.0,
            gateway_name: "GW".into(),
        };
        n.on_bar(bar, Some("BAR:X.EX.1m"));
        bus.shutdown().await;
        assert_eq!(custom.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_does_not_block_log_event() {
        let bus = EventBus::unbounded();
        let logs = watch(&bus, "LOG");
        let n = EventNormalizer::new("GW", bus.clone()).with_log_sink(Arc::new(FailingSink));
        bus.start().unwrap();
        n.write_log("hello");
        bus.shutdown().await;
        assert_eq!(logs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn write_error_routes_through_error_topic_and_sink() {
        let bus = EventBus::unbounded();
        let errors = watch(&bus, "ERROR");
        let sink = Arc::new(MemorySink(Mutex::new(Vec::new())));
        let n = EventNormalizer::new("CTP", bus.clone()).with_log_sink(sink.clone());
        bus.start().unwrap();
        n.write_error("login failed", 42);
        n.report_fault(&GatewayFault::Timeout { op: "connect", ms: 500 });
        bus.shutdown().await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        match &errors[0].payload {
            Payload::Error(e) => {
                assert_eq!(e.gateway_name, "CTP");
                assert_eq!(e.error_id, 42);
                assert_eq!(e.error_msg, "login failed");
            }
            p => panic!("unexpected payload {p:?}"),
        }
        match &errors[1].payload {
            Payload::Error(e) => assert_eq!(e.error_id, 1002),
            p => panic!("unexpected payload {p:?}"),
        }
        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].code, Some(42));
    }

    #[tokio::test]
    async fn concurrent_gateways_share_the_cache() {
        let bus = EventBus::unbounded();
        let mut joins = Vec::new();
        for g in 0..4 {
            let b = bus.clone();
            joins.push(std::thread::spawn(move || {
                let n = EventNormalizer::new(format!("GW{g}"), b);
                for i in 1..=25 {
                    n.on_tick(tick(&format!("S{g}.EX"), Some(i as f64)));
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(bus.last_prices().len(), 4);
        for g in 0..4 {
            assert_eq!(bus.last_prices().get(&format!("S{g}.EX")), Some(25.0));
        }
        assert_eq!(bus.stats().published, 200);
    }
}
