// ===============================
// src/domain.rs
// ===============================
//
// Normalized records shared by every gateway and consumer.
// Gateways fill these completely before handing them to the normalizer;
// consumers receive them by reference through the bus.
//
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order book depth carried by a tick.
pub const DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction { Long, Short, Net }

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self { Direction::Long => "LONG", Direction::Short => "SHORT", Direction::Net => "NET" }
    }
    pub fn sign(&self) -> f64 {
        match self { Direction::Long | Direction::Net => 1.0, Direction::Short => -1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Offset { None, Open, Close, CloseToday, CloseYesterday }

impl Offset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Offset::None => "",
            Offset::Open => "OPEN",
            Offset::Close => "CLOSE",
            Offset::CloseToday => "CLOSE_TODAY",
            Offset::CloseYesterday => "CLOSE_YESTERDAY",
        }
    }
}

/// `Submitted → {PartiallyFilled}* → {Filled | Cancelled | Rejected}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus { Submitted, PartiallyFilled, Filled, Cancelled, Rejected }

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductClass { Spot, Futures, Option, Index, Equity }

impl ProductClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductClass::Spot => "SPOT",
            ProductClass::Futures => "FUTURES",
            ProductClass::Option => "OPTION",
            ProductClass::Index => "INDEX",
            ProductClass::Equity => "EQUITY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType { Call, Put }

/// Qualified key: `<symbol>.<exchange>`
pub fn vt_symbol(symbol: &str, exchange: &str) -> String {
    format!("{symbol}.{exchange}")
}

/// Inverse of `vt_symbol`. Splits on the last '.', so symbols may contain dots.
pub fn split_vt_symbol(vt: &str) -> Option<(&str, &str)> {
    match vt.rsplit_once('.') {
        Some((sym, ex)) if !sym.is_empty() && !ex.is_empty() => Some((sym, ex)),
        _ => None,
    }
}

/// Gateway-qualified id: `<gateway>.<local id>`
pub fn vt_id(gateway_name: &str, local_id: &str) -> String {
    format!("{gateway_name}.{local_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub exchange: String,
    pub vt_symbol: String,
    /// `None` when the venue did not send a trade price at all.
    pub last_price: Option<f64>,
    pub pre_close_price: f64,
    pub volume: f64,
    pub open_interest: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub bid_price: [Option<f64>; DEPTH],
    pub bid_volume: [f64; DEPTH],
    pub ask_price: [Option<f64>; DEPTH],
    pub ask_volume: [f64; DEPTH],
    pub datetime: DateTime<Utc>,
    pub gateway_name: String,
}

impl Tick {
    pub fn best_bid(&self) -> Option<f64> { self.bid_price[0] }
    pub fn best_ask(&self) -> Option<f64> { self.ask_price[0] }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub vt_symbol: String,
    pub datetime: DateTime<Utc>,
    pub interval_secs: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub open_interest: f64,
    pub gateway_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub exchange: String,
    pub vt_symbol: String,
    pub order_id: String,
    pub vt_order_id: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: f64,
    pub total_volume: f64,
    pub traded_volume: f64,
    pub status: OrderStatus,
    pub order_time: DateTime<Utc>,
    pub cancel_time: Option<DateTime<Utc>>,
    pub gateway_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub exchange: String,
    pub vt_symbol: String,
    pub trade_id: String,
    pub vt_trade_id: String,
    pub order_id: String,
    pub vt_order_id: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: f64,
    pub volume: f64,
    pub trade_time: DateTime<Utc>,
    pub gateway_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: String,
    pub vt_symbol: String,
    /// Some brokers push partial rows without a side; such rows cannot be keyed.
    pub direction: Option<Direction>,
    pub position: f64,
    pub yd_position: f64,
    pub frozen: f64,
    pub price: f64,
    pub position_profit: f64,
    pub gateway_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub vt_account_id: String,
    pub pre_balance: f64,
    pub balance: f64,
    pub available: f64,
    pub commission: f64,
    pub margin: f64,
    pub close_profit: f64,
    pub position_profit: f64,
    pub currency: String,
    pub gateway_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub exchange: String,
    pub vt_symbol: String,
    pub name: String,
    pub product_class: ProductClass,
    pub size: f64,
    pub price_tick: f64,
    pub strike_price: Option<f64>,
    pub underlying_symbol: Option<String>,
    pub option_type: Option<OptionType>,
    pub gateway_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_time: DateTime<Utc>,
    pub log_content: String,
    pub gateway_name: String,
}

impl LogRecord {
    pub fn new(gateway_name: &str, content: impl Into<String>) -> Self {
        Self { log_time: Utc::now(), log_content: content.into(), gateway_name: gateway_name.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_time: DateTime<Utc>,
    pub error_id: i64,
    pub error_msg: String,
    pub additional_info: String,
    pub gateway_name: String,
}

impl ErrorRecord {
    pub fn new(gateway_name: &str, error_id: i64, msg: impl Into<String>) -> Self {
        Self {
            error_time: Utc::now(),
            error_id,
            error_msg: msg.into(),
            additional_info: String::new(),
            gateway_name: gateway_name.to_string(),
        }
    }
}

// ---- Requests (gateway inbound) ----
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest { pub symbol: String, pub exchange: String }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest { pub symbol: String, pub exchange: String, pub order_id: String }

/// Closed set of record kinds the bus can carry. The event's category
/// always agrees with the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Tick(Tick),
    Bar(Bar),
    Trade(Trade),
    Order(Order),
    Position(Position),
    Account(Account),
    Contract(Contract),
    Log(LogRecord),
    Error(ErrorRecord),
}

impl Payload {
    pub fn gateway_name(&self) -> &str {
        match self {
            Payload::Tick(x) => &x.gateway_name,
            Payload::Bar(x) => &x.gateway_name,
            Payload::Trade(x) => &x.gateway_name,
            Payload::Order(x) => &x.gateway_name,
            Payload::Position(x) => &x.gateway_name,
            Payload::Account(x) => &x.gateway_name,
            Payload::Contract(x) => &x.gateway_name,
            Payload::Log(x) => &x.gateway_name,
            Payload::Error(x) => &x.gateway_name,
        }
    }
}
