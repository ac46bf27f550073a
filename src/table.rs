// ===============================
// src/table.rs
// ===============================
//
// Incremental keyed table used by every consumer-side panel/cache.
//
// - no key spec   -> append-only (trade/log style streams)
// - key spec      -> composite key = stringified key fields joined by "_";
//                    new key inserts a row, known key updates that row's
//                    tracked cells in place (row position never changes)
// - missing key field -> update rejected, table untouched
// - hide_terminal -> rows whose record reached a terminal state are hidden,
//                    never deleted
//
// Field names are resolved to typed accessors once, in `new`.
//
use ahash::AHashMap as HashMap;

use crate::domain::{Account, Contract, ErrorRecord, LogRecord, Order, Payload, Position, Tick, Trade};
use crate::error::{ConfigError, TableError};
use crate::event::{Category, Event, TOPIC_SEPARATOR};
use crate::metrics::TABLE_REJECTS;

pub const KEY_SEPARATOR: &str = "_";

/// Reads one field of a record as display text. `None` = field absent.
pub type Accessor<R> = fn(&R) -> Option<String>;

/// Record kinds a table can mirror.
pub trait TableRecord: Clone + Send + 'static {
    const KIND: &'static str;
    /// Topic category whose events carry this record kind.
    const CATEGORY: Category;

    fn accessor(field: &str) -> Option<Accessor<Self>>;

    fn from_payload(payload: &Payload) -> Option<&Self>;

    /// Order-like records override this.
    fn is_terminal(&self) -> bool { false }

    /// `CATEGORY` itself or `CATEGORY:<key>`.
    fn accepts_topic(topic: &str) -> bool {
        let cat = Self::CATEGORY.as_str();
        match topic.strip_prefix(cat) {
            Some("") => true,
            Some(rest) => rest.starts_with(TOPIC_SEPARATOR) && rest.len() > 1,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    /// Append-only.
    None,
    Field(String),
    Fields(Vec<String>),
}

impl KeySpec {
    pub fn field(name: &str) -> Self { KeySpec::Field(name.to_string()) }

    pub fn fields(names: &[&str]) -> Self { KeySpec::Fields(names.iter().map(|s| s.to_string()).collect()) }

    fn names(&self) -> Result<Vec<&str>, ConfigError> {
        match self {
            KeySpec::None => Ok(Vec::new()),
            KeySpec::Field(f) if f.is_empty() => Err(ConfigError::EmptyKeySpec),
            KeySpec::Field(f) => Ok(vec![f.as_str()]),
            KeySpec::Fields(fs) if fs.is_empty() || fs.iter().any(|f| f.is_empty()) => Err(ConfigError::EmptyKeySpec),
            KeySpec::Fields(fs) => Ok(fs.iter().map(|s| s.as_str()).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub key: KeySpec,
    /// Tracked columns, in display order.
    pub fields: Vec<String>,
    pub hide_terminal: bool,
}

impl TableSpec {
    pub fn new(name: &str, key: KeySpec, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            key,
            fields: fields.iter().map(|s| s.to_string()).collect(),
            hide_terminal: false,
        }
    }

    pub fn hide_terminal(mut self) -> Self {
        self.hide_terminal = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row<R> {
    pub key: Option<String>,
    pub cells: Vec<String>,
    pub hidden: bool,
    /// Last record applied to this row.
    pub record: R,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Inserted(usize),
    Updated(usize),
    Appended(usize),
}

pub struct KeyedTableSync<R: TableRecord> {
    name: String,
    columns: Vec<String>,
    key_names: Vec<String>,
    key_getters: Vec<Accessor<R>>,
    getters: Vec<Accessor<R>>,
    hide_terminal: bool,
    rows: Vec<Row<R>>,
    index: HashMap<String, usize>,
}

impl<R: TableRecord> std::fmt::Debug for KeyedTableSync<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedTableSync")
            .field("name", &self.name)
            .field("kind", &R::KIND)
            .field("key", &self.key_names)
            .field("rows", &self.rows.len())
            .finish()
    }
}

fn resolve<R: TableRecord>(field: &str) -> Result<Accessor<R>, ConfigError> {
    R::accessor(field).ok_or_else(|| ConfigError::UnknownField { kind: R::KIND, field: field.to_string() })
}

impl<R: TableRecord> KeyedTableSync<R> {
    pub fn new(spec: TableSpec) -> Result<Self, ConfigError> {
        let key_names: Vec<String> = spec.key.names()?.into_iter().map(String::from).collect();
        let key_getters = key_names.iter().map(|f| resolve::<R>(f)).collect::<Result<Vec<_>, _>>()?;
        let getters = spec.fields.iter().map(|f| resolve::<R>(f)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: spec.name,
            columns: spec.fields,
            key_names,
            key_getters,
            getters,
            hide_terminal: spec.hide_terminal,
            rows: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn columns(&self) -> &[String] { &self.columns }

    fn key_of(&self, record: &R) -> Result<String, TableError> {
        let mut parts = Vec::with_capacity(self.key_getters.len());
        for (name, get) in self.key_names.iter().zip(&self.key_getters) {
            match get(record) {
                Some(v) => parts.push(v),
                None => {
                    TABLE_REJECTS.with_label_values(&[&self.name]).inc();
                    return Err(TableError::MissingField { kind: R::KIND, field: name.clone() });
                }
            }
        }
        Ok(parts.join(KEY_SEPARATOR))
    }

    fn cells_of(&self, record: &R) -> Vec<String> {
        self.getters.iter().map(|get| get(record).unwrap_or_default()).collect()
    }

    pub fn on_update(&mut self, record: &R) -> Result<SyncOutcome, TableError> {
        if self.key_getters.is_empty() {
            let hidden = self.hide_terminal && record.is_terminal();
            self.rows.push(Row { key: None, cells: self.cells_of(record), hidden, record: record.clone() });
            return Ok(SyncOutcome::Appended(self.rows.len() - 1));
        }

        let key = self.key_of(record)?;
        let cells = self.cells_of(record);
        let terminal = self.hide_terminal && record.is_terminal();

        if let Some(&pos) = self.index.get(&key) {
            let row = &mut self.rows[pos];
            row.cells = cells;
            row.record = record.clone();
            // sekali terminal, tetap tersembunyi
            row.hidden |= terminal;
            Ok(SyncOutcome::Updated(pos))
        } else {
            let pos = self.rows.len();
            self.rows.push(Row { key: Some(key.clone()), cells, hidden: terminal, record: record.clone() });
            self.index.insert(key, pos);
            Ok(SyncOutcome::Inserted(pos))
        }
    }

    /// Applies the record carried by a bus event.
    pub fn apply_event(&mut self, ev: &Event) -> Result<SyncOutcome, TableError> {
        let record = R::from_payload(&ev.payload)
            .ok_or_else(|| TableError::WrongPayload { kind: R::KIND, topic: ev.topic.clone() })?;
        self.on_update(record)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    /// All rows, hidden ones included, in insertion order.
    pub fn rows(&self) -> &[Row<R>] { &self.rows }

    pub fn visible_rows(&self) -> impl Iterator<Item = &Row<R>> {
        self.rows.iter().filter(|r| !r.hidden)
    }

    pub fn get(&self, key: &str) -> Option<&Row<R>> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    pub fn len(&self) -> usize { self.rows.len() }

    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    pub fn visible_len(&self) -> usize { self.visible_rows().count() }

    /// Cell text of `column` for the row under `key`.
    pub fn cell(&self, key: &str, column: &str) -> Option<&str> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.get(key).map(|r| r.cells[col].as_str())
    }
}

// ---- accessor tables ----

fn num(v: f64) -> String { v.to_string() }

macro_rules! text {
    ($t:ty, $($f:ident).+) => { |r: &$t| Some(r.$($f).+.to_string()) };
}
macro_rules! number {
    ($t:ty, $f:ident) => { |r: &$t| Some(num(r.$f)) };
}
macro_rules! maybe_number {
    ($t:ty, $f:ident) => { |r: &$t| r.$f.map(num) };
}
macro_rules! level {
    ($t:ty, $f:ident, $i:expr) => { |r: &$t| r.$f[$i].map(num) };
}
macro_rules! level_volume {
    ($t:ty, $f:ident, $i:expr) => { |r: &$t| Some(num(r.$f[$i])) };
}

impl TableRecord for Tick {
    const KIND: &'static str = "Tick";
    const CATEGORY: Category = Category::Tick;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "symbol" => text!(Tick, symbol),
            "exchange" => text!(Tick, exchange),
            "vt_symbol" => text!(Tick, vt_symbol),
            "last_price" => maybe_number!(Tick, last_price),
            "pre_close_price" => number!(Tick, pre_close_price),
            "volume" => number!(Tick, volume),
            "open_interest" => number!(Tick, open_interest),
            "open_price" => number!(Tick, open_price),
            "high_price" => number!(Tick, high_price),
            "low_price" => number!(Tick, low_price),
            "bid_price_1" => level!(Tick, bid_price, 0),
            "bid_price_2" => level!(Tick, bid_price, 1),
            "bid_price_3" => level!(Tick, bid_price, 2),
            "bid_price_4" => level!(Tick, bid_price, 3),
            "bid_price_5" => level!(Tick, bid_price, 4),
            "ask_price_1" => level!(Tick, ask_price, 0),
            "ask_price_2" => level!(Tick, ask_price, 1),
            "ask_price_3" => level!(Tick, ask_price, 2),
            "ask_price_4" => level!(Tick, ask_price, 3),
            "ask_price_5" => level!(Tick, ask_price, 4),
            "bid_volume_1" => level_volume!(Tick, bid_volume, 0),
            "bid_volume_2" => level_volume!(Tick, bid_volume, 1),
            "bid_volume_3" => level_volume!(Tick, bid_volume, 2),
            "bid_volume_4" => level_volume!(Tick, bid_volume, 3),
            "bid_volume_5" => level_volume!(Tick, bid_volume, 4),
            "ask_volume_1" => level_volume!(Tick, ask_volume, 0),
            "ask_volume_2" => level_volume!(Tick, ask_volume, 1),
            "ask_volume_3" => level_volume!(Tick, ask_volume, 2),
            "ask_volume_4" => level_volume!(Tick, ask_volume, 3),
            "ask_volume_5" => level_volume!(Tick, ask_volume, 4),
            "datetime" => |r: &Tick| Some(r.datetime.to_rfc3339()),
            "gateway_name" => text!(Tick, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Tick(t) => Some(t), _ => None }
    }
}

impl TableRecord for Order {
    const KIND: &'static str = "Order";
    const CATEGORY: Category = Category::Order;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "symbol" => text!(Order, symbol),
            "exchange" => text!(Order, exchange),
            "vt_symbol" => text!(Order, vt_symbol),
            "order_id" => text!(Order, order_id),
            "vt_order_id" => text!(Order, vt_order_id),
            "direction" => |r: &Order| Some(r.direction.as_str().to_string()),
            "offset" => |r: &Order| Some(r.offset.as_str().to_string()),
            "price" => number!(Order, price),
            "total_volume" => number!(Order, total_volume),
            "traded_volume" => number!(Order, traded_volume),
            "status" => |r: &Order| Some(r.status.as_str().to_string()),
            "order_time" => |r: &Order| Some(r.order_time.to_rfc3339()),
            "cancel_time" => |r: &Order| r.cancel_time.map(|t| t.to_rfc3339()),
            "gateway_name" => text!(Order, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Order(o) => Some(o), _ => None }
    }

    fn is_terminal(&self) -> bool { self.status.is_terminal() }
}

impl TableRecord for Trade {
    const KIND: &'static str = "Trade";
    const CATEGORY: Category = Category::Trade;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "symbol" => text!(Trade, symbol),
            "exchange" => text!(Trade, exchange),
            "vt_symbol" => text!(Trade, vt_symbol),
            "trade_id" => text!(Trade, trade_id),
            "vt_trade_id" => text!(Trade, vt_trade_id),
            "order_id" => text!(Trade, order_id),
            "vt_order_id" => text!(Trade, vt_order_id),
            "direction" => |r: &Trade| Some(r.direction.as_str().to_string()),
            "offset" => |r: &Trade| Some(r.offset.as_str().to_string()),
            "price" => number!(Trade, price),
            "volume" => number!(Trade, volume),
            "trade_time" => |r: &Trade| Some(r.trade_time.to_rfc3339()),
            "gateway_name" => text!(Trade, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Trade(t) => Some(t), _ => None }
    }
}

impl TableRecord for Position {
    const KIND: &'static str = "Position";
    const CATEGORY: Category = Category::Position;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "symbol" => text!(Position, symbol),
            "exchange" => text!(Position, exchange),
            "vt_symbol" => text!(Position, vt_symbol),
            "direction" => |r: &Position| r.direction.map(|d| d.as_str().to_string()),
            "position" => number!(Position, position),
            "yd_position" => number!(Position, yd_position),
            "frozen" => number!(Position, frozen),
            "price" => number!(Position, price),
            "position_profit" => number!(Position, position_profit),
            "gateway_name" => text!(Position, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Position(p) => Some(p), _ => None }
    }
}

impl TableRecord for Account {
    const KIND: &'static str = "Account";
    const CATEGORY: Category = Category::Account;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "account_id" => text!(Account, account_id),
            "vt_account_id" => text!(Account, vt_account_id),
            "pre_balance" => number!(Account, pre_balance),
            "balance" => number!(Account, balance),
            "available" => number!(Account, available),
            "commission" => number!(Account, commission),
            "margin" => number!(Account, margin),
            "close_profit" => number!(Account, close_profit),
            "position_profit" => number!(Account, position_profit),
            "currency" => text!(Account, currency),
            "gateway_name" => text!(Account, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Account(a) => Some(a), _ => None }
    }
}

impl TableRecord for Contract {
    const KIND: &'static str = "Contract";
    const CATEGORY: Category = Category::Contract;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "symbol" => text!(Contract, symbol),
            "exchange" => text!(Contract, exchange),
            "vt_symbol" => text!(Contract, vt_symbol),
            "name" => text!(Contract, name),
            "product_class" => |r: &Contract| Some(r.product_class.as_str().to_string()),
            "size" => number!(Contract, size),
            "price_tick" => number!(Contract, price_tick),
            "strike_price" => maybe_number!(Contract, strike_price),
            "underlying_symbol" => |r: &Contract| r.underlying_symbol.clone(),
            "option_type" => |r: &Contract| r.option_type.map(|t| format!("{t:?}").to_uppercase()),
            "gateway_name" => text!(Contract, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Contract(c) => Some(c), _ => None }
    }
}

impl TableRecord for LogRecord {
    const KIND: &'static str = "Log";
    const CATEGORY: Category = Category::Log;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "log_time" => |r: &LogRecord| Some(r.log_time.to_rfc3339()),
            "log_content" => text!(LogRecord, log_content),
            "gateway_name" => text!(LogRecord, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Log(l) => Some(l), _ => None }
    }
}

impl TableRecord for ErrorRecord {
    const KIND: &'static str = "Error";
    const CATEGORY: Category = Category::Error;

    fn accessor(field: &str) -> Option<Accessor<Self>> {
        let get: Accessor<Self> = match field {
            "error_time" => |r: &ErrorRecord| Some(r.error_time.to_rfc3339()),
            "error_id" => text!(ErrorRecord, error_id),
            "error_msg" => text!(ErrorRecord, error_msg),
            "additional_info" => text!(ErrorRecord, additional_info),
            "gateway_name" => text!(ErrorRecord, gateway_name),
            _ => return None,
        };
        Some(get)
    }

    fn from_payload(payload: &Payload) -> Option<&Self> {
        match payload { Payload::Error(e) => Some(e), _ => None }
    }
}
