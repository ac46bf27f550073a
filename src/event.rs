// ===============================
// src/event.rs
// ===============================
//
// Topic naming:
// - bare category   : "TICK", "ORDER", ...
// - category + key  : "TICK:BTCUSDT.MOCK", "ORDER:CTP.42", ...
// Keys are joined as-is (no escaping).
//
use serde::Serialize;

use crate::domain::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category { Tick, Bar, Trade, Order, Position, Account, Contract, Log, Error }

pub const TOPIC_SEPARATOR: char = ':';

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Tick,
        Category::Bar,
        Category::Trade,
        Category::Order,
        Category::Position,
        Category::Account,
        Category::Contract,
        Category::Log,
        Category::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tick => "TICK",
            Category::Bar => "BAR",
            Category::Trade => "TRADE",
            Category::Order => "ORDER",
            Category::Position => "POSITION",
            Category::Account => "ACCOUNT",
            Category::Contract => "CONTRACT",
            Category::Log => "LOG",
            Category::Error => "ERROR",
        }
    }

    /// Instance topic, e.g. `TICK:BTCUSDT.MOCK`.
    pub fn topic(&self, key: &str) -> String {
        let mut t = String::with_capacity(self.as_str().len() + 1 + key.len());
        t.push_str(self.as_str());
        t.push(TOPIC_SEPARATOR);
        t.push_str(key);
        t
    }

    pub fn of(payload: &Payload) -> Category {
        match payload {
            Payload::Tick(_) => Category::Tick,
            Payload::Bar(_) => Category::Bar,
            Payload::Trade(_) => Category::Trade,
            Payload::Order(_) => Category::Order,
            Payload::Position(_) => Category::Position,
            Payload::Account(_) => Category::Account,
            Payload::Contract(_) => Category::Contract,
            Payload::Log(_) => Category::Log,
            Payload::Error(_) => Category::Error,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope delivered to subscribers. Handlers only ever see `&Event`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: Payload,
}

impl Event {
    /// Event on the bare category topic of the payload.
    pub fn general(payload: Payload) -> Self {
        Self { topic: Category::of(&payload).as_str().to_string(), payload }
    }

    /// Event on the `category:key` topic of the payload.
    pub fn specific(payload: Payload, key: &str) -> Self {
        Self { topic: Category::of(&payload).topic(key), payload }
    }

    pub fn with_topic(topic: impl Into<String>, payload: Payload) -> Self {
        Self { topic: topic.into(), payload }
    }

    pub fn category(&self) -> Category {
        Category::of(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LogRecord;

    #[test]
    fn topics_are_plain_joins() {
        assert_eq!(Category::Tick.topic("X.EX"), "TICK:X.EX");
        assert_eq!(Category::Order.topic("CTP.7"), "ORDER:CTP.7");
        assert_eq!(Category::Account.to_string(), "ACCOUNT");
    }

    #[test]
    fn category_names_are_distinct() {
        let mut names: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Category::ALL.len());
    }

    #[test]
    fn general_and_specific_envelopes() {
        let p = Payload::Log(LogRecord::new("GW", "hello"));
        let g = Event::general(p.clone());
        let s = Event::specific(p, "GW");
        assert_eq!(g.topic, "LOG");
        assert_eq!(s.topic, "LOG:GW");
        assert_eq!(g.category(), Category::Log);
        assert_eq!(g.payload, s.payload);
    }
}
