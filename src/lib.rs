// ===============================
// src/lib.rs
// ===============================
//
// gateway → normalizer → bus → {tables, caches, handlers}
//
pub mod domain;
pub mod event;
pub mod error;
pub mod metrics;
pub mod price_cache;
pub mod bus;
pub mod bar;
pub mod recorder;
pub mod normalizer;
pub mod table;
pub mod monitors;
pub mod gateway;
pub mod config;

pub use bus::{BusConfig, BusStats, EventBus, SubscriptionHandle};
pub use event::{Category, Event};
pub use normalizer::EventNormalizer;
pub use price_cache::LastPriceCache;
pub use table::{KeySpec, KeyedTableSync, SyncOutcome, TableRecord, TableSpec};
