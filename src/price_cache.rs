// ===============================
// src/price_cache.rs
// ===============================
use ahash::AHashMap as HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::Tick;
use crate::metrics::LAST_PRICE;

/// Synchronous last-price lookup, shared by all gateways of one bus.
/// Cheap to clone; every clone sees the same map.
#[derive(Debug, Clone, Default)]
pub struct LastPriceCache {
    inner: Arc<RwLock<HashMap<String, f64>>>,
}

/// Price a tick contributes to the cache, if any:
/// - non-zero `last_price` wins
/// - missing `last_price` with both best quotes present -> midpoint
/// - `last_price == 0` leaves the cache alone (no midpoint fallback)
pub fn reference_price(tick: &Tick) -> Option<f64> {
    match tick.last_price {
        Some(px) if px != 0.0 => Some(px),
        Some(_) => None,
        None => match (tick.best_bid(), tick.best_ask()) {
            (Some(b), Some(a)) => Some((a + b) / 2.0),
            _ => None,
        },
    }
}

impl LastPriceCache {
    pub fn new() -> Self { Self::default() }

    /// Returns the stored price when the tick changed the cache.
    pub fn update(&self, tick: &Tick) -> Option<f64> {
        let px = reference_price(tick)?;
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(tick.vt_symbol.clone(), px);
        LAST_PRICE.with_label_values(&[&tick.vt_symbol]).set(px);
        Some(px)
    }

    pub fn get(&self, vt_symbol: &str) -> Option<f64> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).get(vt_symbol).copied()
    }

    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(String, f64)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn clear(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(last: Option<f64>, bid: Option<f64>, ask: Option<f64>) -> Tick {
        let mut t = Tick { vt_symbol: "X.EX".into(), last_price: last, ..Default::default() };
        t.bid_price[0] = bid;
        t.ask_price[0] = ask;
        t
    }

    #[test]
    fn nonzero_last_price_is_cached() {
        let c = LastPriceCache::new();
        assert_eq!(c.update(&tick(Some(100.0), None, None)), Some(100.0));
        assert_eq!(c.get("X.EX"), Some(100.0));
    }

    #[test]
    fn zero_last_price_keeps_prior_value() {
        let c = LastPriceCache::new();
        c.update(&tick(Some(100.0), None, None));
        assert_eq!(c.update(&tick(Some(0.0), Some(98.0), Some(102.0))), None);
        assert_eq!(c.get("X.EX"), Some(100.0));
    }

    #[test]
    fn zero_last_price_on_fresh_symbol_stays_absent() {
        let c = LastPriceCache::new();
        c.update(&tick(Some(0.0), Some(10.0), Some(12.0)));
        assert_eq!(c.get("X.EX"), None);
        assert!(c.is_empty());
    }

    #[test]
    fn missing_last_price_falls_back_to_mid() {
        let c = LastPriceCache::new();
        c.update(&tick(None, Some(10.0), Some(12.0)));
        assert_eq!(c.get("X.EX"), Some(11.0));
    }

    #[test]
    fn one_sided_quote_is_ignored() {
        let c = LastPriceCache::new();
        c.update(&tick(Some(5.0), None, None));
        c.update(&tick(None, Some(10.0), None));
        assert_eq!(c.get("X.EX"), Some(5.0));
    }

    #[test]
    fn clones_share_state() {
        let a = LastPriceCache::new();
        let b = a.clone();
        a.update(&tick(Some(1.5), None, None));
        assert_eq!(b.get("X.EX"), Some(1.5));
        assert_eq!(b.snapshot(), vec![("X.EX".to_string(), 1.5)]);
        b.clear();
        assert_eq!(a.len(), 0);
    }
}
