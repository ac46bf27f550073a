// ===============================
// src/bar.rs
// ===============================
//
// Tick -> bar aggregation.
// A bar is closed by the first tick of the next window (no timer), so a
// quiet instrument keeps its last bar open until `flush`.
//
use chrono::{DateTime, TimeZone, Utc};

use crate::domain::{Bar, Tick};
use crate::price_cache::reference_price;

/// Anything the normalizer can forward ticks to.
pub trait BarAggregator: Send {
    /// Feed one tick. Returns the bar this tick completed, if any.
    fn update_tick(&mut self, tick: &Tick) -> Option<Bar>;
    /// Hand out the bar under construction (e.g. on disconnect).
    fn flush(&mut self) -> Option<Bar>;
}

pub struct BarGenerator {
    interval_secs: u64,
    current: Option<Bar>,
    last_volume: Option<f64>,
}

impl BarGenerator {
    pub fn new(interval_secs: u64) -> Self {
        Self { interval_secs: interval_secs.max(1), current: None, last_volume: None }
    }

    pub fn interval_secs(&self) -> u64 { self.interval_secs }

    fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let step = self.interval_secs as i64;
        let start = secs - secs.rem_euclid(step);
        Utc.timestamp_opt(start, 0).single().unwrap_or(ts)
    }

    fn volume_delta(&mut self, tick: &Tick) -> f64 {
        // tick.volume = akumulasi sesi
        let delta = match self.last_volume {
            Some(prev) if tick.volume >= prev => tick.volume - prev,
            _ => 0.0,
        };
        self.last_volume = Some(tick.volume);
        delta
    }
}

impl BarAggregator for BarGenerator {
    fn update_tick(&mut self, tick: &Tick) -> Option<Bar> {
        let px = reference_price(tick)?;
        let start = self.window_start(tick.datetime);

        if let Some(bar) = &self.current {
            if start < bar.datetime {
                // stale tick from an already closed window
                return None;
            }
        }
        let vol = self.volume_delta(tick);

        let mut finished = None;
        if self.current.as_ref().map(|b| b.datetime != start).unwrap_or(false) {
            finished = self.current.take();
        }

        match &mut self.current {
            Some(bar) => {
                bar.high = bar.high.max(px);
                bar.low = bar.low.min(px);
                bar.close = px;
                bar.volume += vol;
                bar.open_interest = tick.open_interest;
            }
            None => {
                self.current = Some(Bar {
                    vt_symbol: tick.vt_symbol.clone(),
                    datetime: start,
                    interval_secs: self.interval_secs,
                    open: px,
                    high: px,
                    low: px,
                    close: px,
                    volume: vol,
                    open_interest: tick.open_interest,
                    gateway_name: tick.gateway_name.clone(),
                });
            }
        }
        finished
    }

    fn flush(&mut self) -> Option<Bar> {
        self.current.take()
    }
}
