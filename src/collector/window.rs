//! Per-market, per-source bounded tick windows
//!
//! Each market owns a streamed and a polled window. A window never keeps a
//! tick older than the configured age relative to the newest appended tick
//! and never grows past the configured point cap. The streamed path is
//! throttled per symbol; the polled path is paced by the scheduler instead.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::WindowConfig;
use crate::domain::{Tick, TickSource};
use crate::persistence::{MarketSnapshot, SnapshotDocument};

/// Time-ordered bounded sequence of ticks
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct TickWindow {
    ticks: VecDeque<Tick>,
}

impl TickWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and trim: drop everything older than `max_age_ms` before the
    /// new tick, then enforce the point cap from the front.
    pub fn push(&mut self, tick: Tick, max_age_ms: i64, max_points: usize) {
        let cutoff = tick.timestamp - max_age_ms;
        self.ticks.push_back(tick);
        self.evict_before(cutoff);
        while self.ticks.len() > max_points {
            self.ticks.pop_front();
        }
    }

    /// Remove ticks with `timestamp < cutoff` from the front
    pub fn evict_before(&mut self, cutoff: i64) -> usize {
        let mut removed = 0;
        while self.ticks.front().is_some_and(|t| t.timestamp < cutoff) {
            self.ticks.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tick> {
        self.ticks.iter()
    }

    pub fn last(&self) -> Option<&Tick> {
        self.ticks.back()
    }

    pub fn to_vec(&self) -> Vec<Tick> {
        self.ticks.iter().cloned().collect()
    }

    fn from_restored(symbol: &str, source: TickSource, ticks: Vec<Tick>, max_points: usize) -> Self {
        let skip = ticks.len().saturating_sub(max_points);
        let ticks = ticks
            .into_iter()
            .skip(skip)
            .filter(|t| t.bid > 0.0 && t.ask > 0.0 && t.bid.is_finite() && t.ask.is_finite())
            .map(|mut t| {
                if t.symbol.is_empty() {
                    t.symbol = symbol.to_string();
                }
                t.source = source;
                t
            })
            .collect();
        Self { ticks }
    }
}

/// Both windows of one market plus the streamed throttle state
#[derive(Debug, Clone, Default)]
pub struct MarketWindows {
    pub streamed: TickWindow,
    pub polled: TickWindow,
    last_streamed_accept: Option<i64>,
}

impl MarketWindows {
    pub fn get(&self, source: TickSource) -> &TickWindow {
        match source {
            TickSource::Streamed => &self.streamed,
            TickSource::Polled => &self.polled,
        }
    }
}

/// Result of offering a tick to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Arrived inside the per-symbol throttle gap; dropped
    Throttled,
    /// Non-finite or non-positive price; dropped
    Rejected,
}

/// Concurrent map of market windows. Every symbol's entry is only touched
/// under its own shard lock, so writers for different symbols never contend.
#[derive(Debug)]
pub struct WindowStore {
    windows: DashMap<String, MarketWindows>,
    config: WindowConfig,
    throttle_ms: i64,
}

impl WindowStore {
    pub fn new(config: WindowConfig, throttle_ms: u64) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            throttle_ms: throttle_ms as i64,
        }
    }

    /// Offer a streamed tick. At most one tick per symbol is accepted per throttle gap.
    pub fn ingest_streamed(&self, symbol: &str, bid: f64, ask: f64, timestamp: i64) -> IngestOutcome {
        let Ok(tick) = Tick::new(symbol, bid, ask, timestamp, TickSource::Streamed) else {
            return IngestOutcome::Rejected;
        };

        let mut entry = self.windows.entry(symbol.to_string()).or_default();
        if let Some(last) = entry.last_streamed_accept {
            if timestamp - last < self.throttle_ms {
                return IngestOutcome::Throttled;
            }
        }
        entry.last_streamed_accept = Some(timestamp);
        entry
            .streamed
            .push(tick, self.config.max_age_ms(), self.config.max_points);
        IngestOutcome::Accepted
    }

    /// Offer a polled tick. No throttling.
    pub fn ingest_polled(&self, symbol: &str, bid: f64, ask: f64, timestamp: i64) -> IngestOutcome {
        let Ok(tick) = Tick::new(symbol, bid, ask, timestamp, TickSource::Polled) else {
            return IngestOutcome::Rejected;
        };

        self.windows
            .entry(symbol.to_string())
            .or_default()
            .polled
            .push(tick, self.config.max_age_ms(), self.config.max_points);
        IngestOutcome::Accepted
    }

    /// Read-only copy of one window
    pub fn window_for(&self, symbol: &str, source: TickSource) -> Vec<Tick> {
        self.windows
            .get(symbol)
            .map(|w| w.get(source).to_vec())
            .unwrap_or_default()
    }

    /// Run `f` against a window without copying it
    pub fn with_window<R>(&self, symbol: &str, source: TickSource, f: impl FnOnce(&TickWindow) -> R) -> Option<R> {
        self.windows.get(symbol).map(|w| f(w.get(source)))
    }

    /// Both windows of a market, if any tick was ever recorded
    pub fn market(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.windows.get(symbol).map(|w| MarketSnapshot {
            streamed: w.streamed.to_vec(),
            polled: w.polled.to_vec(),
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.windows.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of markets with a window entry
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Periodic eviction relative to wall time. Returns removed tick count.
    pub fn evict_stale(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.config.max_age_ms();
        self.windows
            .iter_mut()
            .map(|mut e| {
                let w = e.value_mut();
                w.streamed.evict_before(cutoff) + w.polled.evict_before(cutoff)
            })
            .sum()
    }

    pub fn serialize(&self) -> SnapshotDocument {
        let mut document = SnapshotDocument::default();
        for entry in self.windows.iter() {
            document.markets.insert(
                entry.key().clone(),
                MarketSnapshot {
                    streamed: entry.streamed.to_vec(),
                    polled: entry.polled.to_vec(),
                },
            );
        }
        document
    }

    /// Replace the store's contents with a snapshot
    pub fn restore(&self, document: SnapshotDocument) {
        self.windows.clear();
        for (symbol, snapshot) in document.markets {
            let windows = MarketWindows {
                streamed: TickWindow::from_restored(
                    &symbol,
                    TickSource::Streamed,
                    snapshot.streamed,
                    self.config.max_points,
                ),
                polled: TickWindow::from_restored(
                    &symbol,
                    TickSource::Polled,
                    snapshot.polled,
                    self.config.max_points,
                ),
                last_streamed_accept: None,
            };
            self.windows.insert(symbol, windows);
        }
    }
}
