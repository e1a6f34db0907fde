use std::sync::Arc;
use tracing::{debug, info};

use super::candidate::CandidateBoard;
use super::window::{IngestOutcome, WindowStore};
use crate::config::AppConfig;
use crate::domain::TickSource;
use crate::services::metrics::TrafficStats;

/// Entry point for every quote: window store, candidate board and counters
pub struct TickPipeline {
    store: WindowStore,
    board: CandidateBoard,
    traffic: Arc<TrafficStats>,
}

impl TickPipeline {
    pub fn new(config: &AppConfig, traffic: Arc<TrafficStats>) -> Self {
        Self {
            store: WindowStore::new(config.window.clone(), config.stream.throttle_ms),
            board: CandidateBoard::new(),
            traffic,
        }
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    pub fn board(&self) -> &CandidateBoard {
        &self.board
    }

    pub fn traffic(&self) -> &Arc<TrafficStats> {
        &self.traffic
    }

    /// Streamed quote; an accepted tick rescores the symbol
    pub fn on_streamed(&self, symbol: &str, bid: f64, ask: f64, timestamp: i64) -> IngestOutcome {
        let outcome = self.store.ingest_streamed(symbol, bid, ask, timestamp);
        match outcome {
            IngestOutcome::Accepted => {
                self.store
                    .with_window(symbol, TickSource::Streamed, |w| self.board.update(symbol, w));
            }
            IngestOutcome::Rejected => {
                debug!("Ignoring streamed tick for {}: bid={} ask={}", symbol, bid, ask);
                self.traffic.inc_ignored_ticks();
            }
            IngestOutcome::Throttled => {}
        }
        outcome
    }

    /// Polled quote
    pub fn on_polled(&self, symbol: &str, bid: f64, ask: f64, timestamp: i64) -> IngestOutcome {
        let outcome = self.store.ingest_polled(symbol, bid, ask, timestamp);
        match outcome {
            IngestOutcome::Accepted => {
                let spread_percent = self
                    .store
                    .with_window(symbol, TickSource::Polled, |w| w.last().map(|t| t.spread_percent))
                    .flatten();
                if let Some(sp) = spread_percent.filter(|sp| *sp <= 0.0) {
                    info!(
                        "Captured {} spread on {}: {:.4}% (bid={} ask={})",
                        if sp < 0.0 { "negative" } else { "zero" },
                        symbol,
                        sp,
                        bid,
                        ask
                    );
                }
            }
            IngestOutcome::Rejected => {
                debug!("Ignoring polled tick for {}: bid={} ask={}", symbol, bid, ask);
                self.traffic.inc_ignored_ticks();
            }
            IngestOutcome::Throttled => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn pipeline() -> TickPipeline {
        TickPipeline::new(&AppConfig::default(), Arc::new(TrafficStats::new()))
    }

    #[test]
    fn test_accepted_streamed_ticks_rescore() {
        let p = pipeline();
        for i in 0..9 {
            p.on_streamed("X", 100.0, 100.0, i * 1_000);
        }
        assert_eq!(p.board().get("X"), 0);
        p.on_streamed("X", 100.0, 100.0, 9_000);
        assert!(p.board().get("X") > 30);
    }

    #[test]
    fn test_throttled_ticks_do_not_rescore_or_count() {
        let p = pipeline();
        for i in 0..10 {
            p.on_streamed("X", 100.0, 100.0, i * 1_000);
        }
        let before = p.board().get("X");
        assert_eq!(p.on_streamed("X", 100.0, 200.0, 9_500), IngestOutcome::Throttled);
        assert_eq!(p.board().get("X"), before);
        assert_eq!(p.traffic().ignored_ticks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_invalid_ticks_are_counted() {
        let p = pipeline();
        p.on_streamed("X", 0.0, 1.0, 0);
        p.on_polled("X", 1.0, f64::INFINITY, 0);
        assert_eq!(p.traffic().ignored_ticks.load(Ordering::Relaxed), 2);
        assert!(p.store().is_empty());
    }

    #[test]
    fn test_polled_ticks_do_not_touch_candidate_score() {
        let p = pipeline();
        for i in 0..20 {
            p.on_polled("X", 100.0, 100.0, i);
        }
        assert_eq!(p.board().get("X"), 0);
        assert_eq!(p.store().window_for("X", TickSource::Polled).len(), 20);
    }
}
