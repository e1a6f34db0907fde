//! Cheap "worth polling" score from the streamed window

use dashmap::DashMap;

use super::window::TickWindow;

/// Below this many streamed ticks a market is not scored
pub const MIN_CANDIDATE_TICKS: usize = 10;
/// Spread percent under which a tick counts as low-spread
const LOW_SPREAD_PERCENT: f64 = 0.01;
/// Window size at which the data-coverage term saturates
const FULL_WINDOW_POINTS: f64 = 180.0;

/// Score a streamed window in [0, 100]
pub fn candidate_score(window: &TickWindow) -> u32 {
    let n = window.len();
    if n < MIN_CANDIDATE_TICKS {
        return 0;
    }

    let spreads: Vec<f64> = window.iter().map(|t| t.spread_percent).collect();
    let count = n as f64;

    let low = spreads.iter().filter(|&&s| s < LOW_SPREAD_PERCENT).count() as f64;
    let low_freq = low / count * 100.0;

    let avg = spreads.iter().sum::<f64>() / count;
    let variance = spreads.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / count;
    let std_dev = variance.sqrt();

    let stability = (100.0 - std_dev * 1000.0).max(0.0);
    let data_score = (count / FULL_WINDOW_POINTS).min(1.0) * 100.0;

    let score = (low_freq * 0.4 + stability * 0.4 + data_score * 0.2).round();
    score.clamp(0.0, 100.0) as u32
}

/// Latest candidate score per symbol. Written only by the streamed ingestion path.
#[derive(Debug, Default)]
pub struct CandidateBoard {
    scores: DashMap<String, u32>,
}

impl CandidateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, window: &TickWindow) -> u32 {
        let score = candidate_score(window);
        self.scores.insert(symbol.to_string(), score);
        score
    }

    pub fn get(&self, symbol: &str) -> u32 {
        self.scores.get(symbol).map(|s| *s).unwrap_or(0)
    }

    /// Symbols scoring at or above `threshold`
    pub fn at_or_above(&self, threshold: u32) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .scores
            .iter()
            .filter(|e| *e.value() >= threshold)
            .map(|e| e.key().clone())
            .collect();
        symbols.sort();
        symbols
    }
}
