//! Stability metrics over a tick window
//!
//! Spread-percent buckets (percent units):
//!
//! | bucket    | condition            |
//! |-----------|----------------------|
//! | zero      | `<= 0`               |
//! | negative  | `< 0`                |
//! | low       | `< 0.001`            |
//! | medium    | `0.001 ..= 0.01`     |
//! | high      | `> 0.01`             |
//! | very high | `> 0.05`             |
//!
//! Buckets overlap on purpose: a negative tick is also zero and low.

use serde::{Serialize, Serializer};

use crate::domain::{Tick, TickSource};
use crate::error::{Result, SpreadwatchError};

/// Minimum window size for a report
pub const MIN_METRIC_TICKS: usize = 3;

const LOW_SPREAD: f64 = 0.001;
const MEDIUM_SPREAD_MAX: f64 = 0.01;
const VERY_HIGH_SPREAD: f64 = 0.05;

fn fixed1<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:.1}", value))
}

fn fixed3<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:.3}", value))
}

/// Every term of the composite score, reported individually
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    #[serde(serialize_with = "fixed1")]
    pub stability_bonus: f64,
    #[serde(serialize_with = "fixed1")]
    pub low_spread_bonus: f64,
    #[serde(serialize_with = "fixed1")]
    pub zero_spread_bonus: f64,
    #[serde(serialize_with = "fixed1")]
    pub negative_spread_bonus: f64,
    #[serde(serialize_with = "fixed1")]
    pub consistency_bonus: f64,
    #[serde(serialize_with = "fixed1")]
    pub high_spread_penalty: f64,
    #[serde(serialize_with = "fixed1")]
    pub very_high_spread_penalty: f64,
    #[serde(serialize_with = "fixed1")]
    pub volatility_penalty: f64,
    #[serde(serialize_with = "fixed1")]
    pub avg_spread_penalty: f64,
    #[serde(serialize_with = "fixed3")]
    pub stability_factor: f64,
}

impl ScoreBreakdown {
    pub fn bonuses(&self) -> f64 {
        self.stability_bonus
            + self.low_spread_bonus
            + self.zero_spread_bonus
            + self.negative_spread_bonus
            + self.consistency_bonus
    }

    pub fn penalties(&self) -> f64 {
        self.high_spread_penalty
            + self.very_high_spread_penalty
            + self.volatility_penalty
            + self.avg_spread_penalty
    }
}

/// Pure metrics of one window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilityReport {
    pub symbol: String,
    pub total_points: usize,
    pub avg_spread: f64,
    pub min_spread: f64,
    pub max_spread: f64,
    pub spread_std_dev: f64,
    pub zero_spread_freq: f64,
    pub negative_spread_freq: f64,
    pub low_spread_freq: f64,
    pub medium_spread_freq: f64,
    pub high_spread_freq: f64,
    pub very_high_spread_freq: f64,
    pub stability_score: f64,
    pub score_breakdown: ScoreBreakdown,
    /// Timestamp of the newest tick in the window
    pub last_update: i64,
}

/// Published per-market record: the report plus collector state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    #[serde(flatten)]
    pub report: StabilityReport,
    pub data_source: TickSource,
    pub candidate_score: u32,
    pub is_analyzing: bool,
    pub in_cooldown: bool,
}

/// Compute the stability report for `ticks`. Needs at least three ticks.
pub fn metrics(symbol: &str, ticks: &[Tick]) -> Result<StabilityReport> {
    let n = ticks.len();
    if n < MIN_METRIC_TICKS {
        return Err(SpreadwatchError::InsufficientData {
            symbol: symbol.to_string(),
            points: n,
        });
    }

    let count = n as f64;
    let freq = |pred: &dyn Fn(f64) -> bool| {
        ticks.iter().filter(|t| pred(t.spread_percent)).count() as f64 / count * 100.0
    };

    let zero = freq(&|s| s <= 0.0);
    let negative = freq(&|s| s < 0.0);
    let low = freq(&|s| s < LOW_SPREAD);
    let medium = freq(&|s| (LOW_SPREAD..=MEDIUM_SPREAD_MAX).contains(&s));
    let high = freq(&|s| s > MEDIUM_SPREAD_MAX);
    let very_high = freq(&|s| s > VERY_HIGH_SPREAD);

    let avg = ticks.iter().map(|t| t.spread_percent).sum::<f64>() / count;
    let min = ticks.iter().map(|t| t.spread_percent).fold(f64::INFINITY, f64::min);
    let max = ticks
        .iter()
        .map(|t| t.spread_percent)
        .fold(f64::NEG_INFINITY, f64::max);
    let variance = ticks
        .iter()
        .map(|t| (t.spread_percent - avg).powi(2))
        .sum::<f64>()
        / count;
    let std_dev = variance.sqrt();

    let stability_factor = (1.0f64).min((medium / 50.0) * (1.0 / (std_dev * 10.0).max(1.0)));
    let breakdown = ScoreBreakdown {
        stability_bonus: medium * 2.0,
        low_spread_bonus: low,
        zero_spread_bonus: zero * (0.2 + stability_factor * 1.8),
        negative_spread_bonus: negative * (0.1 + stability_factor * 1.4),
        consistency_bonus: if zero > 20.0 && medium > 30.0 { 10.0 } else { 0.0 },
        high_spread_penalty: high * 3.0,
        very_high_spread_penalty: very_high * 10.0,
        volatility_penalty: (std_dev * 100.0).min(50.0),
        avg_spread_penalty: (avg * 10.0).max(0.0),
        stability_factor,
    };
    let score = (breakdown.bonuses() - breakdown.penalties()).clamp(0.0, 100.0);

    Ok(StabilityReport {
        symbol: symbol.to_string(),
        total_points: n,
        avg_spread: avg,
        min_spread: min,
        max_spread: max,
        spread_std_dev: std_dev,
        zero_spread_freq: zero,
        negative_spread_freq: negative,
        low_spread_freq: low,
        medium_spread_freq: medium,
        high_spread_freq: high,
        very_high_spread_freq: very_high,
        stability_score: score,
        score_breakdown: breakdown,
        last_update: ticks.last().map(|t| t.timestamp).unwrap_or_default(),
    })
}

/// Polled data wins once it has `min_polled_points`; streamed otherwise
pub fn select_source(polled_points: usize, min_polled_points: usize) -> TickSource {
    if polled_points >= min_polled_points {
        TickSource::Polled
    } else {
        TickSource::Streamed
    }
}

/// Sort records best first
pub fn rank(records: &mut [AnalysisRecord]) {
    records.sort_by(|a, b| {
        b.report
            .stability_score
            .total_cmp(&a.report.stability_score)
            .then_with(|| a.report.symbol.cmp(&b.report.symbol))
    });
}
