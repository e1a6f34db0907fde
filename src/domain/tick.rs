use serde::{Deserialize, Serialize};

use crate::error::{Result, SpreadwatchError};

/// Where a tick came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickSource {
    /// Push subscription, throttled per market
    #[default]
    #[serde(alias = "websocket")]
    Streamed,
    /// On-demand request for a promoted candidate
    #[serde(alias = "http")]
    Polled,
}

impl TickSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickSource::Streamed => "streamed",
            TickSource::Polled => "polled",
        }
    }
}

impl std::fmt::Display for TickSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One bid/ask observation. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    #[serde(default)]
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub spread_percent: f64,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub source: TickSource,
}

/// Wall clock in epoch milliseconds, the time base of every tick and deadline
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Tick {
    /// Build a tick, rejecting non-finite or non-positive prices.
    pub fn new(symbol: &str, bid: f64, ask: f64, timestamp: i64, source: TickSource) -> Result<Self> {
        if !bid.is_finite() || !ask.is_finite() || bid <= 0.0 || ask <= 0.0 {
            return Err(SpreadwatchError::InvalidMarketData(format!(
                "{} bid={} ask={}",
                symbol, bid, ask
            )));
        }

        let spread = ask - bid;
        Ok(Self {
            symbol: symbol.to_string(),
            bid,
            ask,
            spread,
            spread_percent: spread / bid * 100.0,
            timestamp,
            source,
        })
    }
}
