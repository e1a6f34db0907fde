use thiserror::Error;

/// Main error type for the spread monitor
#[derive(Error, Debug)]
pub enum SpreadwatchError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Upstream returned HTTP {status}")]
    UpstreamStatus { status: u16 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    #[error("Insufficient data for {symbol}: {points} points")]
    InsufficientData { symbol: String, points: usize },

    // Session errors
    #[error("Monitoring is not running")]
    NotRunning,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SpreadwatchError {
    /// Errors that indicate the proxy itself misbehaved (as opposed to the venue)
    pub fn is_proxy_fault(&self) -> bool {
        match self {
            SpreadwatchError::Timeout(_) | SpreadwatchError::Proxy(_) => true,
            SpreadwatchError::Http(e) => e.is_timeout() || e.is_connect(),
            SpreadwatchError::WebSocket(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for SpreadwatchError
pub type Result<T> = std::result::Result<T, SpreadwatchError>;
