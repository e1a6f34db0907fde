//! Venue wire formats: REST market list, single-market quote, and the
//! JSON-RPC push subscription protocol.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::proxy_registry::Proxy;
use super::transport::Transport;
use crate::error::{Result, SpreadwatchError};
use crate::services::metrics::TrafficStats;

/// Channel prefix for best-bid/offer pushes
const QUOTE_CHANNEL_PREFIX: &str = "bbo.";

/// Number that the venue may send either as a JSON string or a JSON number
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberLike {
    Number(f64),
    Text(String),
}

impl NumberLike {
    pub fn value(&self) -> Option<f64> {
        match self {
            NumberLike::Number(n) => Some(*n),
            NumberLike::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    results: Vec<MarketEntry>,
}

#[derive(Debug, Deserialize)]
struct MarketEntry {
    symbol: String,
    #[serde(default)]
    asset_kind: String,
}

/// Keep only perpetual-futures symbols from a market list body
pub fn parse_perp_markets(body: &str) -> Result<Vec<String>> {
    let response: MarketsResponse = serde_json::from_str(body)?;
    Ok(response
        .results
        .into_iter()
        .filter(|m| m.asset_kind == "PERP")
        .map(|m| m.symbol)
        .collect())
}

/// Polled quote payload. The venue answers in one of two shapes and both
/// are resolved here, at the parse boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum PolledQuote {
    /// `{"bid": "...", "ask": "..."}`
    Simple { bid: f64, ask: f64 },
    /// `{"best_bid_interactive": [price, size], "best_ask_interactive": [price, size]}`
    Interactive {
        bid: f64,
        bid_size: Option<f64>,
        ask: f64,
        ask_size: Option<f64>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPolledQuote {
    Interactive {
        best_bid_interactive: Vec<NumberLike>,
        best_ask_interactive: Vec<NumberLike>,
    },
    Simple {
        bid: NumberLike,
        ask: NumberLike,
    },
}

impl PolledQuote {
    pub fn parse(body: &str) -> Result<Self> {
        let raw: RawPolledQuote = serde_json::from_str(body)
            .map_err(|e| SpreadwatchError::InvalidMarketData(format!("quote payload: {}", e)))?;

        let missing = || SpreadwatchError::InvalidMarketData("quote missing price".to_string());
        match raw {
            RawPolledQuote::Interactive {
                best_bid_interactive,
                best_ask_interactive,
            } => Ok(PolledQuote::Interactive {
                bid: best_bid_interactive
                    .first()
                    .and_then(NumberLike::value)
                    .ok_or_else(missing)?,
                bid_size: best_bid_interactive.get(1).and_then(NumberLike::value),
                ask: best_ask_interactive
                    .first()
                    .and_then(NumberLike::value)
                    .ok_or_else(missing)?,
                ask_size: best_ask_interactive.get(1).and_then(NumberLike::value),
            }),
            RawPolledQuote::Simple { bid, ask } => Ok(PolledQuote::Simple {
                bid: bid.value().ok_or_else(missing)?,
                ask: ask.value().ok_or_else(missing)?,
            }),
        }
    }

    pub fn bid_ask(&self) -> (f64, f64) {
        match *self {
            PolledQuote::Simple { bid, ask } => (bid, ask),
            PolledQuote::Interactive { bid, ask, .. } => (bid, ask),
        }
    }
}

/// Quote carried by a push message
#[derive(Debug, Clone, PartialEq)]
pub struct StreamQuote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    params: PushParams,
}

#[derive(Debug, Deserialize)]
struct PushParams {
    channel: String,
    data: PushData,
}

#[derive(Debug, Deserialize)]
struct PushData {
    bid: NumberLike,
    ask: NumberLike,
}

/// Parse a push message. Anything that is not a quote update for a
/// subscribed channel is protocol noise and yields `None`.
pub fn parse_push(text: &str) -> Option<StreamQuote> {
    let message: PushMessage = serde_json::from_str(text).ok()?;
    let symbol = message.params.channel.strip_prefix(QUOTE_CHANNEL_PREFIX)?;
    if symbol.is_empty() {
        return None;
    }

    Some(StreamQuote {
        symbol: symbol.to_string(),
        bid: message.params.data.bid.value()?,
        ask: message.params.data.ask.value()?,
    })
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    id: i64,
    jsonrpc: &'a str,
    method: &'a str,
    params: SubscribeParams,
}

#[derive(Debug, Serialize)]
struct SubscribeParams {
    channel: String,
}

/// JSON-RPC subscribe request for one market's quote channel
pub fn subscribe_request(symbol: &str, id: i64) -> String {
    let request = SubscribeRequest {
        id,
        jsonrpc: "2.0",
        method: "subscribe",
        params: SubscribeParams {
            channel: format!("{}{}", QUOTE_CHANNEL_PREFIX, symbol),
        },
    };
    // Plain structs of strings and integers always serialize
    serde_json::to_string(&request).unwrap_or_default()
}

/// REST side of the venue
#[derive(Clone)]
pub struct VenueClient {
    transport: Arc<dyn Transport>,
    rest_url: String,
    timeout: Duration,
    traffic: Option<Arc<TrafficStats>>,
}

impl VenueClient {
    pub fn new(transport: Arc<dyn Transport>, rest_url: &str, timeout: Duration) -> Self {
        Self {
            transport,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            timeout,
            traffic: None,
        }
    }

    /// Count every completed quote response, parsed or not, in `traffic`
    pub fn with_traffic(mut self, traffic: Arc<TrafficStats>) -> Self {
        self.traffic = Some(traffic);
        self
    }

    pub fn markets_url(&self) -> String {
        format!("{}/markets", self.rest_url)
    }

    pub fn quote_url(&self, symbol: &str) -> String {
        format!(
            "{}/bbo/{}/interactive",
            self.rest_url,
            urlencoding::encode(symbol)
        )
    }

    /// One-time market discovery, perpetuals only
    pub async fn fetch_markets(&self, proxy: Option<&Proxy>) -> Result<Vec<String>> {
        let body = self
            .transport
            .get(&self.markets_url(), proxy, self.timeout)
            .await?
            .into_body()?;
        let markets = parse_perp_markets(&body)?;
        debug!("Venue listed {} PERP markets", markets.len());
        Ok(markets)
    }

    /// Fetch one market's quote
    pub async fn fetch_quote(&self, symbol: &str, proxy: Option<&Proxy>) -> Result<PolledQuote> {
        let response = self
            .transport
            .get(&self.quote_url(symbol), proxy, self.timeout)
            .await?;
        if let Some(traffic) = &self.traffic {
            traffic.record_poll_response(response.body.len());
        }
        PolledQuote::parse(&response.into_body()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{HttpResponse, StreamSession};

    #[test]
    fn test_parse_perp_markets_filters_kind() {
        let body = r#"{"results":[
            {"symbol":"BTC-USD-PERP","asset_kind":"PERP"},
            {"symbol":"BTC-USD-OPT","asset_kind":"PERP_OPTION"},
            {"symbol":"ETH-USD-PERP","asset_kind":"PERP"}
        ]}"#;
        assert_eq!(
            parse_perp_markets(body).unwrap(),
            vec!["BTC-USD-PERP".to_string(), "ETH-USD-PERP".to_string()]
        );
        assert!(parse_perp_markets("{}").unwrap().is_empty());
        assert!(parse_perp_markets("not json").is_err());
    }

    #[test]
    fn test_polled_quote_interactive_shape() {
        let quote = PolledQuote::parse(
            r#"{"market":"BTC-USD-PERP","best_bid_interactive":["100.5","2"],"best_ask_interactive":["100.6","1.5"]}"#,
        )
        .unwrap();
        assert_eq!(
            quote,
            PolledQuote::Interactive {
                bid: 100.5,
                bid_size: Some(2.0),
                ask: 100.6,
                ask_size: Some(1.5),
            }
        );
        assert_eq!(quote.bid_ask(), (100.5, 100.6));
    }

    #[test]
    fn test_polled_quote_simple_shape() {
        let quote = PolledQuote::parse(r#"{"bid":"99.9","ask":100.1,"last_updated_at":1}"#).unwrap();
        assert_eq!(quote, PolledQuote::Simple { bid: 99.9, ask: 100.1 });
    }

    #[test]
    fn test_polled_quote_rejects_unknown_shape() {
        assert!(PolledQuote::parse(r#"{"price":"1"}"#).is_err());
        assert!(PolledQuote::parse(r#"{"best_bid_interactive":[],"best_ask_interactive":["1"]}"#).is_err());
        assert!(PolledQuote::parse(r#"{"bid":"abc","ask":"1"}"#).is_err());
    }

    #[test]
    fn test_parse_push_quote() {
        let text = r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"bbo.SOL-USD-PERP","data":{"market":"SOL-USD-PERP","bid":"150.1","ask":"150.2"}}}"#;
        let quote = parse_push(text).unwrap();
        assert_eq!(quote.symbol, "SOL-USD-PERP");
        assert_eq!(quote.bid, 150.1);
        assert_eq!(quote.ask, 150.2);
    }

    #[test]
    fn test_parse_push_ignores_noise() {
        // subscribe acknowledgement
        assert!(parse_push(r#"{"jsonrpc":"2.0","id":1,"result":{"channel":"bbo.X"}}"#).is_none());
        // other channel
        assert!(parse_push(r#"{"params":{"channel":"trades.X","data":{"bid":"1","ask":"2"}}}"#).is_none());
        // missing side
        assert!(parse_push(r#"{"params":{"channel":"bbo.X","data":{"bid":"1"}}}"#).is_none());
        assert!(parse_push("not json").is_none());
    }

    #[test]
    fn test_subscribe_request_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&subscribe_request("BTC-USD-PERP", 42)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "subscribe");
        assert_eq!(json["params"]["channel"], "bbo.BTC-USD-PERP");
        assert_eq!(json["id"], 42);
    }

    /// Replies to every GET with a fixed status and body
    struct CannedTransport {
        status: u16,
        body: &'static str,
    }

    #[async_trait::async_trait]
    impl Transport for CannedTransport {
        async fn get(
            &self,
            _url: &str,
            _proxy: Option<&Proxy>,
            _timeout: Duration,
        ) -> Result<HttpResponse> {
            Ok(HttpResponse {
                status: self.status,
                body: self.body.to_string(),
            })
        }

        async fn connect(
            &self,
            _url: &str,
            _proxy: Option<&Proxy>,
            _timeout: Duration,
        ) -> Result<Box<dyn StreamSession>> {
            Err(SpreadwatchError::Internal("not streaming".to_string()))
        }
    }

    fn canned(status: u16, body: &'static str) -> (VenueClient, Arc<TrafficStats>) {
        let traffic = Arc::new(TrafficStats::new());
        let client = VenueClient::new(
            Arc::new(CannedTransport { status, body }),
            "https://api.example/v1",
            Duration::from_secs(1),
        )
        .with_traffic(Arc::clone(&traffic));
        (client, traffic)
    }

    #[tokio::test]
    async fn test_every_completed_quote_response_is_counted() {
        let (client, traffic) = canned(200, r#"{"bid":"1","ask":"1.1"}"#);
        assert!(client.fetch_quote("X", None).await.is_ok());

        let (rejected, rejected_traffic) = canned(503, "service unavailable");
        let err = rejected.fetch_quote("X", None).await.unwrap_err();
        assert!(matches!(err, SpreadwatchError::UpstreamStatus { status: 503 }));

        let (garbled, garbled_traffic) = canned(200, "<html>");
        assert!(garbled.fetch_quote("X", None).await.is_err());

        for (stats, bytes) in [(&traffic, 23u64), (&rejected_traffic, 19), (&garbled_traffic, 6)] {
            let snap = stats.snapshot(Default::default());
            assert_eq!(snap.poll_requests, 1);
            assert_eq!(snap.poll_bytes_received, bytes);
        }
    }

    #[tokio::test]
    async fn test_market_list_needs_success_status() {
        let (client, traffic) = canned(500, r#"{"results":[]}"#);
        assert!(client.fetch_markets(None).await.is_err());
        // discovery is not poll traffic
        assert_eq!(traffic.snapshot(Default::default()).poll_requests, 0);
    }

    #[test]
    fn test_quote_url_encodes_symbol() {
        let client = VenueClient::new(
            std::sync::Arc::new(crate::adapters::HttpTransport::new().unwrap()),
            "https://api.example/v1/",
            Duration::from_secs(1),
        );
        assert_eq!(client.markets_url(), "https://api.example/v1/markets");
        assert_eq!(
            client.quote_url("BTC-USD-PERP"),
            "https://api.example/v1/bbo/BTC-USD-PERP/interactive"
        );
    }
}
