//! Request/response and streaming transport, optionally tunneled through a proxy
//!
//! The collector only sees the [`Transport`] and [`StreamSession`] traits so
//! tests can swap the network out. [`HttpTransport`] is the production
//! implementation: `reqwest` for polling (one cached client per proxy) and
//! `tokio-tungstenite` for streaming, with proxied streams opened through
//! a plain HTTP `CONNECT` tunnel.

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::proxy_registry::Proxy;
use crate::error::{Result, SpreadwatchError};

/// One live streaming connection
#[async_trait]
pub trait StreamSession: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text payload. `None` once the peer has closed the stream.
    async fn next_text(&mut self) -> Option<Result<String>>;

    async fn ping(&mut self) -> Result<()>;

    /// Close with a normal-closure code. Safe on an already-dead stream.
    async fn close(&mut self) -> Result<()>;
}

/// A completed request, whatever its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body of a 2xx response; any other status is an error
    pub fn into_body(self) -> Result<String> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(SpreadwatchError::UpstreamStatus {
                status: self.status,
            })
        }
    }
}

/// Network collaborator used by both the polling and the streaming paths
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url`. Only a request that never completed is an error.
    async fn get(&self, url: &str, proxy: Option<&Proxy>, timeout: Duration) -> Result<HttpResponse>;

    /// Open a streaming connection; the whole handshake is bounded by `timeout`
    async fn connect(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> Result<Box<dyn StreamSession>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production transport
pub struct HttpTransport {
    direct: reqwest::Client,
    proxied: DashMap<String, reqwest::Client>,
}

const USER_AGENT: &str = "Mozilla/5.0 (compatible; spreadwatch/0.1)";

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let direct = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SpreadwatchError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            direct,
            proxied: DashMap::new(),
        })
    }

    fn client_for(&self, proxy: Option<&Proxy>) -> Result<reqwest::Client> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let key = proxy.key();
        if let Some(client) = self.proxied.get(&key) {
            return Ok(client.clone());
        }

        let mut upstream = reqwest::Proxy::all(format!("http://{}", key))
            .map_err(|e| SpreadwatchError::Proxy(format!("invalid proxy {}: {}", key, e)))?;
        if let Some((user, pass)) = proxy.credentials() {
            upstream = upstream.basic_auth(user, pass);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .proxy(upstream)
            .build()
            .map_err(|e| SpreadwatchError::Proxy(format!("client for {}: {}", key, e)))?;
        self.proxied.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, proxy: Option<&Proxy>, timeout: Duration) -> Result<HttpResponse> {
        let client = self.client_for(proxy)?;
        let response = client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SpreadwatchError::Timeout(url.to_string())
                } else {
                    SpreadwatchError::Http(e)
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn connect(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> Result<Box<dyn StreamSession>> {
        let url = Url::parse(url)
            .map_err(|e| SpreadwatchError::Internal(format!("Invalid WebSocket URL: {}", e)))?;

        let ws = tokio::time::timeout(timeout, connect_websocket(&url, proxy))
            .await
            .map_err(|_| SpreadwatchError::Timeout(format!("WebSocket handshake to {}", url)))??;

        Ok(Box::new(WsSession { ws }))
    }
}

async fn connect_websocket(url: &Url, proxy: Option<&Proxy>) -> Result<WsStream> {
    let Some(proxy) = proxy else {
        let (ws, _) = connect_async(url.as_str()).await?;
        return Ok(ws);
    };

    let host = url
        .host_str()
        .ok_or_else(|| SpreadwatchError::Internal("No host in URL".to_string()))?;
    let secure = url.scheme() == "wss";
    let port = url.port().unwrap_or(if secure { 443 } else { 80 });

    let tcp_stream = connect_via_proxy(proxy, host, port).await?;

    let stream = if secure {
        let connector = native_tls::TlsConnector::new()
            .map_err(|e| SpreadwatchError::Internal(format!("TLS connector error: {}", e)))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls_stream = connector
            .connect(host, tcp_stream)
            .await
            .map_err(|e| SpreadwatchError::Proxy(format!("TLS handshake via {} failed: {}", proxy, e)))?;
        MaybeTlsStream::NativeTls(tls_stream)
    } else {
        MaybeTlsStream::Plain(tcp_stream)
    };

    let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), stream).await?;
    Ok(ws)
}

/// Open a TCP tunnel to `target_host:target_port` through an HTTP CONNECT proxy
async fn connect_via_proxy(proxy: &Proxy, target_host: &str, target_port: u16) -> Result<TcpStream> {
    debug!(
        "Connecting to {}:{} via proxy {}",
        target_host, target_port, proxy
    );

    let stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| SpreadwatchError::Proxy(format!("connect to {} failed: {}", proxy, e)))?;

    let mut connect_request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: keep-alive\r\n",
        host = target_host,
        port = target_port
    );
    if let Some((user, pass)) = proxy.credentials() {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        connect_request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    connect_request.push_str("\r\n");

    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(connect_request.as_bytes())
        .await
        .map_err(|e| SpreadwatchError::Proxy(format!("Failed to send CONNECT: {}", e)))?;

    let mut buf_reader = BufReader::new(reader);
    let mut status_line = String::new();
    buf_reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| SpreadwatchError::Proxy(format!("Failed to read proxy response: {}", e)))?;

    if !tunnel_established(&status_line) {
        return Err(SpreadwatchError::Proxy(format!(
            "CONNECT via {} refused: {}",
            proxy,
            status_line.trim()
        )));
    }

    loop {
        let mut line = String::new();
        let n = buf_reader
            .read_line(&mut line)
            .await
            .map_err(|e| SpreadwatchError::Proxy(format!("Failed to read proxy headers: {}", e)))?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    let reader = buf_reader.into_inner();
    let stream = reader
        .reunite(writer)
        .map_err(|e| SpreadwatchError::Internal(format!("Failed to reunite stream: {}", e)))?;

    debug!("Proxy tunnel established to {}:{}", target_host, target_port);
    Ok(stream)
}

/// `HTTP/1.x 200 ...`
fn tunnel_established(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some("200")) if version.starts_with("HTTP/")
    )
}

struct WsSession {
    ws: WsStream,
}

#[async_trait]
impl StreamSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        return Some(Ok(text));
                    }
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.ws.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.ws.close(Some(frame)).await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed)
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
