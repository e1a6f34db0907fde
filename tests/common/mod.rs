//! Shared fakes for integration tests: a scripted transport with no network.

#![allow(dead_code)]

use async_trait::async_trait;
use spreadwatch::adapters::{HttpResponse, Proxy, ProxyRegistry, StreamSession, Transport};
use spreadwatch::collector::{HybridCollector, DIRECT_CONNECTION};
use spreadwatch::config::AppConfig;
use spreadwatch::error::{Result, SpreadwatchError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Connection id the pool uses for a session opened via `proxy`
fn connection_id(proxy: Option<&Proxy>) -> String {
    proxy
        .map(Proxy::key)
        .unwrap_or_else(|| DIRECT_CONNECTION.to_string())
}

pub struct FakeSession {
    id: String,
    incoming: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
    sent_by: Arc<Mutex<Vec<(String, String)>>>,
    closed: Arc<AtomicUsize>,
    /// Peer hangs up at this instant
    ends_at: Option<Instant>,
    close_delay: Duration,
}

#[async_trait]
impl StreamSession for FakeSession {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent_by
            .lock()
            .unwrap()
            .push((self.id.clone(), text.clone()));
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        match self.ends_at {
            Some(at) => tokio::select! {
                message = self.incoming.recv() => message.map(Ok),
                _ = tokio::time::sleep_until(at) => None,
            },
            None => self.incoming.recv().await.map(Ok),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub connects: AtomicUsize,
    pub gets: AtomicUsize,
    pub fail_connect: bool,
    pub quote_body: Option<String>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicUsize>,
    /// The first session on each connection id hangs up after this long
    pub drop_first_after: Option<Duration>,
    pub close_delay: Duration,
    sent_by: Arc<Mutex<Vec<(String, String)>>>,
    connects_by: Mutex<HashMap<String, usize>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl FakeTransport {
    pub fn streaming() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            fail_connect: true,
            ..Default::default()
        }
    }

    /// First stream on every connection id ends after `after`; reconnects stay up
    pub fn flaky(after: Duration) -> Self {
        Self {
            drop_first_after: Some(after),
            ..Default::default()
        }
    }

    /// Sessions take `delay` to close
    pub fn slow_closing(delay: Duration) -> Self {
        Self {
            close_delay: delay,
            ..Default::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connects_for(&self, id: &str) -> usize {
        self.connects_by.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Subscribed channels sent on one connection id, in send order
    pub fn channels_for(&self, id: &str) -> Vec<String> {
        self.sent_by
            .lock()
            .unwrap()
            .iter()
            .filter(|(conn, _)| conn == id)
            .map(|(_, text)| {
                let request: serde_json::Value = serde_json::from_str(text).unwrap();
                request["params"]["channel"].as_str().unwrap().to_string()
            })
            .collect()
    }

    /// Push a message to every open session
    pub fn push(&self, text: &str) {
        for feed in self.feeds.lock().unwrap().iter() {
            let _ = feed.send(text.to_string());
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &str, _proxy: Option<&Proxy>, _timeout: Duration) -> Result<HttpResponse> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        match &self.quote_body {
            Some(body) => Ok(HttpResponse::ok(body.clone())),
            None => Err(SpreadwatchError::Timeout(url.to_string())),
        }
    }

    async fn connect(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        _timeout: Duration,
    ) -> Result<Box<dyn StreamSession>> {
        let id = connection_id(proxy);
        self.connects.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut by_id = self.connects_by.lock().unwrap();
            let count = by_id.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if self.fail_connect {
            return Err(SpreadwatchError::Timeout(url.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push(tx);
        Ok(Box::new(FakeSession {
            id,
            incoming: rx,
            sent: Arc::clone(&self.sent),
            sent_by: Arc::clone(&self.sent_by),
            closed: Arc::clone(&self.closed),
            ends_at: self
                .drop_first_after
                .filter(|_| attempt == 1)
                .map(|after| Instant::now() + after),
            close_delay: self.close_delay,
        }))
    }
}

/// Fast timings, snapshot under `dir`
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.stream.post_connect_delay_ms = 0;
    config.stream.subscribe_delay_ms = 0;
    config.stream.direct_subscribe_delay_ms = 0;
    config.stream.reconnect_base_ms = 1;
    config.stream.reconnect_max_ms = 5;
    config.snapshot.path = dir.join("spread-data.json");
    config
}

pub fn collector_with(
    config: AppConfig,
    transport: Arc<FakeTransport>,
    markets: &[&str],
) -> Arc<HybridCollector> {
    collector_via(config, transport, markets, "")
}

/// Like [`collector_with`], routed through a `host:port` proxy list
pub fn collector_via(
    config: AppConfig,
    transport: Arc<FakeTransport>,
    markets: &[&str],
    proxies: &str,
) -> Arc<HybridCollector> {
    let registry = ProxyRegistry::new();
    registry.load(proxies);
    let collector = Arc::new(HybridCollector::new(config, transport, Arc::new(registry)));
    collector.set_markets(markets.iter().map(|s| s.to_string()).collect());
    collector
}

/// Poll `cond` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
