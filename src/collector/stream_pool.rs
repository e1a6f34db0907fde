//! Pool of persistent quote-stream connections
//!
//! One connection per proxy (or a single direct one). The market list is
//! split into contiguous slices and each connection owns its slice for its
//! whole life, so a symbol is only ever written by one connection.
//! Every connection runs its own connect/subscribe/read/backoff loop inside
//! a [`JoinSet`]; `stop()` signals them to close cleanly and then aborts
//! whatever is left.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::ingest::TickPipeline;
use crate::adapters::{parse_push, subscribe_request, Proxy, ProxyRegistry, StreamSession, Transport};
use crate::config::StreamConfig;
use crate::domain::now_ms;
use crate::error::Result;

/// Connection id used when no proxy is configured
pub const DIRECT_CONNECTION: &str = "direct";

/// How long `stop()` lets connections close on their own before aborting them
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connecting,
    Live,
    /// Waiting out a reconnect delay
    Backoff,
    /// Gave up after too many reconnects; its markets go stale
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub state: ConnectionState,
    pub attempts: u32,
    pub markets: Vec<String>,
}

/// Capped exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect number `attempts + 1`, or `None` once the cap is hit
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

/// Split `markets` into contiguous slices of `ceil(n / connections)`.
/// Trailing connections may get nothing when there are more connections than markets.
pub fn partition(markets: &[String], connections: usize) -> Vec<Vec<String>> {
    if connections == 0 || markets.is_empty() {
        return Vec::new();
    }
    let per_connection = markets.len().div_ceil(connections);
    markets.chunks(per_connection).map(|c| c.to_vec()).collect()
}

/// Shared by every connection task
struct PoolContext {
    transport: Arc<dyn Transport>,
    registry: Arc<ProxyRegistry>,
    pipeline: Arc<TickPipeline>,
    connections: Arc<DashMap<String, ConnectionInfo>>,
    config: StreamConfig,
    ws_url: String,
    policy: ReconnectPolicy,
}

impl PoolContext {
    fn set_state(&self, id: &str, state: ConnectionState, attempts: u32) {
        if let Some(mut info) = self.connections.get_mut(id) {
            info.state = state;
            info.attempts = attempts;
        }
    }
}

struct Running {
    tasks: JoinSet<()>,
    shutdown: watch::Sender<bool>,
}

enum SessionEnd {
    /// Peer closed or the stream failed; reconnect
    Lost,
    Shutdown,
}

pub struct StreamPool {
    ctx: Arc<PoolContext>,
    running: Mutex<Option<Running>>,
}

impl StreamPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ProxyRegistry>,
        pipeline: Arc<TickPipeline>,
        config: StreamConfig,
        ws_url: &str,
    ) -> Self {
        let policy = ReconnectPolicy::from_config(&config);
        Self {
            ctx: Arc::new(PoolContext {
                transport,
                registry,
                pipeline,
                connections: Arc::new(DashMap::new()),
                config,
                ws_url: ws_url.to_string(),
                policy,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Spawn one connection task per proxy, or a single direct one. No-op if already running.
    pub fn start(&self, markets: &[String], proxies: &[Proxy]) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            debug!("Stream pool already running");
            return;
        }

        let (shutdown, _) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let direct = proxies.is_empty();
        let slots: Vec<Option<Proxy>> = if direct {
            vec![None]
        } else {
            proxies.iter().cloned().map(Some).collect()
        };
        let slices = partition(markets, slots.len());
        info!(
            "Assigning {} markets to {} stream connection(s){}",
            markets.len(),
            slices.len(),
            if direct { " (direct)" } else { "" }
        );

        let batch_size = self.ctx.config.connect_batch_size.max(1);
        for (i, (proxy, assigned)) in slots.into_iter().zip(slices).enumerate() {
            let id = proxy
                .as_ref()
                .map(Proxy::key)
                .unwrap_or_else(|| DIRECT_CONNECTION.to_string());
            self.ctx.connections.insert(
                id.clone(),
                ConnectionInfo {
                    id: id.clone(),
                    state: ConnectionState::Connecting,
                    attempts: 0,
                    markets: assigned.clone(),
                },
            );

            let start_delay =
                Duration::from_millis((i / batch_size) as u64 * self.ctx.config.connect_batch_pause_ms);
            let ctx = Arc::clone(&self.ctx);
            let rx = shutdown.subscribe();
            tasks.spawn(run_connection(ctx, id, proxy, assigned, start_delay, rx));
        }

        *running = Some(Running { tasks, shutdown });
    }

    /// Close every connection and forget all assignments. Safe to call at any time.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Running { mut tasks, shutdown }) = running {
            let _ = shutdown.send(true);
            let drained = tokio::time::timeout(STOP_GRACE, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Stream connections did not close in time; aborting {}", tasks.len());
            }
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            info!("Stream pool stopped");
        }
        self.ctx.connections.clear();
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> =
            self.ctx.connections.iter().map(|e| e.value().clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn live_count(&self) -> usize {
        self.count_in(ConnectionState::Live)
    }

    pub fn abandoned_count(&self) -> usize {
        self.count_in(ConnectionState::Abandoned)
    }

    fn count_in(&self, state: ConnectionState) -> usize {
        self.ctx
            .connections
            .iter()
            .filter(|e| e.state == state)
            .count()
    }
}

/// Resolves once shutdown is requested (or the pool is gone)
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep unless shutdown wins. Returns `false` on shutdown.
async fn pause(duration: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    if duration.is_zero() {
        return !*rx.borrow();
    }
    tokio::select! {
        _ = shutdown_requested(rx) => false,
        _ = sleep(duration) => true,
    }
}

async fn run_connection(
    ctx: Arc<PoolContext>,
    id: String,
    proxy: Option<Proxy>,
    markets: Vec<String>,
    start_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if !pause(start_delay, &mut shutdown).await {
        return;
    }

    let mut attempts: u32 = 0;
    loop {
        ctx.set_state(&id, ConnectionState::Connecting, attempts);

        let connected = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            result = ctx.transport.connect(&ctx.ws_url, proxy.as_ref(), ctx.config.handshake_timeout()) => result,
        };

        match connected {
            Ok(session) => {
                attempts = 0;
                ctx.set_state(&id, ConnectionState::Live, attempts);
                info!("[{}] stream connected, {} markets assigned", id, markets.len());

                match serve_connection(&ctx, &id, session, &markets, proxy.is_none(), &mut shutdown).await {
                    Ok(SessionEnd::Shutdown) => return,
                    Ok(SessionEnd::Lost) => info!("[{}] stream closed", id),
                    Err(e) => warn!("[{}] stream error: {}", id, e),
                }
            }
            Err(e) => {
                warn!("[{}] connect failed: {}", id, e);
                if let Some(proxy) = proxy.as_ref().filter(|_| e.is_proxy_fault()) {
                    ctx.registry.mark_failed(proxy);
                }
            }
        }

        if *shutdown.borrow() {
            return;
        }

        let Some(delay) = ctx.policy.next_delay(attempts) else {
            ctx.set_state(&id, ConnectionState::Abandoned, attempts);
            warn!(
                "[{}] giving up after {} reconnect attempts; {} markets will go stale",
                id,
                attempts,
                markets.len()
            );
            return;
        };
        attempts += 1;
        ctx.set_state(&id, ConnectionState::Backoff, attempts);
        ctx.pipeline.traffic().inc_reconnects();
        info!(
            "[{}] reconnecting in {:?} (attempt {}/{})",
            id, delay, attempts, ctx.policy.max_attempts
        );

        if !pause(delay, &mut shutdown).await {
            return;
        }
    }
}

enum Event {
    Shutdown,
    Ping,
    Message(Option<Result<String>>),
}

/// Subscribe the assigned markets and pump messages until the stream ends
async fn serve_connection(
    ctx: &PoolContext,
    id: &str,
    mut session: Box<dyn StreamSession>,
    markets: &[String],
    direct: bool,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd> {
    let traffic = ctx.pipeline.traffic();

    if !pause(Duration::from_millis(ctx.config.post_connect_delay_ms), shutdown).await {
        let _ = session.close().await;
        return Ok(SessionEnd::Shutdown);
    }

    let subscribe_gap = Duration::from_millis(if direct {
        ctx.config.direct_subscribe_delay_ms
    } else {
        ctx.config.subscribe_delay_ms
    });
    for (i, symbol) in markets.iter().enumerate() {
        let request = subscribe_request(symbol, i as i64 + 1);
        traffic.record_stream_sent(request.len());
        session.send_text(request).await?;
        if !pause(subscribe_gap, shutdown).await {
            let _ = session.close().await;
            return Ok(SessionEnd::Shutdown);
        }
    }
    debug!("[{}] subscribed {} markets", id, markets.len());

    let mut ping = interval(Duration::from_secs(ctx.config.ping_interval_secs.max(1)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let event = tokio::select! {
            _ = shutdown_requested(shutdown) => Event::Shutdown,
            _ = ping.tick() => Event::Ping,
            message = session.next_text() => Event::Message(message),
        };

        match event {
            Event::Shutdown => {
                if let Err(e) = session.close().await {
                    debug!("[{}] close failed: {}", id, e);
                }
                return Ok(SessionEnd::Shutdown);
            }
            Event::Ping => session.ping().await?,
            Event::Message(Some(Ok(text))) => {
                traffic.record_stream_message(text.len());
                if let Some(quote) = parse_push(&text) {
                    ctx.pipeline
                        .on_streamed(&quote.symbol, quote.bid, quote.ask, now_ms());
                }
            }
            Event::Message(Some(Err(e))) => return Err(e),
            Event::Message(None) => return Ok(SessionEnd::Lost),
        }
    }
}
