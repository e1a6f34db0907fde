//! Hybrid collector: streamed quotes for every market, polled quotes for
//! promoted candidates.
//!
//! [`HybridCollector`] is the one service object that owns all collection
//! state. It is built once at startup (or per test) and shared behind an
//! `Arc`; nothing here is global.

use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::ingest::TickPipeline;
use super::scheduler::{AnalysisPhase, AnalysisScheduler};
use super::stability::{metrics, rank, select_source, AnalysisRecord};
use super::stream_pool::{ConnectionInfo, StreamPool};
use crate::adapters::{ProxyRegistry, ProxyStats, Transport, VenueClient};
use crate::config::AppConfig;
use crate::domain::{now_ms, TickSource};
use crate::error::Result;
use crate::persistence::{MarketSnapshot, SnapshotStore};
use crate::services::metrics::{PipelineGauges, TrafficSnapshot, TrafficStats};

/// Collector-side part of the status report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStatus {
    pub markets: usize,
    pub history_size: usize,
    pub is_collecting: bool,
    pub use_proxy: bool,
    pub proxy_stats: ProxyStats,
    pub connections: Vec<ConnectionInfo>,
    pub traffic_stats: TrafficSnapshot,
}

pub struct HybridCollector {
    config: AppConfig,
    markets: RwLock<Vec<String>>,
    registry: Arc<ProxyRegistry>,
    venue: VenueClient,
    traffic: Arc<TrafficStats>,
    pipeline: Arc<TickPipeline>,
    scheduler: AnalysisScheduler,
    pool: StreamPool,
    snapshots: SnapshotStore,
    /// Scheduler loop and housekeeping loop while collecting
    workers: Mutex<Option<JoinSet<()>>>,
    collecting: AtomicBool,
}

impl HybridCollector {
    pub fn new(config: AppConfig, transport: Arc<dyn Transport>, registry: Arc<ProxyRegistry>) -> Self {
        let traffic = Arc::new(TrafficStats::new());
        let pipeline = Arc::new(TickPipeline::new(&config, Arc::clone(&traffic)));
        let venue = VenueClient::new(
            Arc::clone(&transport),
            &config.venue.rest_url,
            config.scheduler.request_timeout(),
        )
        .with_traffic(Arc::clone(&traffic));
        let pool = StreamPool::new(
            transport,
            Arc::clone(&registry),
            Arc::clone(&pipeline),
            config.stream.clone(),
            &config.venue.ws_url,
        );

        Self {
            scheduler: AnalysisScheduler::new(&config.scheduler),
            snapshots: SnapshotStore::new(config.snapshot.path.clone()),
            markets: RwLock::new(Vec::new()),
            registry,
            venue,
            traffic,
            pipeline,
            pool,
            workers: Mutex::new(None),
            collecting: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<TickPipeline> {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &AnalysisScheduler {
        &self.scheduler
    }

    pub fn pool(&self) -> &StreamPool {
        &self.pool
    }

    pub fn traffic(&self) -> &Arc<TrafficStats> {
        &self.traffic
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn markets(&self) -> Vec<String> {
        self.markets.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_markets(&self, markets: Vec<String>) {
        *self.markets.write().unwrap_or_else(|e| e.into_inner()) = markets;
    }

    /// Fetch the PERP market list once. On failure the list stays as it was.
    pub async fn discover_markets(&self) -> Result<usize> {
        let proxy = self.registry.next();
        match self.venue.fetch_markets(proxy.as_ref()).await {
            Ok(markets) => {
                let count = markets.len();
                info!("Discovered {} PERP markets", count);
                self.set_markets(markets);
                Ok(count)
            }
            Err(e) => {
                if let Some(proxy) = proxy.as_ref().filter(|_| e.is_proxy_fault()) {
                    self.registry.mark_failed(proxy);
                }
                Err(e)
            }
        }
    }

    /// Load the persisted windows, if any. Returns the number of markets restored.
    pub async fn restore_snapshot(&self) -> Result<usize> {
        match self.snapshots.load().await? {
            Some(document) => {
                let count = document.len();
                self.pipeline.store().restore(document);
                Ok(count)
            }
            None => Ok(0),
        }
    }

    pub async fn save_snapshot(&self) -> Result<()> {
        let document = self.pipeline.store().serialize();
        self.snapshots.save(&document).await
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    /// Start streaming, the scheduler loop and housekeeping. No-op if already collecting.
    pub fn start_collection(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_some() {
            return;
        }

        info!("Starting hybrid collection");
        self.traffic.reset();
        self.pool.start(&self.markets(), &self.registry.proxies());

        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(self).scheduler_loop());
        tasks.spawn(Arc::clone(self).housekeeping_loop());
        *workers = Some(tasks);
        self.collecting.store(true, Ordering::SeqCst);
    }

    /// Stop every background task and close every connection
    pub async fn stop_collection(&self) {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut tasks) = workers {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        self.scheduler.stop();
        self.pool.stop().await;
        self.collecting.store(false, Ordering::SeqCst);
        info!("Hybrid collection stopped");
    }

    /// Poll cycles are spawned so a slow poll never delays the next tick.
    /// In-flight cycles live in this task's `JoinSet` and die with it.
    async fn scheduler_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.config.scheduler.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let collector = Arc::clone(&self);
                    inflight.spawn(async move { collector.run_poll_cycle(now_ms()).await });
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }
    }

    async fn housekeeping_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.snapshot.interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = self.pipeline.store().evict_stale(now_ms());
            if evicted > 0 {
                debug!("Evicted {} stale ticks", evicted);
            }
            if let Err(e) = self.save_snapshot().await {
                error!("Failed to save snapshot: {}", e);
            }
            self.traffic.log_summary(self.gauges());
        }
    }

    /// One scheduler step: advance the state machine to `now` and poll the
    /// analyzing set with an all-settled join.
    pub async fn run_poll_cycle(&self, now: i64) -> usize {
        let plan = self.scheduler.tick(now, self.pipeline.board());

        for symbol in &plan.started {
            info!(
                "Starting deep analysis: {} (candidate score {})",
                symbol,
                self.pipeline.board().get(symbol)
            );
        }
        for symbol in &plan.finished {
            match self.record_for(symbol) {
                Some(record) => info!(
                    "Deep analysis finished: {} score {:.1} from {} {} points, cooling down",
                    symbol,
                    record.report.stability_score,
                    record.report.total_points,
                    record.data_source
                ),
                None => info!("Deep analysis finished: {} (insufficient data), cooling down", symbol),
            }
        }

        join_all(plan.to_poll.iter().map(|symbol| self.poll_symbol(symbol))).await;
        plan.to_poll.len()
    }

    /// Fetch one quote. Failures are logged here and never propagate.
    async fn poll_symbol(&self, symbol: &str) {
        let proxy = self.registry.next();
        match self.venue.fetch_quote(symbol, proxy.as_ref()).await {
            Ok(quote) => {
                let (bid, ask) = quote.bid_ask();
                self.pipeline.on_polled(symbol, bid, ask, now_ms());
            }
            Err(e) => {
                debug!("Poll for {} failed: {}", symbol, e);
                if let Some(proxy) = proxy.as_ref().filter(|_| e.is_proxy_fault()) {
                    warn!("Poll for {} via {} failed: {}", symbol, proxy, e);
                    self.registry.mark_failed(proxy);
                }
            }
        }
    }

    /// Published record for one market, if its chosen window has enough data
    pub fn record_for(&self, symbol: &str) -> Option<AnalysisRecord> {
        let store = self.pipeline.store();
        let polled = store
            .with_window(symbol, TickSource::Polled, |w| w.len())
            .unwrap_or(0);
        let source = select_source(polled, self.config.scheduler.min_polled_points);
        let ticks = store.window_for(symbol, source);
        let report = metrics(symbol, &ticks).ok()?;

        let phase = self.scheduler.phase(symbol);
        Some(AnalysisRecord {
            report,
            data_source: source,
            candidate_score: self.pipeline.board().get(symbol),
            is_analyzing: phase == AnalysisPhase::Analyzing,
            in_cooldown: phase == AnalysisPhase::CoolingDown,
        })
    }

    /// Every market with a usable window, best score first
    pub fn analysis_set(&self) -> Vec<AnalysisRecord> {
        let mut records: Vec<AnalysisRecord> = self
            .pipeline
            .store()
            .symbols()
            .iter()
            .filter_map(|s| self.record_for(s))
            .collect();
        rank(&mut records);
        records
    }

    pub fn history(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.pipeline.store().market(symbol)
    }

    pub fn gauges(&self) -> PipelineGauges {
        PipelineGauges {
            live_connections: self.pool.live_count(),
            abandoned_connections: self.pool.abandoned_count(),
            analyzing: self.scheduler.analyzing_count(),
            cooling_down: self.scheduler.cooldown_count(),
        }
    }

    pub fn status(&self) -> CollectorStatus {
        CollectorStatus {
            markets: self.markets.read().unwrap_or_else(|e| e.into_inner()).len(),
            history_size: self.pipeline.store().len(),
            is_collecting: self.is_collecting(),
            use_proxy: !self.registry.is_empty(),
            proxy_stats: self.registry.stats(),
            connections: self.pool.connections(),
            traffic_stats: self.traffic.snapshot(self.gauges()),
        }
    }
}
