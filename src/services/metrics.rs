use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::info;

/// Traffic counters shared by the transport, the stream pool and ingestion
#[derive(Debug, Default)]
pub struct TrafficStats {
    /// Bytes received over streaming connections
    pub stream_bytes_received: AtomicU64,
    /// Bytes sent over streaming connections (subscribe requests)
    pub stream_bytes_sent: AtomicU64,
    /// Push messages received
    pub stream_messages: AtomicU64,
    /// Bytes received from polling requests
    pub poll_bytes_received: AtomicU64,
    /// Completed polling requests
    pub poll_requests: AtomicU64,
    /// Ticks dropped at ingestion for invalid prices
    pub ignored_ticks: AtomicU64,
    /// Reconnect attempts scheduled across all connections
    pub reconnects: AtomicU64,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

/// Live gauges owned by other components, folded into the snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineGauges {
    pub live_connections: usize,
    pub abandoned_connections: usize,
    pub analyzing: usize,
    pub cooling_down: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub stream_bytes_received: u64,
    pub stream_bytes_sent: u64,
    pub stream_messages: u64,
    pub poll_bytes_received: u64,
    pub poll_requests: u64,
    pub ignored_ticks: u64,
    pub reconnects: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub total_bytes_received: u64,
    /// Seconds since the counters were reset
    pub duration: f64,
    pub bytes_per_second: f64,
    pub live_connections: usize,
    pub abandoned_connections: usize,
    pub analyzing: usize,
    pub cooldown_count: usize,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter and restart the clock
    pub fn reset(&self) {
        for counter in [
            &self.stream_bytes_received,
            &self.stream_bytes_sent,
            &self.stream_messages,
            &self.poll_bytes_received,
            &self.poll_requests,
            &self.ignored_ticks,
            &self.reconnects,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.started_at.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    pub fn record_stream_message(&self, bytes: usize) {
        self.stream_messages.fetch_add(1, Ordering::Relaxed);
        self.stream_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_stream_sent(&self, bytes: usize) {
        self.stream_bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_poll_response(&self, bytes: usize) {
        self.poll_requests.fetch_add(1, Ordering::Relaxed);
        self.poll_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_ignored_ticks(&self) {
        self.ignored_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, gauges: PipelineGauges) -> TrafficSnapshot {
        let start_time = *self.started_at.read().unwrap_or_else(|e| e.into_inner());
        let duration = start_time
            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);

        let stream_bytes_received = self.stream_bytes_received.load(Ordering::Relaxed);
        let poll_bytes_received = self.poll_bytes_received.load(Ordering::Relaxed);
        let total_bytes_received = stream_bytes_received + poll_bytes_received;

        TrafficSnapshot {
            stream_bytes_received,
            stream_bytes_sent: self.stream_bytes_sent.load(Ordering::Relaxed),
            stream_messages: self.stream_messages.load(Ordering::Relaxed),
            poll_bytes_received,
            poll_requests: self.poll_requests.load(Ordering::Relaxed),
            ignored_ticks: self.ignored_ticks.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            start_time,
            total_bytes_received,
            duration,
            bytes_per_second: if duration > 0.0 {
                total_bytes_received as f64 / duration
            } else {
                0.0
            },
            live_connections: gauges.live_connections,
            abandoned_connections: gauges.abandoned_connections,
            analyzing: gauges.analyzing,
            cooldown_count: gauges.cooling_down,
        }
    }

    /// One-line traffic summary for the periodic log
    pub fn log_summary(&self, gauges: PipelineGauges) {
        let snap = self.snapshot(gauges);
        info!(
            "Traffic: stream {:.1}KB + poll {:.1}KB = {:.1}KB | analyzing {}, cooling down {}, live connections {}",
            snap.stream_bytes_received as f64 / 1024.0,
            snap.poll_bytes_received as f64 / 1024.0,
            snap.total_bytes_received as f64 / 1024.0,
            snap.analyzing,
            snap.cooldown_count,
            snap.live_connections,
        );
    }
}
