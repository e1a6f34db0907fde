//! Process-wide monitoring session
//!
//! Collection only runs inside a session. Starting an active session
//! extends it; a one-shot timer stops it when it expires. Start and stop
//! hold the state lock for their whole duration so they never interleave.
//! Readers go through a separate view that is updated on every transition,
//! so a status request never waits on a stop in progress.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info};

use crate::collector::HybridCollector;
use crate::error::{Result, SpreadwatchError};
use crate::services::metrics::TrafficSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { remaining: Duration },
    /// Session was already active; its expiry was pushed out
    Extended { remaining: Duration },
}

impl StartOutcome {
    pub fn remaining(&self) -> Duration {
        match *self {
            StartOutcome::Started { remaining } | StartOutcome::Extended { remaining } => remaining,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatus {
    pub is_active: bool,
    pub start_time: Option<DateTime<Utc>>,
    /// Milliseconds until expiry, never negative
    pub remaining_time: u64,
    pub is_collecting: bool,
    pub mode: &'static str,
    pub analyzing: Vec<String>,
    pub cooldown_count: usize,
    pub traffic_stats: TrafficSnapshot,
}

/// Lifecycle fields, written only while the session lock is held
#[derive(Debug, Clone, Copy, Default)]
struct SessionView {
    active: bool,
    started_at: Option<DateTime<Utc>>,
    expires_at: Option<Instant>,
}

impl SessionView {
    fn remaining(&self) -> Duration {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct SessionState {
    view: SessionView,
    expiry: Option<JoinHandle<()>>,
    /// Bumped on every arm so a superseded timer can tell it lost
    generation: u64,
}

pub struct MonitoringController {
    collector: Arc<HybridCollector>,
    duration: Duration,
    state: Mutex<SessionState>,
    view: RwLock<SessionView>,
}

impl MonitoringController {
    pub fn new(collector: Arc<HybridCollector>, duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            collector,
            duration,
            state: Mutex::new(SessionState::default()),
            view: RwLock::new(SessionView::default()),
        })
    }

    pub fn collector(&self) -> &Arc<HybridCollector> {
        &self.collector
    }

    pub async fn start(self: &Arc<Self>) -> StartOutcome {
        let mut state = self.state.lock().await;

        if state.view.active {
            self.arm_expiry(&mut state);
            let remaining = state.view.remaining();
            info!("Monitoring extended, {}s remaining", remaining.as_secs());
            return StartOutcome::Extended { remaining };
        }

        info!("Monitoring started for {}s", self.duration.as_secs());
        self.collector.start_collection();
        state.view.active = true;
        state.view.started_at = Some(Utc::now());
        self.arm_expiry(&mut state);
        StartOutcome::Started {
            remaining: state.view.remaining(),
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(timer) = state.expiry.take() {
            timer.abort();
        }
        self.shutdown(&mut state).await
    }

    pub async fn is_active(&self) -> bool {
        self.view().active
    }

    pub async fn status(&self) -> MonitoringStatus {
        let view = self.view();
        let scheduler = self.collector.scheduler();
        MonitoringStatus {
            is_active: view.active,
            start_time: view.started_at,
            remaining_time: if view.active {
                view.remaining().as_millis() as u64
            } else {
                0
            },
            is_collecting: self.collector.is_collecting(),
            mode: "hybrid",
            analyzing: scheduler.analyzing(),
            cooldown_count: scheduler.cooldown_count(),
            traffic_stats: self.collector.traffic().snapshot(self.collector.gauges()),
        }
    }

    fn view(&self) -> SessionView {
        *self.view.read().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &SessionState) {
        *self.view.write().unwrap_or_else(|e| e.into_inner()) = state.view;
    }

    /// (Re)arm the one-shot expiry timer, cancelling the previous one
    fn arm_expiry(self: &Arc<Self>, state: &mut SessionState) {
        if let Some(timer) = state.expiry.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let deadline = Instant::now() + self.duration;
        state.view.expires_at = Some(deadline);
        self.publish(state);

        let controller: Weak<Self> = Arc::downgrade(self);
        state.expiry = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(controller) = controller.upgrade() {
                controller.expire(generation).await;
            }
        }));
    }

    async fn expire(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if !state.view.active || state.generation != generation {
            return;
        }
        info!("Monitoring session expired");
        // this task is the timer; drop its handle without aborting ourselves
        state.expiry = None;
        if let Err(e) = self.shutdown(&mut state).await {
            error!("Failed to stop expired session: {}", e);
        }
    }

    async fn shutdown(&self, state: &mut SessionState) -> Result<()> {
        if !state.view.active {
            return Err(SpreadwatchError::NotRunning);
        }

        self.collector.stop_collection().await;
        if let Err(e) = self.collector.save_snapshot().await {
            error!("Failed to save snapshot on stop: {}", e);
        }

        state.view = SessionView::default();
        self.publish(state);
        info!("Monitoring stopped");
        Ok(())
    }
}
