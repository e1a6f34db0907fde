//! Query-side HTTP surface
//!
//! Every route answers with a well-formed JSON body, including before any
//! data has been collected.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::domain::now_ms;
use crate::error::{Result, SpreadwatchError};
use crate::services::session::{MonitoringController, StartOutcome};

pub type ApiState = Arc<MonitoringController>;

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(liveness_handler))
        // Analysis
        .route("/api/analysis", get(get_analysis))
        .route("/api/market/:symbol/history", get(get_market_history))
        .route("/api/status", get(get_status))
        // Monitoring session
        .route("/api/monitoring/start", post(start_monitoring))
        .route("/api/monitoring/stop", post(stop_monitoring))
        .route("/api/monitoring/status", get(get_monitoring_status))
        .with_state(state)
        .layer(cors)
}

/// Serve the router until `shutdown` resolves
pub async fn serve<F>(state: ApiState, port: u16, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| SpreadwatchError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn get_analysis(State(state): State<ApiState>) -> impl IntoResponse {
    let data = state.collector().analysis_set();
    Json(json!({
        "success": true,
        "totalMarkets": data.len(),
        "data": data,
        "timestamp": now_ms(),
    }))
}

async fn get_market_history(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let history = state.collector().history(&symbol).unwrap_or_default();
    let count = history.streamed.len() + history.polled.len();
    Json(json!({
        "success": true,
        "symbol": symbol,
        "history": history,
        "count": count,
    }))
}

async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let collector = state.collector().status();
    let monitoring = state.status().await;
    Json(json!({
        "success": true,
        "status": "running",
        "mode": monitoring.mode,
        "markets": collector.markets,
        "historySize": collector.history_size,
        "isCollecting": collector.is_collecting,
        "useProxy": collector.use_proxy,
        "proxyStats": collector.proxy_stats,
        "connections": collector.connections,
        "monitoring": monitoring,
        "trafficStats": collector.traffic_stats,
        "timestamp": now_ms(),
    }))
}

async fn start_monitoring(State(state): State<ApiState>) -> impl IntoResponse {
    let outcome = state.start().await;
    let message = match outcome {
        StartOutcome::Started { .. } => "Hybrid monitoring started",
        StartOutcome::Extended { .. } => "Monitoring extended",
    };
    Json(json!({
        "success": true,
        "message": message,
        "remainingTime": outcome.remaining().as_millis() as u64,
    }))
}

async fn stop_monitoring(State(state): State<ApiState>) -> impl IntoResponse {
    match state.stop().await {
        Ok(()) => Json(json!({ "success": true, "message": "Monitoring stopped" })),
        Err(e) => Json(json!({ "success": false, "message": e.to_string() })),
    }
}

async fn get_monitoring_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status().await;
    let mut body = json!({ "success": true });
    if let (Some(body), Ok(serde_json::Value::Object(fields))) =
        (body.as_object_mut(), serde_json::to_value(&status))
    {
        body.extend(fields);
    }
    Json(body)
}
