//! `GET /healthz` for the Processor: live `uci` probe against the engine,
//! capped at 2s, alongside queue connectivity and the current active-job count.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use engine_common::queue::QueueClient;
use serde_json::json;

use crate::engine_client::EngineClient;
use crate::worker::Worker;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct HealthState {
    pub queue: Arc<dyn QueueClient>,
    pub engine_addr: String,
    pub worker: Arc<Worker>,
}

async fn probe_engine(engine_addr: &str) -> bool {
    let probe = async {
        let mut client = EngineClient::connect(engine_addr).await.ok()?;
        client.handshake(0).await.ok()?;
        Some(())
    };
    matches!(tokio::time::timeout(PROBE_TIMEOUT, probe).await, Ok(Some(())))
}

pub async fn healthz(State(state): State<HealthState>) -> impl IntoResponse {
    let redis_connected = tokio::time::timeout(PROBE_TIMEOUT, state.queue.ping())
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
    let stockfish_healthy = probe_engine(&state.engine_addr).await;

    let status = if redis_connected && stockfish_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "redis_connected": redis_connected,
            "stockfish_healthy": stockfish_healthy,
            "current_jobs": state.worker.active_jobs(),
            "timestamp": Utc::now(),
        })),
    )
}
