use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use engine_common::job::JOBS_LIST;
use serde_json::json;

use crate::state::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let ping = tokio::time::timeout(PROBE_TIMEOUT, state.queue.ping()).await;

    match ping {
        Ok(Ok(())) => {
            let queue_depth = state.queue.length(JOBS_LIST).await.unwrap_or(0);
            (
                StatusCode::OK,
                Json(json!({
                    "status": "healthy",
                    "redis_connected": true,
                    "queue_depth": queue_depth,
                    "timestamp": Utc::now(),
                })),
            )
        }
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "redis_connected": false,
                "queue_depth": 0,
                "timestamp": Utc::now(),
            })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use engine_common::circuit::CircuitBreaker;
    use engine_common::queue::MockQueueClient;

    fn test_state(queue: MockQueueClient) -> AppState {
        AppState {
            queue: std::sync::Arc::new(queue),
            queue_breaker: std::sync::Arc::new(CircuitBreaker::for_queue("api")),
            queue_depth: std::sync::Arc::new(crate::queue_depth::QueueDepthSampler::new()),
            cors_allow_origin: "*".to_owned(),
        }
    }

    #[tokio::test]
    async fn healthy_queue_reports_200() {
        let state = test_state(MockQueueClient::new());
        let response = healthz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unreachable_queue_reports_503() {
        let mock = MockQueueClient::new();
        mock.set_healthy(false);
        let state = test_state(mock);
        let response = healthz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
