//! `POST /move`: the dispatch algorithm described in the component design —
//! mint/adopt a correlation id, normalise the request, publish a Job,
//! and poll the results list for the matching JobResult.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine_common::correlation::CorrelationId;
use engine_common::job::{self, Job, JobResult};
use engine_common::retry::{policies, retry_unless_probe, RetryError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEADLINE_PADDING: Duration = Duration::from_millis(5000);

#[derive(Debug, Deserialize)]
struct MoveRequestBody {
    fen: Option<String>,
    elo: Option<i32>,
    movetime_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
struct MoveResponseBody {
    bestmove: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ponder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<String>,
}

fn extract_correlation_id(headers: &HeaderMap) -> CorrelationId {
    headers
        .get("x-correlation-id")
        .and_then(|value| value.to_str().ok())
        .map(CorrelationId::from_header)
        .unwrap_or_else(|| CorrelationId::generate("api"))
}

pub async fn handle_move(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let correlation_id = extract_correlation_id(&headers);
    let start = Instant::now();

    info!(service = crate::SERVICE, correlation_id = %correlation_id, "request started");
    let outcome = dispatch(&state, &correlation_id, &body).await;
    let status = match &outcome {
        Ok(_) => "200",
        Err(ApiError::BadRequest(_)) => "400",
        Err(ApiError::ServiceUnavailable { .. }) => "503",
        Err(ApiError::Timeout(_)) => "408",
        Err(ApiError::Internal(_)) => "500",
    };
    metrics::histogram!("move_request_duration_seconds", "status" => status)
        .record(start.elapsed().as_secs_f64());

    let mut response = match outcome {
        Ok(body) => {
            info!(service = crate::SERVICE, correlation_id = %correlation_id, "request completed");
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            warn!(
                service = crate::SERVICE,
                correlation_id = %correlation_id,
                "request completed with error"
            );
            err.into_response(&correlation_id)
        }
    };

    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

async fn dispatch(
    state: &AppState,
    correlation_id: &CorrelationId,
    body: &[u8],
) -> Result<MoveResponseBody, ApiError> {
    let request: MoveRequestBody = serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid JSON body: {err}")))?;

    let fen = request
        .fen
        .filter(|fen| !fen.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing fen".to_owned()))?;

    let elo = job::normalize_elo(request.elo.unwrap_or(0));
    let movetime_ms = job::normalize_movetime_ms(request.movetime_ms.unwrap_or(0));

    let new_job = Job::new(correlation_id.clone(), fen, elo, movetime_ms);

    publish_job(state, &new_job).await?;

    let deadline = Instant::now() + Duration::from_millis(movetime_ms as u64) + DEADLINE_PADDING;
    let result = poll_for_result(state, &new_job.job_id, deadline).await?;

    if let Some(error) = result.error {
        return Err(ApiError::Timeout(error));
    }

    Ok(MoveResponseBody {
        bestmove: result.bestmove.unwrap_or_default(),
        ponder: result.ponder,
        info: result.info,
    })
}

async fn publish_job(state: &AppState, job: &Job) -> Result<(), ApiError> {
    let attempt = state.queue_breaker.guard().map_err(|_| ApiError::ServiceUnavailable {
        retry_after_seconds: 30,
        failure_count: state.queue_breaker.failure_count(),
    })?;

    let encoded = job
        .encode()
        .map_err(|err| ApiError::Internal(format!("failed to encode job: {err}")))?;

    let (_tx, cancel) = watch::channel(false);
    let queue = state.queue.clone();
    let result = retry_unless_probe(
        &attempt,
        policies::JOB_PUBLISH,
        ("api", "job_publish"),
        &cancel,
        |_attempt| {
            let queue = queue.clone();
            let encoded = encoded.clone();
            async move { queue.push(engine_common::job::JOBS_LIST, &encoded).await }
        },
    )
    .await;

    match result {
        Ok(()) => {
            attempt.succeeded();
            Ok(())
        }
        Err(RetryError::Exhausted(_)) => {
            attempt.failed();
            Err(ApiError::ServiceUnavailable {
                retry_after_seconds: 30,
                failure_count: state.queue_breaker.failure_count(),
            })
        }
        Err(RetryError::Cancelled) => {
            attempt.failed();
            Err(ApiError::Internal("job publish cancelled".to_owned()))
        }
    }
}

async fn poll_for_result(
    state: &AppState,
    job_id: &str,
    deadline: Instant,
) -> Result<JobResult, ApiError> {
    loop {
        if Instant::now() >= deadline {
            return Err(ApiError::Timeout("deadline exceeded waiting for result".to_owned()));
        }

        let records = state
            .queue
            .range(engine_common::job::RESULTS_LIST)
            .await
            .map_err(|err| ApiError::Internal(format!("failed to read results list: {err}")))?;

        for record in records {
            let Ok(candidate) = JobResult::decode(&record) else {
                continue;
            };
            if candidate.job_id != job_id {
                continue;
            }
            if state
                .queue
                .remove_one(engine_common::job::RESULTS_LIST, &record)
                .await
                .unwrap_or(false)
            {
                return Ok(candidate);
            }
            // Another Front-End instance already claimed this exact record;
            // keep scanning rather than returning stale data.
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Direct `OPTIONS /move` handler for bare requests the CORS layer doesn't
/// treat as a preflight (no `Access-Control-Request-Method` header).
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({"error": {"code": "METHOD_NOT_ALLOWED"}})),
    )
}
