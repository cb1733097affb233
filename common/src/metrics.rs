//! Observation plane: a single Prometheus-style metrics registry per process.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Latency buckets spanning 1 ms - 30 s, used for API request histograms.
pub const API_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Latency buckets spanning 1 ms - 120 s, used for end-to-end job processing histograms.
pub const PROCESSING_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 90.0, 120.0,
];

/// Bind a `TcpListener` on `bind` and serve `router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Build the shared Prometheus recorder with the bucket layout used across
/// both processes, and return a `/metrics` router plus the tracking middleware.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Build the shared Prometheus recorder, assigning each histogram the bucket
/// layout matching its own latency range rather than one layout for every
/// histogram in the process.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("move_request_duration_seconds".to_owned()),
            API_LATENCY_BUCKETS,
        )
        .expect("bucket layout is non-empty and sorted")
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_owned()),
            API_LATENCY_BUCKETS,
        )
        .expect("bucket layout is non-empty and sorted")
        .set_buckets_for_metric(
            Matcher::Full("worker_total_processing_seconds".to_owned()),
            PROCESSING_LATENCY_BUCKETS,
        )
        .expect("bucket layout is non-empty and sorted")
        .set_buckets_for_metric(
            Matcher::Full("worker_queue_wait_seconds".to_owned()),
            PROCESSING_LATENCY_BUCKETS,
        )
        .expect("bucket layout is non-empty and sorted")
        .install_recorder()
        .expect("only one recorder is installed per process")
}

/// Axum middleware recording `http_requests_total` and
/// `http_requests_duration_seconds`, labelled by method, matched path, and
/// status code.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
