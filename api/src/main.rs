//! Front-End (API): receives HTTP move requests, mints correlation ids,
//! enqueues jobs, and polls the results list for matches.

mod config;
mod error;
mod handlers;
mod queue_depth;
mod shutdown;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use engine_common::circuit::CircuitBreaker;
use engine_common::metrics::{setup_metrics_recorder, track_metrics};
use engine_common::queue::RedisQueueClient;
use engine_common::replica::{KubernetesReplicaSource, ReplicaTracker};
use envconfig::Envconfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use queue_depth::QueueDepthSampler;
use state::AppState;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICE: &str = "api";

/// `tower_http::cors::CorsLayer` answers a preflight `OPTIONS` request
/// itself with a 200, short-circuiting before the router. Preflights carry
/// no body either way, so normalise that to 204 No Content.
async fn normalize_preflight_status(req: Request<Body>, next: Next) -> Response {
    let is_options = req.method() == Method::OPTIONS;
    let mut response = next.run(req).await;
    if is_options && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let queue = RedisQueueClient::new(&config.redis_addr)
        .await
        .expect("failed to connect to queue broker");
    let queue: Arc<dyn engine_common::queue::QueueClient> = Arc::new(queue);

    let queue_breaker = Arc::new(CircuitBreaker::for_queue("api"));

    let queue_depth = Arc::new(QueueDepthSampler::new());
    queue_depth.clone().spawn(queue.clone()).await;

    if let Ok(namespace) = std::env::var("K8S_NAMESPACE") {
        match KubernetesReplicaSource::from_in_cluster_env(namespace) {
            Ok(source) => {
                Arc::new(ReplicaTracker::new(SERVICE)).spawn(
                    Arc::new(source),
                    vec!["api".to_owned(), "worker".to_owned(), "engine".to_owned()],
                );
            }
            Err(err) => tracing::warn!(
                service = SERVICE,
                "K8S_NAMESPACE set but replica tracker init failed: {err}"
            ),
        }
    }

    let cors = if config.cors_allow_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origin = axum::http::HeaderValue::from_str(&config.cors_allow_origin)
            .expect("CORS_ALLOW_ORIGIN must be a valid header value");
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    };

    let state = AppState {
        queue,
        queue_breaker,
        queue_depth,
        cors_allow_origin: config.cors_allow_origin.clone(),
    };

    let recorder_handle = setup_metrics_recorder();
    let app = handlers::add_routes(Router::new())
        .with_state(state)
        .route(
            "/metrics",
            axum::routing::get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(cors)
        .layer(axum::middleware::from_fn(normalize_preflight_status))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics));

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {bind}: {err}"));
    tracing::info!(service = SERVICE, "listening on {bind}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown::wait_for_shutdown_signal());

    match tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(5), server).await {
        Ok(Ok(())) => tracing::info!(service = SERVICE, "server shut down cleanly"),
        Ok(Err(err)) => {
            tracing::error!(service = SERVICE, "server error: {err}");
            std::process::exit(1);
        }
        Err(_) => {
            tracing::warn!(service = SERVICE, "drain deadline exceeded, exiting anyway");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use engine_common::circuit::CircuitBreaker;
    use engine_common::queue::MockQueueClient;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let state = AppState {
            queue: Arc::new(MockQueueClient::new()),
            queue_breaker: Arc::new(CircuitBreaker::for_queue("api")),
            queue_depth: Arc::new(QueueDepthSampler::new()),
            cors_allow_origin: "*".to_owned(),
        };
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::POST, Method::OPTIONS])
            .allow_headers(Any);

        handlers::add_routes(Router::new())
            .with_state(state)
            .layer(cors)
            .layer(axum::middleware::from_fn(normalize_preflight_status))
    }

    #[tokio::test]
    async fn cors_preflight_on_move_returns_no_content() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/move")
            .header(header::ORIGIN, "https://example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = test_app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn bare_options_on_move_without_cors_headers_returns_no_content() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/move")
            .body(Body::empty())
            .unwrap();

        let response = test_app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}

