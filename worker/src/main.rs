//! Processor (Worker): dequeues jobs, negotiates the engine dialog, and
//! publishes results.

mod config;
mod engine_client;
mod error;
mod health;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use engine_common::circuit::CircuitBreaker;
use engine_common::cpu::SuccessCounter;
use engine_common::health::HealthRegistry;
use engine_common::idle::IdleTracker;
use engine_common::metrics::{setup_metrics_recorder, track_metrics};
use engine_common::queue::{QueueClient, RedisQueueClient};
use envconfig::Envconfig;
use tokio::signal;
use tokio::sync::watch;

use config::Config;
use health::HealthState;
use worker::Worker;

const SERVICE: &str = "worker";

async fn wait_for_shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => tracing::info!(service = SERVICE, "received SIGTERM"),
        _ = interrupt.recv() => tracing::info!(service = SERVICE, "received SIGINT"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let queue = RedisQueueClient::new(&config.redis_addr)
        .await
        .expect("failed to connect to queue broker");
    let queue: Arc<dyn QueueClient> = Arc::new(queue);

    let engine_breaker = Arc::new(CircuitBreaker::for_engine());
    let queue_breaker = Arc::new(CircuitBreaker::for_queue(SERVICE));

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker_pop_loop".to_owned(), Duration::from_secs(30))
        .await;

    let idle = IdleTracker::new();
    idle.clone().spawn(SERVICE);

    let successes = SuccessCounter::default();
    engine_common::cpu::spawn(SERVICE, successes.clone());

    let worker = Arc::new(Worker::new(
        config.worker_name.clone(),
        queue.clone(),
        config.engine_addr.clone(),
        engine_breaker,
        queue_breaker,
        worker_liveness,
        idle,
        successes,
        config.max_concurrent_jobs,
        config.poll_timeout.0,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_task = {
        let worker = worker.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    let health_state = HealthState {
        queue: queue.clone(),
        engine_addr: config.engine_addr.clone(),
        worker: worker.clone(),
    };

    let recorder_handle = setup_metrics_recorder();
    let app = Router::new()
        .route("/healthz", get(health::healthz))
        .with_state(health_state)
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics));

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {bind}: {err}"));
    tracing::info!(service = SERVICE, "metrics/health listening on {bind}");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(service = SERVICE, "metrics server error: {err}");
            }
        }
        _ = wait_for_shutdown_signal() => {
            tracing::info!(service = SERVICE, "shutting down gracefully");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(err) = worker_task.await {
        tracing::error!(service = SERVICE, "worker task panicked: {err}");
    }
}
