//! Processor main loop: blocking-pop a Job, spawn per-job processing, and
//! track idle time between pops.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use engine_common::circuit::CircuitBreaker;
use engine_common::cpu::SuccessCounter;
use engine_common::health::HealthHandle;
use engine_common::idle::IdleTracker;
use engine_common::job::{Job, JobResult, TimingPhases};
use engine_common::queue::QueueClient;
use engine_common::retry::{policies, retry_unless_probe, RetryError};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::engine_client::EngineClient;

const SERVICE: &str = "worker";

pub struct Worker {
    name: String,
    queue: Arc<dyn QueueClient>,
    engine_addr: String,
    engine_breaker: Arc<CircuitBreaker>,
    queue_breaker: Arc<CircuitBreaker>,
    liveness: HealthHandle,
    idle: IdleTracker,
    successes: SuccessCounter,
    active_jobs: Arc<AtomicI64>,
    semaphore: Arc<Semaphore>,
    pop_timeout: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        queue: Arc<dyn QueueClient>,
        engine_addr: String,
        engine_breaker: Arc<CircuitBreaker>,
        queue_breaker: Arc<CircuitBreaker>,
        liveness: HealthHandle,
        idle: IdleTracker,
        successes: SuccessCounter,
        max_concurrent_jobs: usize,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            name,
            queue,
            engine_addr,
            engine_breaker,
            queue_breaker,
            liveness,
            idle,
            successes,
            active_jobs: Arc::new(AtomicI64::new(0)),
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs)),
            pop_timeout,
        }
    }

    pub fn active_jobs(&self) -> i64 {
        self.active_jobs.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` fires, then stop popping and wait for the active
    /// job count to reach zero (polled at 100ms) up to 30s.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut loop_end = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.liveness.report_healthy().await;

            let popped = tokio::select! {
                result = self.queue.blocking_pop(engine_common::job::JOBS_LIST, self.pop_timeout) => result,
                _ = shutdown.changed() => break,
            };

            let now = Instant::now();
            self.idle.record_idle(now.duration_since(loop_end));
            loop_end = now;

            match popped {
                Ok(Some(record)) => {
                    self.spawn_job(record, shutdown.clone());
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(service = SERVICE, "failed to pop job: {err}");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        self.drain().await;
    }

    async fn drain(&self) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while self.active_jobs() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.active_jobs() > 0 {
            warn!(
                service = SERVICE,
                "drain deadline exceeded with {} active jobs",
                self.active_jobs()
            );
        }
    }

    fn spawn_job(&self, record: String, cancel: watch::Receiver<bool>) {
        let queue = self.queue.clone();
        let engine_addr = self.engine_addr.clone();
        let engine_breaker = self.engine_breaker.clone();
        let queue_breaker = self.queue_breaker.clone();
        let successes = self.successes.clone();
        let active_jobs = self.active_jobs.clone();
        let permit_semaphore = self.semaphore.clone();
        let worker_name = self.name.clone();

        active_jobs.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _permit = permit_semaphore
                .acquire_owned()
                .await
                .expect("semaphore has been closed");

            process_record(
                &record,
                &queue,
                &engine_addr,
                &engine_breaker,
                &queue_breaker,
                &successes,
                &worker_name,
                &cancel,
            )
            .await;

            active_jobs.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_record(
    record: &str,
    queue: &Arc<dyn QueueClient>,
    engine_addr: &str,
    engine_breaker: &CircuitBreaker,
    queue_breaker: &CircuitBreaker,
    successes: &SuccessCounter,
    worker_name: &str,
    cancel: &watch::Receiver<bool>,
) {
    let job = match Job::decode(record) {
        Ok(job) => job,
        Err(err) => {
            error!(service = SERVICE, "failed to decode job record: {err}");
            return;
        }
    };

    let mut timings = TimingPhases::new();
    if let Some(wait_ms) = (Utc::now() - job.created_at).num_milliseconds().try_into().ok() {
        timings.insert("queue_wait".to_owned(), wait_ms);
        metrics::histogram!("worker_queue_wait_seconds").record(wait_ms as f64 / 1000.0);
    }

    info!(
        service = SERVICE,
        correlation_id = %job.correlation_id,
        job_id = %job.job_id,
        "processing job"
    );

    let total_start = Instant::now();
    let outcome = run_job(&job, engine_addr, engine_breaker, &mut timings, cancel).await;

    let elapsed = total_start.elapsed();
    timings.insert("total".to_owned(), elapsed.as_millis() as u64);

    let result = match outcome {
        Ok(bestmove) => {
            successes.increment();
            metrics::counter!("worker_jobs_completed_total", "worker" => worker_name.to_owned())
                .increment(1);
            JobResult::success(&job, bestmove.bestmove, bestmove.ponder, bestmove.info, timings)
        }
        Err(message) => {
            metrics::counter!("worker_jobs_failed_total", "worker" => worker_name.to_owned())
                .increment(1);
            JobResult::failure(&job, message, timings)
        }
    };

    let published = publish_result(&result, queue, queue_breaker, cancel).await;
    if published {
        // Only counts work that actually reached a consumer: a result
        // dropped on breaker-open or retry-exhaustion was not "processing",
        // it was discarded, so it must not inflate this histogram's count.
        metrics::histogram!("worker_total_processing_seconds").record(elapsed.as_secs_f64());
    }
}

async fn run_job(
    job: &Job,
    engine_addr: &str,
    engine_breaker: &CircuitBreaker,
    timings: &mut TimingPhases,
    cancel: &watch::Receiver<bool>,
) -> Result<crate::engine_client::BestMove, String> {
    let connect_start = Instant::now();
    let client = connect_engine(engine_addr, engine_breaker, cancel).await?;
    timings.insert(
        "engine_connect".to_owned(),
        connect_start.elapsed().as_millis() as u64,
    );

    let mut client = client;
    client
        .handshake(job.elo)
        .await
        .map_err(|err| err.to_string())?;
    client
        .set_position(&job.fen)
        .await
        .map_err(|err| err.to_string())?;

    let compute_start = Instant::now();
    let bestmove = client.go(job.movetime_ms).await.map_err(|err| err.to_string())?;
    timings.insert(
        "engine_compute".to_owned(),
        compute_start.elapsed().as_millis() as u64,
    );

    Ok(bestmove)
}

async fn connect_engine(
    engine_addr: &str,
    engine_breaker: &CircuitBreaker,
    cancel: &watch::Receiver<bool>,
) -> Result<EngineClient, String> {
    let attempt = engine_breaker
        .guard()
        .map_err(|_| "engine temporarily unavailable (circuit open)".to_owned())?;

    let addr = engine_addr.to_owned();
    let result = retry_unless_probe(
        &attempt,
        policies::ENGINE_CONNECT,
        ("worker", "engine_connect"),
        cancel,
        |_attempt| {
            let addr = addr.clone();
            async move { EngineClient::connect(&addr).await }
        },
    )
    .await;

    match result {
        Ok(client) => {
            attempt.succeeded();
            Ok(client)
        }
        Err(RetryError::Exhausted(err)) => {
            attempt.failed();
            Err(format!("failed to connect to engine after retries: {err}"))
        }
        Err(RetryError::Cancelled) => {
            attempt.failed();
            Err("engine connect cancelled".to_owned())
        }
    }
}

/// Publish `result` to the results list. Returns whether the result was
/// actually published: `false` covers encode failure, breaker-open, and
/// retry exhaustion, all of which drop the result on the floor.
async fn publish_result(
    result: &JobResult,
    queue: &Arc<dyn QueueClient>,
    queue_breaker: &CircuitBreaker,
    cancel: &watch::Receiver<bool>,
) -> bool {
    let encoded = match result.encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(service = SERVICE, "failed to encode job result: {err}");
            return false;
        }
    };

    let attempt = match queue_breaker.guard() {
        Ok(attempt) => attempt,
        Err(_) => {
            metrics::counter!("worker_result_publish_exhausted_total").increment(1);
            warn!(
                service = SERVICE,
                correlation_id = %result.correlation_id,
                "queue breaker open, dropping result for job {}", result.job_id
            );
            return false;
        }
    };

    let queue = queue.clone();
    let publish_result = retry_unless_probe(
        &attempt,
        policies::RESULT_PUBLISH,
        ("worker", "result_publish"),
        cancel,
        |_attempt| {
            let queue = queue.clone();
            let encoded = encoded.clone();
            async move { queue.push(engine_common::job::RESULTS_LIST, &encoded).await }
        },
    )
    .await;

    match publish_result {
        Ok(()) => {
            attempt.succeeded();
            true
        }
        Err(RetryError::Exhausted(err)) => {
            attempt.failed();
            metrics::counter!("worker_result_publish_exhausted_total").increment(1);
            warn!(
                service = SERVICE,
                correlation_id = %result.correlation_id,
                "result publish exhausted retries for job {}: {err}", result.job_id
            );
            false
        }
        Err(RetryError::Cancelled) => {
            attempt.failed();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_common::circuit::CircuitState;
    use engine_common::correlation::CorrelationId;
    use engine_common::queue::MockQueueClient;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    /// Same stub dialog as `engine_client`'s tests: replies `bestmove`
    /// immediately instead of waiting out `movetime_ms`.
    async fn spawn_stub_engine() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(read_half);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let line = line.trim_end();
                if line == "uci" {
                    write_half.write_all(b"uciok\n").await.unwrap();
                } else if line == "isready" {
                    write_half.write_all(b"readyok\n").await.unwrap();
                } else if line.starts_with("go ") {
                    write_half.write_all(b"bestmove d2d4\n").await.unwrap();
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn process_record_publishes_success_result() {
        let engine_addr = spawn_stub_engine().await;
        let queue: Arc<dyn QueueClient> = Arc::new(MockQueueClient::new());
        let engine_breaker = CircuitBreaker::for_engine();
        let queue_breaker = CircuitBreaker::for_queue("worker");
        let successes = SuccessCounter::default();
        let (_tx, cancel) = watch::channel(false);

        let job = Job::new(CorrelationId::generate("api"), "startpos".to_owned(), 1600, 10);
        let record = job.encode().expect("encode");

        process_record(
            &record,
            &queue,
            &engine_addr,
            &engine_breaker,
            &queue_breaker,
            &successes,
            "worker-test",
            &cancel,
        )
        .await;

        let results = queue.range(engine_common::job::RESULTS_LIST).await.unwrap();
        assert_eq!(results.len(), 1);
        let result = JobResult::decode(&results[0]).expect("decode result");
        assert_eq!(result.job_id, job.job_id);
        assert_eq!(result.bestmove.as_deref(), Some("d2d4"));
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn process_record_publishes_failure_result_when_engine_unreachable() {
        // Nothing is listening on this address, so every connect attempt fails.
        let engine_addr = "127.0.0.1:1".to_owned();
        let queue: Arc<dyn QueueClient> = Arc::new(MockQueueClient::new());
        let engine_breaker = CircuitBreaker::for_engine();
        let queue_breaker = CircuitBreaker::for_queue("worker");
        let successes = SuccessCounter::default();
        let (_tx, cancel) = watch::channel(false);

        let job = Job::new(CorrelationId::generate("api"), "startpos".to_owned(), 1600, 10);
        let record = job.encode().expect("encode");

        process_record(
            &record,
            &queue,
            &engine_addr,
            &engine_breaker,
            &queue_breaker,
            &successes,
            "worker-test",
            &cancel,
        )
        .await;

        let results = queue.range(engine_common::job::RESULTS_LIST).await.unwrap();
        assert_eq!(results.len(), 1);
        let result = JobResult::decode(&results[0]).expect("decode result");
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn publish_result_reports_false_when_breaker_open() {
        let queue: Arc<dyn QueueClient> = Arc::new(MockQueueClient::new());
        let queue_breaker = CircuitBreaker::for_queue("worker");
        queue_breaker.guard().unwrap().failed();
        queue_breaker.guard().unwrap().failed();
        queue_breaker.guard().unwrap().failed();
        assert_eq!(queue_breaker.state(), CircuitState::Open);

        let (_tx, cancel) = watch::channel(false);
        let job = Job::new(CorrelationId::generate("api"), "startpos".to_owned(), 1600, 10);
        let result = JobResult::success(&job, "d2d4".to_owned(), None, None, TimingPhases::new());

        let published = publish_result(&result, &queue, &queue_breaker, &cancel).await;

        assert!(!published, "a dropped result must not be reported as published");
        assert!(queue.range(engine_common::job::RESULTS_LIST).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_result_reports_true_on_success() {
        let queue: Arc<dyn QueueClient> = Arc::new(MockQueueClient::new());
        let queue_breaker = CircuitBreaker::for_queue("worker");
        let (_tx, cancel) = watch::channel(false);
        let job = Job::new(CorrelationId::generate("api"), "startpos".to_owned(), 1600, 10);
        let result = JobResult::success(&job, "d2d4".to_owned(), None, None, TimingPhases::new());

        let published = publish_result(&result, &queue, &queue_breaker, &cancel).await;

        assert!(published);
        assert_eq!(queue.range(engine_common::job::RESULTS_LIST).await.unwrap().len(), 1);
    }
}
