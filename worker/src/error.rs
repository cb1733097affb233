use engine_common::queue::QueueError;
use thiserror::Error;

/// Errors from the engine TCP dialog. These map to the job-processing state
/// machine's `EngineError` / `PublishingError` transitions rather than to the
/// engine circuit breaker, except where noted.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Connect-phase failure; counted toward the engine breaker.
    #[error("failed to connect to engine: {0}")]
    Connect(#[from] std::io::Error),
    /// Dialog timeout waiting for `uciok`, `readyok`, or `bestmove`; a
    /// per-job error, not a breaker failure.
    #[error("timed out waiting for {0}")]
    DialogTimeout(&'static str),
    /// Malformed or unexpected protocol line.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// `bestmove` line carried no move token.
    #[error("engine returned an empty best move")]
    EmptyBestMove,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to bind metrics listener: {0}")]
    Bind(#[from] std::io::Error),
}
