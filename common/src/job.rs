//! Wire types exchanged over the queue broker: `Job` (Front-End -> Processor)
//! and `JobResult` (Processor -> Front-End).
//!
//! Both are encoded as self-describing JSON text records so they can be
//! inspected directly in the broker and tolerate field additions across
//! versions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correlation::CorrelationId;

pub const JOBS_LIST: &str = "stockfish:jobs";
pub const RESULTS_LIST: &str = "stockfish:results";

pub const ELO_MIN: i32 = 1320;
pub const ELO_MAX: i32 = 3190;
pub const ELO_DEFAULT: i32 = 1600;
pub const MOVETIME_MS_DEFAULT: i64 = 1000;

/// Clamp a requested Elo into the accepted range, applying the default when
/// the client sent zero (meaning "unspecified").
pub fn normalize_elo(elo: i32) -> i32 {
    if elo == 0 {
        ELO_DEFAULT
    } else {
        elo.clamp(ELO_MIN, ELO_MAX)
    }
}

/// Apply the movetime default when the client sent a non-positive value.
pub fn normalize_movetime_ms(movetime_ms: i64) -> i64 {
    if movetime_ms <= 0 {
        MOVETIME_MS_DEFAULT
    } else {
        movetime_ms
    }
}

#[derive(Error, Debug)]
pub enum JobCodecError {
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A unit of work dispatched from the Front-End to a Processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub correlation_id: CorrelationId,
    pub fen: String,
    pub elo: i32,
    pub movetime_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a new job, stamping `created_at` at the instant of construction
    /// and deriving a job id unique across the process: a monotonic
    /// timestamp suffixed with the requested Elo.
    pub fn new(correlation_id: CorrelationId, fen: String, elo: i32, movetime_ms: i64) -> Self {
        let created_at = Utc::now();
        let job_id = format!("{}-{elo}", created_at.timestamp_nanos_opt().unwrap_or(0));
        Self {
            job_id,
            correlation_id,
            fen,
            elo,
            movetime_ms,
            created_at,
        }
    }

    pub fn encode(&self) -> Result<String, JobCodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(record: &str) -> Result<Self, JobCodecError> {
        Ok(serde_json::from_str(record)?)
    }
}

/// Named elapsed-time phases recorded against a single job's lifecycle.
pub type TimingPhases = HashMap<String, u64>;

/// The outcome of processing a `Job`, published back through the results list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bestmove: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ponder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timings_ms: TimingPhases,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn success(
        job: &Job,
        bestmove: String,
        ponder: Option<String>,
        info: Option<String>,
        timings_ms: TimingPhases,
    ) -> Self {
        Self {
            job_id: job.job_id.clone(),
            correlation_id: job.correlation_id.clone(),
            bestmove: Some(bestmove),
            ponder,
            info,
            error: None,
            timings_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(job: &Job, error: String, timings_ms: TimingPhases) -> Self {
        Self {
            job_id: job.job_id.clone(),
            correlation_id: job.correlation_id.clone(),
            bestmove: None,
            ponder: None,
            info: None,
            error: Some(error),
            timings_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn encode(&self) -> Result<String, JobCodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(record: &str) -> Result<Self, JobCodecError> {
        Ok(serde_json::from_str(record)?)
    }
}
