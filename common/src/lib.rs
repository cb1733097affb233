//! Shared fault-tolerance kit for the chess analysis dispatch pipeline.
//!
//! This crate holds everything the Front-End (`engine-api`) and Processor
//! (`engine-worker`) both need: the job/result wire types, the queue client
//! abstraction over the broker, the circuit breaker and retry primitives,
//! and the observation plane (metrics, health, CPU/idle samplers).

pub mod circuit;
pub mod correlation;
pub mod cpu;
pub mod health;
pub mod idle;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod replica;
pub mod retry;
