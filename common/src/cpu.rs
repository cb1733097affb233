//! CPU-time sampler: derives CPU-seconds consumed every 10s and maintains
//! the cost-efficiency ratio (successful operations per CPU-second).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::resource::{getrusage, UsageWho};
use tracing::warn;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Cumulative counter of successful operations (requests served, jobs
/// completed) feeding the efficiency ratio's numerator.
#[derive(Clone, Default)]
pub struct SuccessCounter(Arc<AtomicU64>);

impl SuccessCounter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn cumulative_cpu_seconds() -> Option<f64> {
    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let user = usage.user_time();
    let system = usage.system_time();
    Some(
        user.tv_sec() as f64
            + user.tv_usec() as f64 / 1_000_000.0
            + system.tv_sec() as f64
            + system.tv_usec() as f64 / 1_000_000.0,
    )
}

/// Split a fractional `delta` of CPU-seconds into a whole-second count to add
/// to the counter now and a remainder to carry into the next tick. Without
/// this, a delta under 1.0 (the common case at a 10s sample interval) would
/// truncate to zero on every tick and the counter would never advance.
fn accumulate_whole_seconds(delta: f64, carry: &mut f64) -> u64 {
    let total = *carry + delta;
    let whole = total.trunc();
    *carry = total - whole;
    whole as u64
}

/// Spawn the sampler loop. Updates `worker_cpu_seconds_total` (counter) and
/// `cost_efficiency_ratio` (gauge) every 10 seconds for as long as the
/// process runs.
pub fn spawn(service: &'static str, successes: SuccessCounter) {
    tokio::spawn(async move {
        let mut last_cpu_seconds = cumulative_cpu_seconds().unwrap_or(0.0);
        let mut carry = 0.0;
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);

        loop {
            interval.tick().await;

            let Some(cpu_seconds) = cumulative_cpu_seconds() else {
                warn!(service, "failed to read cumulative CPU time");
                continue;
            };

            let delta = (cpu_seconds - last_cpu_seconds).max(0.0);
            last_cpu_seconds = cpu_seconds;

            let whole_seconds = accumulate_whole_seconds(delta, &mut carry);
            if whole_seconds > 0 {
                metrics::counter!("worker_cpu_seconds_total", "service" => service)
                    .increment(whole_seconds);
            }

            let efficiency = if cpu_seconds > 0.0 {
                successes.load() as f64 / cpu_seconds
            } else {
                0.0
            };
            metrics::gauge!("cost_efficiency_ratio", "service" => service).set(efficiency);
        }
    });
}
