//! Idle-percentage sampler: derives `100 * total_idle / uptime` every 10s,
//! clamped to [0, 100].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Accumulates idle time between pop-loop iterations. Idle spans are
/// recorded as they end; the sampler only reads the running total.
#[derive(Clone)]
pub struct IdleTracker {
    total_idle_micros: Arc<AtomicU64>,
    started_at: Instant,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self {
            total_idle_micros: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Record a span of idle time (the gap between the previous pop-loop
    /// iteration ending and this one beginning).
    pub fn record_idle(&self, span: Duration) {
        self.total_idle_micros
            .fetch_add(span.as_micros() as u64, Ordering::Relaxed);
    }

    fn percentage(&self) -> f64 {
        let uptime = self.started_at.elapsed().as_micros() as f64;
        if uptime <= 0.0 {
            return 0.0;
        }
        let idle = self.total_idle_micros.load(Ordering::Relaxed) as f64;
        (100.0 * idle / uptime).clamp(0.0, 100.0)
    }

    /// Spawn the sampler loop, updating `worker_idle_percentage` every 10s.
    pub fn spawn(self, service: &'static str) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                interval.tick().await;
                metrics::gauge!("worker_idle_percentage", "service" => service)
                    .set(self.percentage());
            }
        });
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_clamped_to_unit_range() {
        let tracker = IdleTracker::new();
        tracker.record_idle(Duration::from_secs(3600));
        assert!(tracker.percentage() <= 100.0);
        assert!(tracker.percentage() >= 0.0);
    }

    #[test]
    fn fresh_tracker_reports_near_zero_idle() {
        let tracker = IdleTracker::new();
        assert_eq!(tracker.percentage(), 0.0);
    }
}
