//! Queue-depth variance sampler: reads `stockfish:jobs` length every 15s,
//! keeps the last 240 samples (60 minutes), and publishes population
//! standard deviation over the 5, 15, and 60 minute sub-windows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use engine_common::job::JOBS_LIST;
use engine_common::queue::QueueClient;
use tokio::sync::RwLock;
use tracing::warn;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);
const RING_CAPACITY: usize = 240;

const WINDOW_5M: usize = 20;
const WINDOW_15M: usize = 60;
const WINDOW_60M: usize = 240;

pub struct QueueDepthSampler {
    samples: RwLock<VecDeque<u64>>,
}

impl QueueDepthSampler {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    pub async fn spawn(self: Arc<Self>, queue: Arc<dyn QueueClient>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                interval.tick().await;
                match queue.length(JOBS_LIST).await {
                    Ok(depth) => {
                        self.record(depth).await;
                        metrics::gauge!("queue_depth").set(depth as f64);
                    }
                    Err(err) => warn!(service = "api", "failed to sample queue depth: {err}"),
                }
            }
        });
    }

    async fn record(&self, depth: u64) {
        let mut samples = self.samples.write().await;
        samples.push_back(depth);
        while samples.len() > RING_CAPACITY {
            samples.pop_front();
        }

        for (window, label) in [(WINDOW_5M, "5m"), (WINDOW_15M, "15m"), (WINDOW_60M, "60m")] {
            let stddev = population_stddev(&samples, window);
            metrics::gauge!("queue_depth_stddev", "window" => label).set(stddev);
        }
    }
}

impl Default for QueueDepthSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Population standard deviation over the most recent `window` samples
/// (fewer if the ring hasn't filled yet). Zero for 0 or 1 samples.
fn population_stddev(samples: &VecDeque<u64>, window: usize) -> f64 {
    let take = window.min(samples.len());
    if take < 2 {
        return 0.0;
    }
    let recent: Vec<f64> = samples.iter().rev().take(take).map(|&v| v as f64).collect();
    let mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let variance = recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / recent.len() as f64;
    variance.sqrt()
}
