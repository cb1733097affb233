//! Replica tracker: polls an external fleet controller for desired replica
//! counts and exposes current/1h-average gauges plus scale event counters.
//!
//! Enabled only when the process runs inside a managed pod fleet (gated by
//! `K8S_NAMESPACE` being set at the call site); the controller itself is an
//! external collaborator, so polling goes through a small `ReplicaSource`
//! trait that production code backs with a real fleet client and tests back
//! with a fixed sequence.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const WINDOW: Duration = Duration::from_secs(2 * 60 * 60);
const AVERAGE_WINDOW: Duration = Duration::from_secs(60 * 60);

#[async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Current desired replica count for `workload` (e.g. `"api"`, `"worker"`, `"engine"`).
    async fn desired_replicas(&self, workload: &str) -> anyhow::Result<u32>;
}

struct Sample {
    at: Instant,
    count: u32,
}

struct WorkloadHistory {
    samples: VecDeque<Sample>,
    last_count: Option<u32>,
}

impl WorkloadHistory {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            last_count: None,
        }
    }

    fn record(&mut self, workload: &str, count: u32) {
        let now = Instant::now();
        self.samples.push_back(Sample { at: now, count });
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        if let Some(previous) = self.last_count {
            if previous != count {
                let direction = if count > previous { "up" } else { "down" };
                metrics::counter!(
                    "replica_scaling_events_total",
                    "workload" => workload.to_owned(),
                    "direction" => direction,
                )
                .increment(1);
            }
        }
        self.last_count = Some(count);

        metrics::gauge!("replica_count_current", "workload" => workload.to_owned())
            .set(f64::from(count));

        let average = self.average_since(now, AVERAGE_WINDOW);
        metrics::gauge!("replica_count_avg_1h", "workload" => workload.to_owned()).set(average);
        if previous_nonzero(&self.samples) {
            metrics::gauge!("replica_count_ratio", "workload" => workload.to_owned())
                .set(f64::from(count) / average.max(1.0));
        }
    }

    fn average_since(&self, now: Instant, window: Duration) -> f64 {
        let relevant: Vec<&Sample> = self
            .samples
            .iter()
            .filter(|sample| now.duration_since(sample.at) <= window)
            .collect();
        if relevant.is_empty() {
            return 0.0;
        }
        let sum: u32 = relevant.iter().map(|sample| sample.count).sum();
        sum as f64 / relevant.len() as f64
    }
}

fn previous_nonzero(samples: &VecDeque<Sample>) -> bool {
    !samples.is_empty()
}

/// Tracks desired replica counts for the named workloads, polling `source`
/// every 30 seconds.
pub struct ReplicaTracker {
    service: &'static str,
    histories: Arc<RwLock<std::collections::HashMap<String, WorkloadHistory>>>,
}

impl ReplicaTracker {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            histories: Arc::new(RwLock::new(std::collections::HashMap::new())),
        }
    }

    /// Spawn the polling loop for `workloads` against `source`. Runs until
    /// the process exits; intended to be started once at startup when
    /// `K8S_NAMESPACE` is set.
    pub fn spawn(self: Arc<Self>, source: Arc<dyn ReplicaSource>, workloads: Vec<String>) {
        {
            let mut histories = self.histories.write().expect("replica tracker lock poisoned");
            for workload in &workloads {
                histories
                    .entry(workload.clone())
                    .or_insert_with(WorkloadHistory::new);
            }
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                for workload in &workloads {
                    match source.desired_replicas(workload).await {
                        Ok(count) => {
                            let mut histories =
                                self.histories.write().expect("replica tracker lock poisoned");
                            histories
                                .entry(workload.clone())
                                .or_insert_with(WorkloadHistory::new)
                                .record(workload, count);
                        }
                        Err(err) => warn!(
                            service = self.service,
                            "failed to poll replica count for {workload}: {err}"
                        ),
                    }
                }
            }
        });
    }
}


/// Production `ReplicaSource`: reads the desired replica count of a
/// Deployment's scale subresource from the in-cluster Kubernetes API server,
/// authenticating with the pod's mounted service account token.
pub struct KubernetesReplicaSource {
    client: reqwest::Client,
    api_server: String,
    namespace: String,
    token: String,
}

impl KubernetesReplicaSource {
    const SERVICE_ACCOUNT_DIR: &'static str = "/var/run/secrets/kubernetes.io/serviceaccount";

    /// Builds a client from the standard in-cluster service account mount
    /// and `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` env vars.
    pub fn from_in_cluster_env(namespace: String) -> anyhow::Result<Self> {
        let token = std::fs::read_to_string(format!("{}/token", Self::SERVICE_ACCOUNT_DIR))?;
        let ca_cert = std::fs::read(format!("{}/ca.crt", Self::SERVICE_ACCOUNT_DIR))?;
        let host = std::env::var("KUBERNETES_SERVICE_HOST")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_owned());

        let client = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca_cert)?)
            .build()?;

        Ok(Self {
            client,
            api_server: format!("https://{host}:{port}"),
            namespace,
            token: token.trim().to_owned(),
        })
    }
}

#[derive(serde::Deserialize)]
struct ScaleSpec {
    replicas: u32,
}

#[derive(serde::Deserialize)]
struct Scale {
    spec: ScaleSpec,
}

#[async_trait]
impl ReplicaSource for KubernetesReplicaSource {
    async fn desired_replicas(&self, workload: &str) -> anyhow::Result<u32> {
        let url = format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{workload}/scale",
            self.api_server, self.namespace
        );
        let scale: Scale = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(scale.spec.replicas)
    }
}

/// Deterministic test double: a fixed, queryable sequence of counts per workload.
#[derive(Default)]
pub struct FixedReplicaSource {
    counts: RwLock<std::collections::HashMap<String, VecDeque<u32>>>,
}

impl FixedReplicaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, workload: &str, count: u32) {
        self.counts
            .write()
            .expect("fixed replica source lock poisoned")
            .entry(workload.to_owned())
            .or_default()
            .push_back(count);
    }
}

#[async_trait]
impl ReplicaSource for FixedReplicaSource {
    async fn desired_replicas(&self, workload: &str) -> anyhow::Result<u32> {
        let mut counts = self.counts.write().expect("fixed replica source lock poisoned");
        match counts.get_mut(workload).and_then(VecDeque::pop_front) {
            Some(count) => Ok(count),
            None => Err(anyhow::anyhow!("no fixed replica count queued for {workload}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_over_window_is_population_mean() {
        let mut history = WorkloadHistory::new();
        let now = Instant::now();
        history.samples.push_back(Sample { at: now, count: 2 });
        history.samples.push_back(Sample { at: now, count: 4 });
        assert_eq!(history.average_since(now, AVERAGE_WINDOW), 3.0);
    }

    #[tokio::test]
    async fn fixed_source_returns_queued_counts_in_order() {
        let source = FixedReplicaSource::new();
        source.push("api", 2);
        source.push("api", 3);
        assert_eq!(source.desired_replicas("api").await.unwrap(), 2);
        assert_eq!(source.desired_replicas("api").await.unwrap(), 3);
        assert!(source.desired_replicas("api").await.is_err());
    }
}
