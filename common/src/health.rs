//! Liveness tracking for long-running background loops.
//!
//! The Front-End's and Processor's `/healthz` endpoints perform their own
//! live probes (queue ping, engine probe) at request time; this registry is
//! for the process's internal background tasks (e.g. the Processor's pop
//! loop) to report "I am still making progress" on a schedule, independent
//! of whether any HTTP request happens to arrive.
//!
//! The process as a whole is healthy only if every registered component has
//! reported healthy within its configured deadline.

use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set when a component is newly registered.
    Starting,
    /// Recently reported healthy; stays healthy until this deadline.
    HealthyUntil(std::time::Instant),
    /// Explicitly reported unhealthy.
    Unhealthy,
    /// The `HealthyUntil` deadline was reached without a fresh report.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy; must be called more frequently than `deadline`.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            std::time::Instant::now().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {err}");
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        map.insert(message.component, message.status);
                    }
                    Err(_) => warn!("poisoned HealthRegistry mutex"),
                }
            }
        });

        registry
    }

    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// `true` iff every registered component is currently healthy.
    pub fn healthy(&self) -> bool {
        let mut components = self
            .components
            .write()
            .expect("poisoned HealthRegistry mutex");

        if components.is_empty() {
            return false;
        }

        let now = std::time::Instant::now();
        let mut all_healthy = true;
        for status in components.values_mut() {
            match status {
                ComponentStatus::HealthyUntil(until) if *until > now => {}
                ComponentStatus::HealthyUntil(_) => {
                    *status = ComponentStatus::Stalled;
                    all_healthy = false;
                }
                ComponentStatus::Starting => all_healthy = false,
                ComponentStatus::Unhealthy | ComponentStatus::Stalled => all_healthy = false,
            }
        }
        all_healthy
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
