use std::sync::Arc;

use engine_common::circuit::CircuitBreaker;
use engine_common::queue::QueueClient;

use crate::queue_depth::QueueDepthSampler;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueueClient>,
    pub queue_breaker: Arc<CircuitBreaker>,
    pub queue_depth: Arc<QueueDepthSampler>,
    pub cors_allow_origin: String,
}
