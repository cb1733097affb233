//! Queue broker client: the only shared mutable resource across processes.
//!
//! `QueueClient` is a thin async trait over the handful of list operations
//! the dispatch pipeline needs (push, blocking pop, range read, remove-by-value,
//! length, liveness). `RedisQueueClient` backs it with a real Redis-compatible
//! broker; `MockQueueClient` is an in-memory double for tests that never touch
//! the network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;

const REDIS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("queue operation timed out")]
    Timeout,
    #[error("queue broker error: {0}")]
    Broker(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Broker(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for QueueError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        QueueError::Timeout
    }
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Push `record` onto the head of `list` (LPUSH-equivalent).
    async fn push(&self, list: &str, record: &str) -> Result<(), QueueError>;

    /// Pop one record from the tail of `list`, blocking up to `timeout`
    /// (BLPOP/BRPOP-equivalent). Returns `None` on timeout, not an error.
    async fn blocking_pop(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Read the full contents of `list` (LRANGE 0 -1-equivalent).
    async fn range(&self, list: &str) -> Result<Vec<String>, QueueError>;

    /// Remove the first occurrence of `record` from `list` (LREM count 1-equivalent).
    /// Returns `true` if a matching record was removed.
    async fn remove_one(&self, list: &str, record: &str) -> Result<bool, QueueError>;

    /// Current length of `list` (LLEN-equivalent).
    async fn length(&self, list: &str) -> Result<u64, QueueError>;

    /// Liveness probe (PING-equivalent).
    async fn ping(&self) -> Result<(), QueueError>;
}

pub struct RedisQueueClient {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisQueueClient {
    pub async fn new(addr: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl QueueClient for RedisQueueClient {
    async fn push(&self, list: &str, record: &str) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let fut = conn.lpush::<_, _, ()>(list, record);
        timeout(REDIS_TIMEOUT, fut).await??;
        Ok(())
    }

    async fn blocking_pop(
        &self,
        list: &str,
        timeout_duration: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection.clone();
        let secs = timeout_duration.as_secs_f64().max(0.01);
        let fut: redis::RedisFuture<Option<(String, String)>> = Box::pin(
            redis::cmd("BRPOP")
                .arg(list)
                .arg(secs)
                .query_async(&mut conn),
        );
        // BLPOP/BRPOP already carries its own server-side timeout; give the
        // client a small grace period on top for network round-trip.
        let result = timeout(timeout_duration + Duration::from_secs(1), fut).await??;
        Ok(result.map(|(_list, value)| value))
    }

    async fn range(&self, list: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.connection.clone();
        let fut = conn.lrange(list, 0, -1);
        Ok(timeout(REDIS_TIMEOUT, fut).await??)
    }

    async fn remove_one(&self, list: &str, record: &str) -> Result<bool, QueueError> {
        let mut conn = self.connection.clone();
        let fut = conn.lrem::<_, _, i64>(list, 1, record);
        let removed = timeout(REDIS_TIMEOUT, fut).await??;
        Ok(removed > 0)
    }

    async fn length(&self, list: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection.clone();
        let fut = conn.llen(list);
        Ok(timeout(REDIS_TIMEOUT, fut).await??)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let fut: redis::RedisFuture<String> =
            Box::pin(redis::cmd("PING").query_async(&mut conn));
        timeout(REDIS_TIMEOUT, fut).await??;
        Ok(())
    }
}

/// In-memory double for `QueueClient`. Lists behave the same way as the real
/// broker (push at head, pop at tail) so tests exercise the same ordering.
#[derive(Clone)]
pub struct MockQueueClient {
    lists: Arc<Mutex<std::collections::HashMap<String, VecDeque<String>>>>,
    healthy: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for MockQueueClient {
    fn default() -> Self {
        Self {
            lists: Arc::new(Mutex::new(std::collections::HashMap::new())),
            healthy: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }
}

impl MockQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn push(&self, list: &str, record: &str) -> Result<(), QueueError> {
        if !self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueueError::Broker("mock queue unhealthy".to_owned()));
        }
        let mut lists = self.lists.lock().await;
        lists.entry(list.to_owned()).or_default().push_front(record.to_owned());
        Ok(())
    }

    async fn blocking_pop(
        &self,
        list: &str,
        timeout_duration: Duration,
    ) -> Result<Option<String>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout_duration;
        loop {
            {
                let mut lists = self.lists.lock().await;
                if let Some(queue) = lists.get_mut(list) {
                    if let Some(value) = queue.pop_back() {
                        return Ok(Some(value));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn range(&self, list: &str) -> Result<Vec<String>, QueueError> {
        let lists = self.lists.lock().await;
        Ok(lists
            .get(list)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_one(&self, list: &str, record: &str) -> Result<bool, QueueError> {
        let mut lists = self.lists.lock().await;
        if let Some(queue) = lists.get_mut(list) {
            if let Some(pos) = queue.iter().position(|item| item == record) {
                queue.remove(pos);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn length(&self, list: &str) -> Result<u64, QueueError> {
        let lists = self.lists.lock().await;
        Ok(lists.get(list).map(|queue| queue.len() as u64).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Broker("mock queue unhealthy".to_owned()))
        }
    }
}
