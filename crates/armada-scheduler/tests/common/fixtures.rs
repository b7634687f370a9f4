//! Test fixtures for scheduler integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use armada_scheduler::{cancel_key, ALLOCATED_CPUS_KEY};
use armada_state::{
    CacheBackend, CacheError, JobId, JobSpec, MemoryCache, MemoryQueue, Message, MessageId,
    QueueBackend, QueueError,
};
use async_trait::async_trait;

/// Runs until killed.
pub const SLEEP_LONG: &str = "sleep 30";

/// Ignores SIGTERM so only SIGKILL stops it.
pub const IGNORES_TERM: &str = "trap '' TERM; while true; do sleep 1; done";

/// Builder for job specs.
pub struct JobBuilder {
    spec: JobSpec,
}

impl JobBuilder {
    /// A job running `true` on the given CPUs.
    pub fn new(cpus: u32) -> Self {
        Self {
            spec: JobSpec::new(cpus, "true"),
        }
    }

    /// Sets the script.
    pub fn script(mut self, script: &str) -> Self {
        self.spec.script = script.to_owned();
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec = self.spec.with_env(key, value);
        self
    }

    /// Sets the time limit.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.spec = self.spec.with_time_limit(limit);
        self
    }

    /// Builds the spec.
    pub fn build(self) -> JobSpec {
        self.spec
    }
}

/// In-memory cache that can be switched into failing every call.
#[derive(Debug, Default)]
pub struct FaultyCache {
    inner: MemoryCache,
    failing: AtomicBool,
    cancel_on_charge: Mutex<Option<JobId>>,
}

impl FaultyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raises `job`'s cancellation flag the next time the allocated counter
    /// is charged, as a canceller racing the promotion would.
    pub fn cancel_on_charge(&self, job: &JobId) {
        *self.cancel_on_charge.lock().unwrap() = Some(job.clone());
    }

    /// The backing cache, bypassing fault injection.
    pub fn inner(&self) -> &MemoryCache {
        &self.inner
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Connection("injected fault".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for FaultyCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check()?;
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn list(
        &self,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), CacheError> {
        self.check()?;
        self.inner.list(prefix, limit, cursor).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.check()?;
        let counter = self.inner.incr_by(key, delta).await?;
        if key == ALLOCATED_CPUS_KEY && delta > 0 {
            let job = self.cancel_on_charge.lock().unwrap().take();
            if let Some(job) = job {
                self.inner.put(&cancel_key(&job), b"1", None).await?;
            }
        }
        Ok(counter)
    }
}

/// In-memory queue whose publishes can be made to fail.
#[derive(Debug, Default)]
pub struct FaultyQueue {
    inner: MemoryQueue,
    failing: AtomicBool,
}

impl FaultyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryQueue {
        &self.inner
    }
}

#[async_trait]
impl QueueBackend for FaultyQueue {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("injected fault".to_owned()));
        }
        self.inner.publish(queue, message).await
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        self.inner.receive(queue, visibility_timeout).await
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        self.inner.ack(queue, message_id).await
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        self.inner.depth(queue).await
    }
}
