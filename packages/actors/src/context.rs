//! Shared state handed to every actor.

use std::future::Future;
use std::sync::Arc;

use db::{JobStore, StoreResult};
use queue_core::{JobEvent, QueueConfig, QueueError, QueueObserver, RetryPolicy, StoreRetry};

use crate::handler::JobHandlerRegistry;

/// Everything a worker, sweeper or reaper needs to do its job.
#[derive(Clone)]
pub struct QueueContext {
    pub store: Arc<dyn JobStore>,
    pub handlers: Arc<JobHandlerRegistry>,
    pub config: Arc<QueueConfig>,
    pub policy: RetryPolicy,
    pub observer: Arc<dyn QueueObserver>,
}

impl QueueContext {
    /// Validate `config` and bundle the pieces together.
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: JobHandlerRegistry,
        config: QueueConfig,
        observer: Arc<dyn QueueObserver>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            store,
            handlers: Arc::new(handlers),
            policy: RetryPolicy::from_config(&config),
            config: Arc::new(config),
            observer,
        })
    }

    /// Replace the retry policy (tests use a jitter-free one).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn emit(&self, event: JobEvent) {
        self.observer.on_event(&event);
    }

    /// Run a store operation, retrying transient failures with backoff.
    pub async fn retry_store<T, F, Fut>(&self, what: &str, op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        retry_store(&self.config.store_retry, what, op).await
    }
}

/// Retry `op` while it reports [`queue_core::StoreError::Unavailable`].
///
/// `NotFound` is a definitive answer and is returned immediately. After
/// `max_attempts` tries the last transient error is returned.
pub async fn retry_store<T, F, Fut>(retry: &StoreRetry, what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.delay_after(attempt);
                tracing::warn!(
                    "Retrying {} after attempt {} in {:?}: {}",
                    what,
                    attempt,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> StoreRetry {
        StoreRetry {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_store(&fast(), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("down".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: StoreResult<()> = retry_store(&fast(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let id = queue_core::JobId::new();
        let result: StoreResult<()> = retry_store(&fast(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound(id))
        })
        .await;

        assert_eq!(result, Err(StoreError::NotFound(id)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
