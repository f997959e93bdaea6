//! Producer-facing queue API.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use db::JobStore;
use queue_core::{
    Job, JobEvent, JobId, JobState, JobSummary, QueueConfig, QueueDepth, QueueError,
    QueueObserver, StoreError,
};

use crate::context::retry_store;

/// Per-job options for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Do not dispatch before `now + delay`.
    pub delay: Duration,
    /// Overrides the configured default attempt budget.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Handle for submitting and inspecting jobs.
///
/// Cheap to clone. Producers do not need a running worker pool; a
/// `JobQueue` over the same store as a [`crate::QueueRuntime`] elsewhere
/// feeds that runtime.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: Arc<QueueConfig>,
    observer: Arc<dyn QueueObserver>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: Arc<QueueConfig>,
        observer: Arc<dyn QueueObserver>,
    ) -> Self {
        Self {
            store,
            config,
            observer,
        }
    }

    /// Accept a job for processing.
    ///
    /// The body is written before the id is indexed. A crash between the two
    /// leaves a body the sweeper re-indexes when it next starts.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: impl Into<Bytes>,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let job_type = job_type.into();
        if job_type.is_empty() {
            return Err(QueueError::InvalidArgument("job type must not be empty".into()));
        }
        let max_attempts = options.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidArgument("max_attempts must be at least 1".into()));
        }
        let out_of_range = || QueueError::InvalidArgument("delay out of range".into());
        let delay = chrono::Duration::from_std(options.delay).map_err(|_| out_of_range())?;

        let mut job = Job::new(job_type, payload, max_attempts);
        if !delay.is_zero() {
            let not_before = job.created_at.checked_add_signed(delay).ok_or_else(out_of_range)?;
            job = job.scheduled_at(not_before);
        }
        let job_id = job.id;

        let store = &self.store;
        let retry = &self.config.store_retry;
        retry_store(retry, "enqueue body", || store.put_job(&job)).await?;

        let indexed = match job.state {
            JobState::Scheduled => {
                let not_before = job.not_before;
                retry_store(retry, "enqueue scheduled", || {
                    store.push_scheduled(job_id, not_before)
                })
                .await
            }
            _ => retry_store(retry, "enqueue waiting", || store.push_waiting(job_id)).await,
        };
        if let Err(e) = indexed {
            // Best effort: the body is unreachable without its index entry.
            let _ = store.delete_job(job_id).await;
            return Err(e.into());
        }

        tracing::debug!("Enqueued job {} ({}) as {}", job_id, job.job_type, job.state);
        self.emit(JobEvent::JobEnqueued {
            job_id,
            job_type: job.job_type.clone(),
            state: job.state,
            not_before: job.not_before,
            timestamp: Utc::now(),
        });

        Ok(job_id)
    }

    /// Load a job by id.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let store = &self.store;
        Ok(retry_store(&self.config.store_retry, "get job", || store.get_job(job_id)).await?)
    }

    /// Oldest dead-lettered jobs first, at most `limit`.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<JobSummary>, QueueError> {
        let store = &self.store;
        let retry = &self.config.store_retry;
        let ids = retry_store(retry, "list dead letters", || store.list_dead_letters(limit)).await?;

        let mut summaries = Vec::with_capacity(ids.len());
        for job_id in ids {
            match retry_store(retry, "get dead letter", || store.get_job(job_id)).await? {
                Some(job) if job.state == JobState::DeadLettered => summaries.push(job.summary()),
                // Left behind by a requeue that stopped before its last step.
                Some(_) => {}
                None => tracing::warn!("Dead-lettered job {} has no body", job_id),
            }
        }
        Ok(summaries)
    }

    /// Give a dead-lettered job a fresh attempt budget and put it back in waiting.
    pub async fn requeue_dead_letter(&self, job_id: JobId) -> Result<(), QueueError> {
        let store = &self.store;
        let retry = &self.config.store_retry;

        let mut job = retry_store(retry, "get dead letter", || store.get_job(job_id))
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        if job.state != JobState::DeadLettered {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Waiting,
            });
        }

        // The body write decides which of two concurrent requeues wins. The
        // dead-letter entry goes last, so a crash midway leaves a waiting
        // body for the sweeper to re-index and a stale entry that listing skips.
        let original = job.clone();
        job.revive(Utc::now())?;
        match retry_store(retry, "persist requeue", || store.replace_job(&job, &original)).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                let current = retry_store(retry, "get dead letter", || store.get_job(job_id))
                    .await?
                    .ok_or(QueueError::NotFound(job_id))?;
                return Err(QueueError::InvalidTransition {
                    job_id,
                    from: current.state,
                    to: JobState::Waiting,
                });
            }
            Err(e) => return Err(e.into()),
        }

        retry_store(retry, "push waiting", || store.push_waiting(job_id)).await?;
        match retry_store(retry, "remove dead letter", || store.remove_dead_letter(job_id)).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Requeued dead-lettered job {}", job_id);
        self.emit(JobEvent::DeadLetterRequeued {
            job_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Count the ids in each collection.
    pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let store = &self.store;
        retry_store(&self.config.store_retry, "depth", || store.depth())
            .await
            .map_err(QueueError::from)
    }

    fn emit(&self, event: JobEvent) {
        self.observer.on_event(&event);
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

