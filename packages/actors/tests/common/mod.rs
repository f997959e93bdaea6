//! Helpers shared by the actor integration tests.
#![allow(dead_code)]

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{JobQueue, QueueContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::{Claim, JobStore, MemoryStore, StoreResult};
use queue_core::{
    Job, JobEvent, JobId, JobState, QueueConfig, QueueDepth, QueueObserver, StoreError, StoreRetry,
};
use tokio::sync::broadcast;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Millisecond-scale timings so scenarios finish quickly.
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        concurrency: 2,
        lease_duration_ms: 2_000,
        base_delay_ms: 10,
        max_delay_ms: 50,
        jitter: 0.0,
        sweep_interval_ms: 10,
        reap_interval_ms: Some(50),
        default_max_attempts: 3,
        claim_timeout_ms: 20,
        stats_interval_ms: 100,
        store_retry: StoreRetry {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..Default::default()
    }
}

/// Records every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<JobEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id() == Some(job_id))
            .collect()
    }
}

impl QueueObserver for RecordingObserver {
    fn on_event(&self, event: &JobEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Context over `store` with a recording observer and no jitter.
pub fn context(
    store: Arc<dyn JobStore>,
    config: QueueConfig,
) -> (QueueContext, Arc<RecordingObserver>) {
    let recorder = Arc::new(RecordingObserver::default());
    let ctx = QueueContext::new(
        store,
        actors::JobHandlerRegistry::new(),
        config,
        recorder.clone(),
    )
    .unwrap();
    (ctx, recorder)
}

pub fn producer(ctx: &QueueContext) -> JobQueue {
    JobQueue::new(ctx.store.clone(), ctx.config.clone(), ctx.observer.clone())
}

/// Receive events for `job_id` until `done` matches one, or time out.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<JobEvent>,
    job_id: JobId,
    done: impl Fn(&JobEvent) -> bool,
) -> Result<Vec<JobEvent>, Box<dyn Error>> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(format!("timed out waiting on job {}; saw {:?}", job_id, seen).into());
            }
        };
        if event.job_id() != Some(job_id) {
            continue;
        }
        let finished = done(&event);
        seen.push(event);
        if finished {
            return Ok(seen);
        }
    }
}

/// Poll the job body until it reaches `state`.
pub async fn wait_for_state(
    queue: &JobQueue,
    job_id: JobId,
    state: JobState,
) -> Result<Job, Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(job) = queue.get_job(job_id).await?
            && job.state == state
        {
            return Ok(job);
        }
        if tokio::time::Instant::now() > deadline {
            return Err(format!("job {} never reached {}", job_id, state).into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Memory store whose body writes (`put_job`, `replace_job`) can be told to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    puts_to_allow: AtomicUsize,
    puts_to_fail: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `allow` more body writes through, then fail the following `fail`.
    pub fn fail_puts(&self, allow: usize, fail: usize) {
        self.puts_to_allow.store(allow, Ordering::SeqCst);
        self.puts_to_fail.store(fail, Ordering::SeqCst);
    }

    fn put_should_fail(&self) -> bool {
        if self
            .puts_to_allow
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.puts_to_fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        if self.put_should_fail() {
            return Err(StoreError::Unavailable("flaky put".into()));
        }
        self.inner.put_job(job).await
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn replace_job(&self, job: &Job, expected: &Job) -> StoreResult<()> {
        if self.put_should_fail() {
            return Err(StoreError::Unavailable("flaky replace".into()));
        }
        self.inner.replace_job(job, expected).await
    }

    async fn scan_jobs(&self, state: JobState) -> StoreResult<Vec<Job>> {
        self.inner.scan_jobs(state).await
    }

    async fn delete_job(&self, id: JobId) -> StoreResult<()> {
        self.inner.delete_job(id).await
    }

    async fn push_waiting(&self, id: JobId) -> StoreResult<()> {
        self.inner.push_waiting(id).await
    }

    async fn push_scheduled(&self, id: JobId, not_before: DateTime<Utc>) -> StoreResult<()> {
        self.inner.push_scheduled(id, not_before).await
    }

    async fn claim_next(
        &self,
        timeout: Duration,
        lease_duration: Duration,
    ) -> StoreResult<Option<Claim>> {
        self.inner.claim_next(timeout, lease_duration).await
    }

    async fn pop_due_scheduled(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        self.inner.pop_due_scheduled(now).await
    }

    async fn remove_inflight(
        &self,
        id: JobId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.remove_inflight(id, lease_expires_at).await
    }

    async fn scan_inflight(&self) -> StoreResult<Vec<(JobId, DateTime<Utc>)>> {
        self.inner.scan_inflight().await
    }

    async fn push_dead_letter(&self, id: JobId) -> StoreResult<()> {
        self.inner.push_dead_letter(id).await
    }

    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<JobId>> {
        self.inner.list_dead_letters(limit).await
    }

    async fn remove_dead_letter(&self, id: JobId) -> StoreResult<()> {
        self.inner.remove_dead_letter(id).await
    }

    async fn depth(&self) -> StoreResult<QueueDepth> {
        self.inner.depth().await
    }
}
