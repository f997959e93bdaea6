//! Settling the outcome of an attempt.
//!
//! Every attempt ends by moving the job out of `inflight`. The move is a
//! short sequence of store writes:
//!
//! 1. persist the job body, compare-and-swap against the revision the
//!    attempt started from
//! 2. add the id to its next collection
//! 3. release the in-flight entry, fenced by the lease the attempt held
//! 4. delete the body if completed jobs are discarded
//!
//! The in-flight entry goes last, so a settlement cut short at any point
//! leaves the id in `inflight` and the reaper finishes the move from the
//! persisted body. Each stage is recorded as it succeeds, so a settlement
//! interrupted by a store outage resumes where it stopped.

use chrono::{DateTime, Utc};
use queue_core::{
    FailureReason, Job, JobEvent, JobId, JobState, QueueError, Retention, RetryDecision,
    StoreError,
};

use crate::context::QueueContext;

/// New body plus the revision it must replace.
#[derive(Debug, Clone)]
struct Write {
    job: Box<Job>,
    expected: Box<Job>,
}

/// Where the id goes before release.
#[derive(Debug, Clone, Copy)]
enum Destination {
    Nowhere,
    Waiting,
    Scheduled(DateTime<Utc>),
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Persist,
    Index,
    Release,
    Cleanup,
    Done,
}

/// Result of running a settlement to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Every stage completed.
    Settled,
    /// The body moved on since the attempt started; someone else settled the
    /// job first and nothing was written.
    Superseded,
}

/// A pending move of one job out of `inflight`.
#[derive(Debug, Clone)]
pub struct Settlement {
    job_id: JobId,
    lease: DateTime<Utc>,
    write: Option<Write>,
    destination: Destination,
    discard: bool,
    events: Vec<JobEvent>,
    stage: Stage,
}

impl Settlement {
    fn new(job_id: JobId, lease: DateTime<Utc>, destination: Destination) -> Self {
        Self {
            job_id,
            lease,
            write: None,
            destination,
            discard: false,
            events: Vec::new(),
            stage: Stage::Persist,
        }
    }

    fn replacing(mut self, job: Job, expected: Job) -> Self {
        self.write = Some(Write {
            job: Box::new(job),
            expected: Box::new(expected),
        });
        self
    }

    /// The handler succeeded.
    pub fn completed(
        mut job: Job,
        lease: DateTime<Utc>,
        retention: Retention,
        worker_id: &str,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        let expected = job.clone();
        job.complete(now)?;
        let job_id = job.id;
        let mut settlement =
            Self::new(job_id, lease, Destination::Nowhere).replacing(job, expected);
        settlement.discard = retention == Retention::Discard;
        settlement.events.push(JobEvent::JobCompleted {
            job_id,
            worker_id: worker_id.to_string(),
            duration_ms,
            timestamp: now,
        });
        Ok(settlement)
    }

    /// The attempt failed; retry later or dead-letter depending on the policy.
    pub fn failed(
        ctx: &QueueContext,
        mut job: Job,
        lease: DateTime<Utc>,
        reason: &FailureReason,
        now: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        let error = reason.to_string();
        let attempt = job.attempt_count;
        let job_id = job.id;
        let expected = job.clone();

        match ctx.policy.decide(&job) {
            RetryDecision::Retry { delay } => {
                let not_before = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| QueueError::InvalidArgument("retry delay out of range".into()))?;
                job.schedule_retry(error.clone(), not_before, now)?;
                let not_before = job.not_before;
                tracing::warn!(
                    "Job {} attempt {}/{} failed, retrying in {:?}: {}",
                    job_id,
                    attempt,
                    job.max_attempts,
                    delay,
                    error
                );

                let mut settlement = Self::new(job_id, lease, Destination::Scheduled(not_before))
                    .replacing(job, expected);
                settlement.events.push(JobEvent::JobFailed {
                    job_id,
                    error,
                    attempt,
                    will_retry: true,
                    timestamp: now,
                });
                settlement.events.push(JobEvent::JobRetryScheduled {
                    job_id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    not_before,
                    timestamp: now,
                });
                Ok(settlement)
            }
            RetryDecision::DeadLetter => {
                job.dead_letter(error.clone(), now)?;
                tracing::error!(
                    "Job {} dead-lettered after {} attempts: {}",
                    job_id,
                    attempt,
                    error
                );

                let mut settlement =
                    Self::new(job_id, lease, Destination::DeadLetter).replacing(job, expected);
                settlement.events.push(JobEvent::JobFailed {
                    job_id,
                    error: error.clone(),
                    attempt,
                    will_retry: false,
                    timestamp: now,
                });
                settlement.events.push(JobEvent::JobDeadLettered {
                    job_id,
                    error,
                    attempts: attempt,
                    timestamp: now,
                });
                Ok(settlement)
            }
        }
    }

    /// A claimed job whose body can never start an attempt.
    pub fn quarantined(
        mut job: Job,
        lease: DateTime<Utc>,
        detail: String,
        now: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        let expected = job.clone();
        job.quarantine(detail.clone(), now)?;
        let job_id = job.id;
        let attempts = job.attempt_count;

        let mut settlement =
            Self::new(job_id, lease, Destination::DeadLetter).replacing(job, expected);
        settlement.events.push(JobEvent::InvariantViolation {
            job_id,
            detail: detail.clone(),
            timestamp: now,
        });
        settlement.events.push(JobEvent::JobDeadLettered {
            job_id,
            error: detail,
            attempts,
            timestamp: now,
        });
        Ok(settlement)
    }

    /// Finish the move for a body that already left `InFlight`: its
    /// attempt never started or its settlement stopped before the release.
    ///
    /// The body is left as it is; the id is indexed by its state again and
    /// the in-flight entry released. Returns `None` for a body still in flight.
    pub fn resumed(job: &Job, lease: DateTime<Utc>, retention: Retention) -> Option<Self> {
        let destination = match job.state {
            JobState::InFlight => return None,
            JobState::Waiting => Destination::Waiting,
            JobState::Scheduled => Destination::Scheduled(job.not_before),
            JobState::DeadLettered => Destination::DeadLetter,
            JobState::Completed => Destination::Nowhere,
        };
        let mut settlement = Self::new(job.id, lease, destination);
        settlement.discard = job.state == JobState::Completed && retention == Retention::Discard;
        Some(settlement)
    }

    /// An in-flight entry with no body behind it; only the entry is dropped.
    pub fn orphaned(job_id: JobId, lease: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let mut settlement = Self::new(job_id, lease, Destination::Nowhere);
        settlement.events.push(JobEvent::InvariantViolation {
            job_id,
            detail: "in-flight entry without a job body".into(),
            timestamp: now,
        });
        settlement
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Run the remaining stages.
    ///
    /// Transient store errors are retried with the configured backoff; if
    /// they persist the error is returned and the settlement can be run
    /// again later. Events are emitted once every stage has completed.
    pub async fn run(&mut self, ctx: &QueueContext) -> Result<SettleOutcome, StoreError> {
        let store = &ctx.store;
        let job_id = self.job_id;

        if self.stage == Stage::Persist {
            if let Some(Write { job, expected }) = &self.write {
                let persisted = match ctx
                    .retry_store("persist job", || store.replace_job(job, expected))
                    .await
                {
                    Ok(()) => true,
                    Err(StoreError::NotFound(_)) => self.already_persisted(ctx).await?,
                    Err(e) => return Err(e),
                };
                if !persisted {
                    tracing::error!(
                        "Job {} moved on since its attempt under lease {} started; \
                         settlement abandoned",
                        job_id,
                        self.lease
                    );
                    ctx.emit(JobEvent::InvariantViolation {
                        job_id,
                        detail: format!("job settled elsewhere during lease {}", self.lease),
                        timestamp: Utc::now(),
                    });
                    self.stage = Stage::Done;
                    return Ok(SettleOutcome::Superseded);
                }
            }
            self.stage = Stage::Index;
        }

        if self.stage == Stage::Index {
            match self.destination {
                Destination::Nowhere => {}
                Destination::Waiting => {
                    ctx.retry_store("push waiting", || store.push_waiting(job_id))
                        .await?;
                }
                Destination::Scheduled(not_before) => {
                    ctx.retry_store("push scheduled", || {
                        store.push_scheduled(job_id, not_before)
                    })
                    .await?;
                }
                Destination::DeadLetter => {
                    ctx.retry_store("push dead letter", || store.push_dead_letter(job_id))
                        .await?;
                }
            }
            self.stage = Stage::Release;
        }

        if self.stage == Stage::Release {
            let lease = self.lease;
            match ctx
                .retry_store("release in-flight entry", || store.remove_inflight(job_id, lease))
                .await
            {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => {
                    tracing::error!(
                        "In-flight entry for job {} under lease {} was already released",
                        job_id,
                        lease
                    );
                }
                Err(e) => return Err(e),
            }
            self.stage = Stage::Cleanup;
        }

        if self.stage == Stage::Cleanup {
            if self.discard {
                ctx.retry_store("delete job", || store.delete_job(job_id))
                    .await?;
            }
            self.stage = Stage::Done;
            for event in self.events.drain(..) {
                ctx.emit(event);
            }
        }

        Ok(SettleOutcome::Settled)
    }

    /// A retried write may have landed before the error that triggered the
    /// retry; in that case the stored body is already the new revision.
    async fn already_persisted(&self, ctx: &QueueContext) -> Result<bool, StoreError> {
        let Some(write) = &self.write else {
            return Ok(false);
        };
        let stored = ctx
            .retry_store("reload job", || ctx.store.get_job(self.job_id))
            .await?;
        Ok(stored.is_some_and(|stored| stored.same_version(&write.job)))
    }
}
