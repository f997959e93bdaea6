//! Worker actor: one dispatcher slot.
//!
//! A worker claims the head of `waiting`, runs its handler under the lease
//! deadline and settles the outcome. It polls itself, so `concurrency`
//! workers give `concurrency` jobs in flight at most.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use db::Claim;
use futures_util::FutureExt;
use queue_core::{FailureReason, JobEvent, JobId, JobState, StoreError};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::context::QueueContext;
use crate::messages::WorkerMessage;
use crate::settle::{SettleOutcome, Settlement};

/// What one poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing to claim before the claim timeout.
    Idle,
    /// A job was claimed and its attempt settled (or handed to the reaper).
    Processed(JobId),
    /// The store stayed unavailable; back off before polling again.
    StoreDown,
}

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    ctx: QueueContext,
    /// A settlement the store refused; finished before the next claim.
    stranded: Option<Settlement>,
    consecutive_failures: u32,
}

impl WorkerActorState {
    /// Create a new worker actor state.
    pub fn new(worker_id: impl Into<String>, ctx: QueueContext) -> Self {
        Self {
            worker_id: worker_id.into(),
            ctx,
            stranded: None,
            consecutive_failures: 0,
        }
    }

    /// Claim at most one job and process it.
    pub async fn poll(&mut self) -> PollOutcome {
        if let Some(mut settlement) = self.stranded.take() {
            match settlement.run(&self.ctx).await {
                Ok(_) => tracing::info!(
                    "Worker {} finished stranded settlement for job {}",
                    self.worker_id,
                    settlement.job_id()
                ),
                Err(e) => {
                    tracing::warn!(
                        "Worker {} still cannot settle job {}: {}",
                        self.worker_id,
                        settlement.job_id(),
                        e
                    );
                    self.stranded = Some(settlement);
                    return PollOutcome::StoreDown;
                }
            }
        }

        let store = &self.ctx.store;
        let claim_timeout = self.ctx.config.claim_timeout();
        let lease_duration = self.ctx.config.lease_duration();
        let claim = match self
            .ctx
            .retry_store("claim", || store.claim_next(claim_timeout, lease_duration))
            .await
        {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                self.ctx.emit(JobEvent::WorkerHeartbeat {
                    worker_id: self.worker_id.clone(),
                    current_job: None,
                    timestamp: Utc::now(),
                });
                return PollOutcome::Idle;
            }
            Err(e) => {
                tracing::warn!("Worker {} failed to claim: {}", self.worker_id, e);
                return PollOutcome::StoreDown;
            }
        };

        self.process(claim).await
    }

    async fn process(&mut self, claim: Claim) -> PollOutcome {
        let Claim {
            job_id,
            lease_expires_at: lease,
        } = claim;
        let store = &self.ctx.store;

        let loaded = match self.ctx.retry_store("load job", || store.get_job(job_id)).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!("Claimed job {} has no body", job_id);
                let settlement = Settlement::orphaned(job_id, lease, Utc::now());
                return self.settle(settlement).await;
            }
            Err(e) => {
                // The in-flight entry stays behind; the reaper returns it to
                // waiting once the lease runs out.
                tracing::warn!("Worker {} could not load job {}: {}", self.worker_id, job_id, e);
                return PollOutcome::StoreDown;
            }
        };

        if loaded.state != JobState::Waiting {
            // Another owner is still settling this job. The reaper finishes
            // the move once our lease runs out.
            tracing::warn!(
                "Claimed job {} is {}, not waiting; leaving it to the reaper",
                job_id,
                loaded.state
            );
            return PollOutcome::Processed(job_id);
        }

        let now = Utc::now();
        let mut job = loaded.clone();
        if let Err(e) = job.begin_attempt(lease, now) {
            tracing::error!("Claimed job {} cannot start an attempt: {}", job_id, e);
            return match Settlement::quarantined(loaded, lease, e.to_string(), now) {
                Ok(settlement) => self.settle(settlement).await,
                Err(e) => {
                    tracing::error!("Job {} left in flight for the reaper: {}", job_id, e);
                    PollOutcome::Processed(job_id)
                }
            };
        }

        match self
            .ctx
            .retry_store("persist attempt", || store.replace_job(&job, &loaded))
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(
                    "Job {} changed before worker {} could start it; leaving it to the reaper",
                    job_id,
                    self.worker_id
                );
                return PollOutcome::Processed(job_id);
            }
            Err(e) => {
                tracing::warn!(
                    "Worker {} could not record attempt for job {}: {}",
                    self.worker_id,
                    job_id,
                    e
                );
                return PollOutcome::StoreDown;
            }
        }

        tracing::debug!(
            "Worker {} started job {} ({}) attempt {}/{}",
            self.worker_id,
            job_id,
            job.job_type,
            job.attempt_count,
            job.max_attempts
        );
        self.ctx.emit(JobEvent::JobStarted {
            job_id,
            worker_id: self.worker_id.clone(),
            attempt: job.attempt_count,
            lease_expires_at: lease,
            timestamp: now,
        });

        let started = Instant::now();
        let result = self.execute(&job.job_type, job.payload.clone(), lease).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let now = Utc::now();

        let settlement = match result {
            Ok(()) => {
                tracing::info!(
                    "Job {} completed by {} in {}ms",
                    job_id,
                    self.worker_id,
                    duration_ms
                );
                Settlement::completed(
                    job,
                    lease,
                    self.ctx.config.retention,
                    &self.worker_id,
                    duration_ms,
                    now,
                )
            }
            Err(reason) => Settlement::failed(&self.ctx, job, lease, &reason, now),
        };

        match settlement {
            Ok(settlement) => self.settle(settlement).await,
            Err(e) => {
                tracing::error!("Job {} changed state under its worker: {}", job_id, e);
                PollOutcome::Processed(job_id)
            }
        }
    }

    /// Run the handler with the lease as its deadline.
    async fn execute(
        &self,
        job_type: &str,
        payload: bytes::Bytes,
        lease: DateTime<Utc>,
    ) -> Result<(), FailureReason> {
        let Some(handler) = self.ctx.handlers.get(job_type) else {
            return Err(FailureReason::NoHandler(job_type.to_string()));
        };

        let remaining = (lease - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let run = AssertUnwindSafe(handler.handle(payload)).catch_unwind();

        match tokio::time::timeout(remaining, run).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => Err(FailureReason::Handler(error)),
            Ok(Err(panic)) => Err(FailureReason::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(FailureReason::DeadlineExceeded),
        }
    }

    async fn settle(&mut self, mut settlement: Settlement) -> PollOutcome {
        let job_id = settlement.job_id();
        match settlement.run(&self.ctx).await {
            Ok(SettleOutcome::Settled) | Ok(SettleOutcome::Superseded) => {
                PollOutcome::Processed(job_id)
            }
            Err(e) => {
                tracing::warn!(
                    "Worker {} could not settle job {}, will retry: {}",
                    self.worker_id,
                    job_id,
                    e
                );
                self.stranded = Some(settlement);
                PollOutcome::StoreDown
            }
        }
    }

    /// Pause after the store failed, growing with consecutive failures.
    fn backoff(&mut self, outcome: PollOutcome) -> Option<Duration> {
        if outcome == PollOutcome::StoreDown {
            self.consecutive_failures += 1;
            Some(
                self.ctx
                    .config
                    .store_retry
                    .delay_after(self.consecutive_failures),
            )
        } else {
            self.consecutive_failures = 0;
            None
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub ctx: QueueContext,
}

/// Worker actor that executes jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState::new(args.worker_id, args.ctx))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                let outcome = state.poll().await;
                if let Some(pause) = state.backoff(outcome) {
                    tokio::time::sleep(pause).await;
                }
                myself.send_message(WorkerMessage::Poll)?;
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(settlement) = &state.stranded {
            tracing::warn!(
                "Worker {} stopped with job {} unsettled; it stays in flight for the reaper",
                state.worker_id,
                settlement.job_id()
            );
        }
        tracing::info!("Worker stopped: {}", state.worker_id);
        Ok(())
    }
}
