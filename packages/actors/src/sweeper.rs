//! Sweeper: promotes due scheduled jobs into waiting.

use chrono::{DateTime, Utc};
use queue_core::{JobEvent, JobId, JobState, StoreError};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::context::QueueContext;
use crate::messages::SweeperMessage;

/// Promotion logic, separate from the actor so it can be driven directly.
pub struct Sweeper {
    ctx: QueueContext,
    /// Ids already popped from `scheduled` whose promotion has not finished.
    pending: Vec<JobId>,
    /// Whether the startup re-index has run to completion.
    recovered: bool,
}

impl Sweeper {
    pub fn new(ctx: QueueContext) -> Self {
        Self {
            ctx,
            pending: Vec::new(),
            recovered: false,
        }
    }

    /// Promote every job due at `now`. Returns how many reached waiting.
    ///
    /// Ids already popped are held in memory until their promotion
    /// completes, so an outage midway loses nothing while the process lives.
    /// The first sweep of a process also re-indexes every waiting and
    /// scheduled body, which covers ids lost when an earlier process died
    /// between a body write and its index write.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        if !self.recovered {
            match self.reindex().await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!("Sweeper re-indexed {} waiting and scheduled jobs", count);
                    }
                    self.recovered = true;
                }
                Err(e) => tracing::warn!("Sweep could not re-index jobs, will retry: {}", e),
            }
        }

        let mut due = std::mem::take(&mut self.pending);

        let store = &self.ctx.store;
        match self
            .ctx
            .retry_store("pop due scheduled", || store.pop_due_scheduled(now))
            .await
        {
            Ok(ids) => due.extend(ids),
            Err(e) => tracing::warn!("Sweep could not pop due jobs: {}", e),
        }

        let mut promoted = 0;
        for job_id in due {
            match self.promote(job_id, now).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Promotion of job {} deferred to next sweep: {}", job_id, e);
                    self.pending.push(job_id);
                }
            }
        }

        if promoted > 0 {
            tracing::debug!("Promoted {} scheduled jobs", promoted);
        }
        promoted
    }

    /// Put every waiting and scheduled body back into its collection.
    /// Both pushes are idempotent.
    async fn reindex(&self) -> Result<usize, StoreError> {
        let store = &self.ctx.store;
        let scheduled = self
            .ctx
            .retry_store("scan scheduled jobs", || store.scan_jobs(JobState::Scheduled))
            .await?;
        for job in &scheduled {
            self.ctx
                .retry_store("re-index scheduled", || {
                    store.push_scheduled(job.id, job.not_before)
                })
                .await?;
        }

        let waiting = self
            .ctx
            .retry_store("scan waiting jobs", || store.scan_jobs(JobState::Waiting))
            .await?;
        for job in &waiting {
            self.ctx
                .retry_store("re-index waiting", || store.push_waiting(job.id))
                .await?;
        }
        Ok(scheduled.len() + waiting.len())
    }

    async fn promote(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let store = &self.ctx.store;
        let Some(loaded) = self
            .ctx
            .retry_store("load scheduled job", || store.get_job(job_id))
            .await?
        else {
            tracing::error!("Scheduled job {} has no body; dropping it", job_id);
            self.ctx.emit(JobEvent::InvariantViolation {
                job_id,
                detail: "scheduled entry without a job body".into(),
                timestamp: now,
            });
            return Ok(false);
        };

        match loaded.state {
            JobState::Scheduled => {
                let mut job = loaded.clone();
                if let Err(e) = job.promote(now) {
                    tracing::warn!("Skipping promotion of job {}: {}", job_id, e);
                    return Ok(false);
                }
                match self
                    .ctx
                    .retry_store("persist promotion", || store.replace_job(&job, &loaded))
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::NotFound(_)) => {
                        tracing::debug!("Job {} changed during promotion; skipping", job_id);
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
            // A previous sweep persisted the promotion but never pushed it.
            JobState::Waiting => {}
            other => {
                tracing::warn!("Skipping promotion of job {} in state {}", job_id, other);
                return Ok(false);
            }
        }

        self.ctx
            .retry_store("push waiting", || store.push_waiting(job_id))
            .await?;
        self.ctx.emit(JobEvent::JobPromoted {
            job_id,
            timestamp: now,
        });
        Ok(true)
    }
}

/// Sweeper actor that promotes due jobs on a fixed interval.
pub struct SweeperActor;

impl Actor for SweeperActor {
    type Msg = SweeperMessage;
    type State = Sweeper;
    type Arguments = QueueContext;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        ctx: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let period = ctx.config.sweep_interval();
        tracing::info!("Starting sweeper (every {:?})", period);

        // Start periodic tick
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SweeperMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(Sweeper::new(ctx))
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SweeperMessage::Tick => {
                state.sweep(Utc::now()).await;
            }
            SweeperMessage::SweepNow { reply } => {
                let promoted = state.sweep(Utc::now()).await;
                let _ = reply.send(promoted);
            }
        }
        Ok(())
    }
}
