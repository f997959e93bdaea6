//! Reaper: recovers jobs whose lease expired without a settlement.

use chrono::{DateTime, Utc};
use queue_core::{FailureReason, JobEvent, JobState};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::context::QueueContext;
use crate::messages::ReaperMessage;
use crate::settle::{SettleOutcome, Settlement};

/// Lease recovery logic, separate from the actor so it can be driven directly.
///
/// Holds no state between scans: a recovery the store interrupts leaves the
/// entry in `inflight`, and the next scan picks it up from the persisted body.
pub struct Reaper {
    ctx: QueueContext,
}

impl Reaper {
    pub fn new(ctx: QueueContext) -> Self {
        Self { ctx }
    }

    /// Recover every in-flight entry whose lease expired before `now`.
    /// Returns how many jobs were moved out of in-flight.
    pub async fn reap(&mut self, now: DateTime<Utc>) -> usize {
        let store = self.ctx.store.clone();
        let entries = match self
            .ctx
            .retry_store("scan in-flight", || store.scan_inflight())
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Reap could not scan in-flight jobs: {}", e);
                return 0;
            }
        };

        let mut recovered = 0;
        for (job_id, lease) in entries {
            if lease >= now {
                continue;
            }

            let job = match self
                .ctx
                .retry_store("load expired job", || store.get_job(job_id))
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!("Reap could not load job {}: {}", job_id, e);
                    continue;
                }
            };

            let mut settlement = match job {
                None => {
                    tracing::error!("In-flight job {} has no body; dropping the entry", job_id);
                    Settlement::orphaned(job_id, lease, now)
                }
                Some(job) if job.state == JobState::InFlight => {
                    if job.lease_expires_at.is_some_and(|at| at >= now) {
                        // A newer attempt holds a live lease on the body.
                        tracing::debug!("Job {} is running under a newer lease", job_id);
                        continue;
                    }
                    tracing::warn!(
                        "Lease expired for job {} (attempt {}/{})",
                        job_id,
                        job.attempt_count,
                        job.max_attempts
                    );
                    self.ctx.emit(JobEvent::LeaseExpired {
                        job_id,
                        lease_expires_at: lease,
                        timestamp: now,
                    });
                    let reason = FailureReason::LeaseExpired;
                    match Settlement::failed(&self.ctx, job, lease, &reason, now) {
                        Ok(settlement) => settlement,
                        Err(e) => {
                            tracing::error!("Cannot fail expired job {}: {}", job_id, e);
                            continue;
                        }
                    }
                }
                Some(job) => {
                    tracing::warn!(
                        "Expired entry for job {} left behind in state {}; finishing the move",
                        job_id,
                        job.state
                    );
                    match Settlement::resumed(&job, lease, self.ctx.config.retention) {
                        Some(settlement) => settlement,
                        None => continue,
                    }
                }
            };

            match settlement.run(&self.ctx).await {
                Ok(SettleOutcome::Settled) => recovered += 1,
                Ok(SettleOutcome::Superseded) => {}
                Err(e) => tracing::warn!(
                    "Reaper could not settle job {}, will retry next scan: {}",
                    job_id,
                    e
                ),
            }
        }

        if recovered > 0 {
            tracing::info!("Reaper recovered {} jobs", recovered);
        }
        recovered
    }
}

/// Reaper actor that scans in-flight leases on a fixed interval.
pub struct ReaperActor;

impl Actor for ReaperActor {
    type Msg = ReaperMessage;
    type State = Reaper;
    type Arguments = QueueContext;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        ctx: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let period = ctx.config.reap_interval();
        tracing::info!("Starting reaper (every {:?})", period);

        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if myself_clone.send_message(ReaperMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(Reaper::new(ctx))
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ReaperMessage::Tick => {
                state.reap(Utc::now()).await;
            }
            ReaperMessage::ReapNow { reply } => {
                let recovered = state.reap(Utc::now()).await;
                let _ = reply.send(recovered);
            }
        }
        Ok(())
    }
}
