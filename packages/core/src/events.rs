//! Event types for observing the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobState};

/// Events emitted by the job queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job was accepted.
    JobEnqueued {
        job_id: JobId,
        job_type: String,
        state: JobState,
        not_before: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A scheduled job became due and moved to waiting.
    JobPromoted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A worker began an attempt.
    JobStarted {
        job_id: JobId,
        worker_id: String,
        attempt: u32,
        lease_expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        worker_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// An attempt failed.
    JobFailed {
        job_id: JobId,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A failed job was scheduled for another attempt.
    JobRetryScheduled {
        job_id: JobId,
        attempt: u32,
        delay_ms: u64,
        not_before: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A job ran out of attempts.
    JobDeadLettered {
        job_id: JobId,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// The reaper found an abandoned lease.
    LeaseExpired {
        job_id: JobId,
        lease_expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// An operator moved a dead-lettered job back to waiting.
    DeadLetterRequeued {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A worker slot is alive.
    WorkerHeartbeat {
        worker_id: String,
        current_job: Option<JobId>,
        timestamp: DateTime<Utc>,
    },
    /// Store state contradicted what a component expected.
    InvariantViolation {
        job_id: JobId,
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobPromoted { timestamp, .. } => *timestamp,
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::JobRetryScheduled { timestamp, .. } => *timestamp,
            JobEvent::JobDeadLettered { timestamp, .. } => *timestamp,
            JobEvent::LeaseExpired { timestamp, .. } => *timestamp,
            JobEvent::DeadLetterRequeued { timestamp, .. } => *timestamp,
            JobEvent::WorkerHeartbeat { timestamp, .. } => *timestamp,
            JobEvent::InvariantViolation { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { job_id, .. } => Some(*job_id),
            JobEvent::JobPromoted { job_id, .. } => Some(*job_id),
            JobEvent::JobStarted { job_id, .. } => Some(*job_id),
            JobEvent::JobCompleted { job_id, .. } => Some(*job_id),
            JobEvent::JobFailed { job_id, .. } => Some(*job_id),
            JobEvent::JobRetryScheduled { job_id, .. } => Some(*job_id),
            JobEvent::JobDeadLettered { job_id, .. } => Some(*job_id),
            JobEvent::LeaseExpired { job_id, .. } => Some(*job_id),
            JobEvent::DeadLetterRequeued { job_id, .. } => Some(*job_id),
            JobEvent::WorkerHeartbeat { current_job, .. } => *current_job,
            JobEvent::InvariantViolation { job_id, .. } => Some(*job_id),
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued { job_id, state, .. } => {
                format!("Job {} enqueued ({})", job_id, state)
            }
            JobEvent::JobPromoted { job_id, .. } => format!("Job {} promoted", job_id),
            JobEvent::JobStarted {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} attempt {} started by {}", job_id, attempt, worker_id),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobFailed {
                job_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job_id, error, retry)
            }
            JobEvent::JobRetryScheduled {
                job_id,
                attempt,
                delay_ms,
                ..
            } => format!(
                "Job {} retrying in {}ms (after attempt {})",
                job_id, delay_ms, attempt
            ),
            JobEvent::JobDeadLettered {
                job_id, attempts, ..
            } => format!("Job {} dead-lettered after {} attempts", job_id, attempts),
            JobEvent::LeaseExpired { job_id, .. } => format!("Job {} lease expired", job_id),
            JobEvent::DeadLetterRequeued { job_id, .. } => {
                format!("Job {} requeued from dead-letter", job_id)
            }
            JobEvent::WorkerHeartbeat { worker_id, .. } => {
                format!("Worker {} heartbeat", worker_id)
            }
            JobEvent::InvariantViolation { job_id, detail, .. } => {
                format!("Job {} invariant violated: {}", job_id, detail)
            }
        }
    }
}
