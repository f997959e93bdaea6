//! Job domain types for work items in the queue.

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::QueueError;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting to be claimed by a worker.
    #[default]
    Waiting,
    /// Job must not run before its `not_before` time.
    Scheduled,
    /// Job is leased by a worker.
    InFlight,
    /// Job completed successfully.
    Completed,
    /// Job exhausted its attempts and awaits operator inspection.
    DeadLettered,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }

    /// Get a simple state string for display and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Scheduled => "scheduled",
            JobState::InFlight => "in_flight",
            JobState::Completed => "completed",
            JobState::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "scheduled" => Ok(JobState::Scheduled),
            "in_flight" => Ok(JobState::InFlight),
            "completed" => Ok(JobState::Completed),
            "dead_lettered" => Ok(JobState::DeadLettered),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// Truncate a timestamp to the millisecond precision every store keeps.
pub fn store_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

/// A job represents a unit of work to be executed by the queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Type of job (used for routing to handlers).
    pub job_type: String,
    /// Opaque payload handed to the handler.
    pub payload: Bytes,
    /// Current state.
    pub state: JobState,
    /// Number of attempts started so far.
    #[serde(default)]
    pub attempt_count: u32,
    /// Maximum number of attempts before dead-lettering.
    pub max_attempts: u32,
    /// The job must not be dispatched before this time.
    pub not_before: DateTime<Utc>,
    /// Set while a worker holds the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job ready to be claimed immediately.
    pub fn new(job_type: impl Into<String>, payload: impl Into<Bytes>, max_attempts: u32) -> Self {
        let now = store_time(Utc::now());
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload: payload.into(),
            state: JobState::Waiting,
            attempt_count: 0,
            max_attempts,
            not_before: now,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Delay the job until `not_before`.
    pub fn scheduled_at(mut self, not_before: DateTime<Utc>) -> Self {
        self.state = JobState::Scheduled;
        self.not_before = store_time(not_before);
        self
    }

    /// Check whether every attempt has been used up.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Sweeper: `Scheduled -> Waiting`.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_state(JobState::Scheduled, JobState::Waiting)?;
        self.state = JobState::Waiting;
        self.updated_at = store_time(now);
        Ok(())
    }

    /// Dispatcher: `Waiting -> InFlight`, consuming one attempt.
    pub fn begin_attempt(
        &mut self,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.expect_state(JobState::Waiting, JobState::InFlight)?;
        if self.attempts_exhausted() {
            return Err(self.invalid(JobState::InFlight));
        }
        self.state = JobState::InFlight;
        self.attempt_count += 1;
        self.lease_expires_at = Some(store_time(lease_expires_at));
        self.updated_at = store_time(now);
        Ok(())
    }

    /// Handler success: `InFlight -> Completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_state(JobState::InFlight, JobState::Completed)?;
        self.state = JobState::Completed;
        self.lease_expires_at = None;
        self.updated_at = store_time(now);
        Ok(())
    }

    /// Recoverable failure: `InFlight -> Scheduled` with a pushed-back `not_before`.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.expect_state(JobState::InFlight, JobState::Scheduled)?;
        self.state = JobState::Scheduled;
        self.lease_expires_at = None;
        self.last_error = Some(error.into());
        self.not_before = store_time(not_before);
        self.updated_at = store_time(now);
        Ok(())
    }

    /// Terminal failure: `InFlight -> DeadLettered`.
    pub fn dead_letter(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.expect_state(JobState::InFlight, JobState::DeadLettered)?;
        self.state = JobState::DeadLettered;
        self.lease_expires_at = None;
        self.last_error = Some(error.into());
        self.updated_at = store_time(now);
        Ok(())
    }

    /// Move a job that can no longer be dispatched straight to `DeadLettered`.
    ///
    /// Used when a claimed body is in a state no attempt can start from.
    pub fn quarantine(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if self.state.is_terminal() {
            return Err(self.invalid(JobState::DeadLettered));
        }
        self.state = JobState::DeadLettered;
        self.lease_expires_at = None;
        self.last_error = Some(error.into());
        self.updated_at = store_time(now);
        Ok(())
    }

    /// Operator recovery: `DeadLettered -> Waiting` with a fresh attempt budget.
    pub fn revive(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_state(JobState::DeadLettered, JobState::Waiting)?;
        let now = store_time(now);
        self.state = JobState::Waiting;
        self.attempt_count = 0;
        self.not_before = now;
        self.updated_at = now;
        Ok(())
    }

    /// Whether `other` is the same revision of this job.
    ///
    /// Every transition changes the state or `updated_at`, so two bodies
    /// agreeing on state, attempts and `updated_at` were never written
    /// over one another. Stores use this for compare-and-swap writes.
    pub fn same_version(&self, other: &Job) -> bool {
        self.id == other.id
            && self.state == other.state
            && self.attempt_count == other.attempt_count
            && self.updated_at == other.updated_at
    }

    /// Summary view used for dead-letter inspection.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            job_type: self.job_type.clone(),
            state: self.state,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            not_before: self.not_before,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn expect_state(&self, from: JobState, to: JobState) -> Result<(), QueueError> {
        if self.state == from {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn invalid(&self, to: JobState) -> QueueError {
        QueueError::InvalidTransition {
            job_id: self.id,
            from: self.state,
            to,
        }
    }
}

/// Lightweight view of a job without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub job_type: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
