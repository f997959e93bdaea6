//! The ordered store contract every backend implements.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{Job, JobId, JobState, QueueDepth, StoreError};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A successful claim on the head of the waiting collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub job_id: JobId,
    /// Score of the in-flight entry. Also the fencing token for `remove_inflight`.
    pub lease_expires_at: DateTime<Utc>,
}

/// Job bodies plus the ordered collections that index them.
///
/// Layout:
/// - `job` bodies keyed by id
/// - `waiting`, FIFO
/// - `scheduled`, scored by `not_before`
/// - `inflight`, scored by `lease_expires_at`
/// - `dead_letter`, ordered by arrival
///
/// Cross-worker coordination relies only on the atomicity of `claim_next`,
/// `pop_due_scheduled`, `remove_inflight` and `replace_job`, never on
/// process-local locks, so several processes may share one store. Any call
/// may fail with [`StoreError::Unavailable`].
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert or overwrite a job body.
    async fn put_job(&self, job: &Job) -> StoreResult<()>;

    /// Load a job body.
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Overwrite a job body only if the stored one is still the revision
    /// `expected` (see [`Job::same_version`]).
    ///
    /// Fails with [`StoreError::NotFound`] if the body is missing or has moved on.
    async fn replace_job(&self, job: &Job, expected: &Job) -> StoreResult<()>;

    /// Every job body currently in `state`, oldest first.
    async fn scan_jobs(&self, state: JobState) -> StoreResult<Vec<Job>>;

    /// Delete a job body. Deleting a missing body is not an error.
    async fn delete_job(&self, id: JobId) -> StoreResult<()>;

    /// Append an id to the waiting collection.
    async fn push_waiting(&self, id: JobId) -> StoreResult<()>;

    /// Insert an id into the scheduled collection, scored by `not_before`.
    async fn push_scheduled(&self, id: JobId, not_before: DateTime<Utc>) -> StoreResult<()>;

    /// Atomically move the head of waiting into in-flight with a lease of
    /// `lease_duration` from the moment of the claim.
    ///
    /// An id still in flight under a live lease is never claimed twice: a
    /// duplicate waiting entry for it is dropped instead. An expired
    /// in-flight entry is taken over.
    ///
    /// Waits up to `timeout` for work and returns `None` if none arrives.
    async fn claim_next(
        &self,
        timeout: Duration,
        lease_duration: Duration,
    ) -> StoreResult<Option<Claim>>;

    /// Atomically remove and return every scheduled id with score <= `now`,
    /// earliest first.
    async fn pop_due_scheduled(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>>;

    /// Remove an id from in-flight.
    ///
    /// Fails with [`StoreError::NotFound`] if the id is absent or held under a
    /// different lease.
    async fn remove_inflight(&self, id: JobId, lease_expires_at: DateTime<Utc>)
    -> StoreResult<()>;

    /// Snapshot of in-flight entries with their lease expiry, earliest first.
    async fn scan_inflight(&self) -> StoreResult<Vec<(JobId, DateTime<Utc>)>>;

    /// Append an id to the dead-letter collection.
    async fn push_dead_letter(&self, id: JobId) -> StoreResult<()>;

    /// Up to `limit` dead-lettered ids, oldest first.
    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<JobId>>;

    /// Remove an id from dead-letter. Fails with [`StoreError::NotFound`] if absent.
    async fn remove_dead_letter(&self, id: JobId) -> StoreResult<()>;

    /// Count the ids in each collection.
    async fn depth(&self) -> StoreResult<QueueDepth>;
}

/// Compute the lease expiry for a claim made at `now`, at store precision.
pub fn lease_deadline(now: DateTime<Utc>, lease_duration: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::MAX);
    queue_core::store_time(now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC))
}
