//! In-process store backend.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{Job, JobId, JobState, QueueDepth, StoreError};
use tokio::sync::{Mutex, Notify};

use crate::store::{Claim, JobStore, StoreResult, lease_deadline};

#[derive(Default)]
struct Collections {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    /// Membership of `waiting`, for O(1) duplicate checks.
    waiting_ids: HashSet<JobId>,
    /// (not_before, id) so equal scores stay distinct.
    scheduled: BTreeSet<(DateTime<Utc>, JobId)>,
    scheduled_at: HashMap<JobId, DateTime<Utc>>,
    inflight: HashMap<JobId, DateTime<Utc>>,
    dead_letter: BTreeMap<u64, JobId>,
    dead_letter_seq: HashMap<JobId, u64>,
    next_dead_seq: u64,
}

impl Collections {
    fn unschedule(&mut self, id: JobId) {
        if let Some(at) = self.scheduled_at.remove(&id) {
            self.scheduled.remove(&(at, id));
        }
    }
}

/// Store backed by process memory.
///
/// Every operation holds one lock, which makes the multi-collection moves
/// atomic. Useful for tests and single-process deployments that can afford
/// to lose queue state on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
    work_available: Notify,
    outage: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `operations` calls fail with [`StoreError::Unavailable`].
    pub fn inject_outage(&self, operations: usize) {
        self.outage.store(operations, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        let tripped = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }

    async fn try_claim(&self, lease_duration: Duration) -> Option<Claim> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        while let Some(job_id) = inner.waiting.pop_front() {
            inner.waiting_ids.remove(&job_id);
            if inner.inflight.get(&job_id).is_some_and(|lease| *lease > now) {
                tracing::debug!("Dropping waiting duplicate of in-flight job {}", job_id);
                continue;
            }
            let lease_expires_at = lease_deadline(now, lease_duration);
            inner.inflight.insert(job_id, lease_expires_at);
            return Some(Claim {
                job_id,
                lease_expires_at,
            });
        }
        None
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        self.check_available()?;
        self.inner.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        self.check_available()?;
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn replace_job(&self, job: &Job, expected: &Job) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&job.id) {
            Some(stored) if stored.same_version(expected) => {
                *stored = job.clone();
                Ok(())
            }
            _ => Err(StoreError::NotFound(job.id)),
        }
    }

    async fn scan_jobs(&self, state: JobState) -> StoreResult<Vec<Job>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn delete_job(&self, id: JobId) -> StoreResult<()> {
        self.check_available()?;
        self.inner.lock().await.jobs.remove(&id);
        Ok(())
    }

    async fn push_waiting(&self, id: JobId) -> StoreResult<()> {
        self.check_available()?;
        {
            let mut inner = self.inner.lock().await;
            if inner.waiting_ids.insert(id) {
                inner.waiting.push_back(id);
            }
        }
        self.work_available.notify_one();
        Ok(())
    }

    async fn push_scheduled(&self, id: JobId, not_before: DateTime<Utc>) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.unschedule(id);
        inner.scheduled.insert((not_before, id));
        inner.scheduled_at.insert(id, not_before);
        Ok(())
    }

    async fn claim_next(
        &self,
        timeout: Duration,
        lease_duration: Duration,
    ) -> StoreResult<Option<Claim>> {
        self.check_available()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claim) = self.try_claim(lease_duration).await {
                return Ok(Some(claim));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn pop_due_scheduled(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let due: Vec<JobId> = inner
            .scheduled
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, id)| *id)
            .collect();
        for id in &due {
            inner.unschedule(*id);
        }
        Ok(due)
    }

    async fn remove_inflight(
        &self,
        id: JobId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.inflight.get(&id) {
            Some(lease) if *lease == lease_expires_at => {
                inner.inflight.remove(&id);
                Ok(())
            }
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn scan_inflight(&self) -> StoreResult<Vec<(JobId, DateTime<Utc>)>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut entries: Vec<_> = inner
            .inflight
            .iter()
            .map(|(id, lease)| (*id, *lease))
            .collect();
        entries.sort_by_key(|(id, lease)| (*lease, *id));
        Ok(entries)
    }

    async fn push_dead_letter(&self, id: JobId) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.dead_letter_seq.contains_key(&id) {
            return Ok(());
        }
        let seq = inner.next_dead_seq;
        inner.next_dead_seq += 1;
        inner.dead_letter.insert(seq, id);
        inner.dead_letter_seq.insert(id, seq);
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<JobId>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.dead_letter.values().take(limit).copied().collect())
    }

    async fn remove_dead_letter(&self, id: JobId) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let seq = inner
            .dead_letter_seq
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        inner.dead_letter.remove(&seq);
        Ok(())
    }

    async fn depth(&self) -> StoreResult<QueueDepth> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(QueueDepth {
            waiting: inner.waiting.len() as u64,
            scheduled: inner.scheduled.len() as u64,
            in_flight: inner.inflight.len() as u64,
            dead_lettered: inner.dead_letter.len() as u64,
        })
    }
}
