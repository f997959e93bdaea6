//! SurrealDB store backend.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use queue_core::{Job, JobId, JobState, QueueDepth, StoreError};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::store::{Claim, JobStore, StoreResult, lease_deadline};
use crate::{Database, DbConfig, DbError, init_schema, open};

/// Job body as stored in the `job` table.
///
/// Timestamps are epoch milliseconds and the state is its string form, so
/// the row needs no SurrealDB-specific types.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    #[serde(default, skip_serializing)]
    id: Option<Thing>,
    job_id: String,
    job_type: String,
    payload: Vec<u8>,
    state: String,
    attempt_count: u32,
    max_attempts: u32,
    not_before_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl JobRow {
    fn from_job(job: &Job) -> Self {
        Self {
            id: None,
            job_id: job.id.to_string(),
            job_type: job.job_type.clone(),
            payload: job.payload.to_vec(),
            state: job.state.as_str().to_string(),
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            not_before_ms: job.not_before.timestamp_millis(),
            lease_expires_at_ms: job.lease_expires_at.map(|at| at.timestamp_millis()),
            last_error: job.last_error.clone(),
            created_at_ms: job.created_at.timestamp_millis(),
            updated_at_ms: job.updated_at.timestamp_millis(),
        }
    }

    fn into_job(self) -> StoreResult<Job> {
        Ok(Job {
            id: parse_id(&self.job_id)?,
            job_type: self.job_type,
            payload: Bytes::from(self.payload),
            state: self.state.parse().map_err(StoreError::unavailable)?,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            not_before: from_millis(self.not_before_ms)?,
            lease_expires_at: self.lease_expires_at_ms.map(from_millis).transpose()?,
            last_error: self.last_error,
            created_at: from_millis(self.created_at_ms)?,
            updated_at: from_millis(self.updated_at_ms)?,
        })
    }
}

/// Row of one of the ordered index tables.
#[derive(Debug, Deserialize)]
struct IndexRow {
    job_id: String,
    score: i64,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    total: i64,
}

fn parse_id(raw: &str) -> StoreResult<JobId> {
    JobId::parse(raw).map_err(|e| StoreError::Unavailable(format!("corrupt job id {raw:?}: {e}")))
}

/// Optimistic transaction conflicts are reported as retryable errors.
fn is_conflict(error: &surrealdb::Error) -> bool {
    let message = error.to_string();
    message.contains("can be retried") || message.contains("conflict")
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Unavailable(format!("timestamp out of range: {ms}")))
}

/// Take over `$id` from waiting unless it already holds a live lease.
///
/// One statement, so it runs in one transaction: the waiting row is consumed
/// by whichever claimer deletes it first, and a duplicate of a job still in
/// flight is dropped without touching its lease.
const CLAIM: &str = r#"
IF array::len((DELETE type::thing('waiting', $id) RETURN BEFORE)) > 0
    AND array::len((SELECT VALUE score FROM type::thing('inflight', $id) WHERE score > $now)) = 0 {
    UPSERT type::thing('inflight', $id) SET job_id = $id, score = $score RETURN job_id, score
} ELSE {
    []
};
"#;

const REPLACE_JOB: &str = r#"
UPDATE type::thing('job', $id) CONTENT $row
    WHERE state = $state AND attempt_count = $attempts AND updated_at_ms = $updated
    RETURN job_id;
"#;

const COUNTS: &str = r#"
SELECT count() AS total FROM waiting GROUP ALL;
SELECT count() AS total FROM scheduled GROUP ALL;
SELECT count() AS total FROM inflight GROUP ALL;
SELECT count() AS total FROM dead_letter GROUP ALL;
"#;

/// Outcome of one claim attempt on the waiting head.
enum ClaimAttempt {
    Empty,
    Claimed(Claim),
    /// Another claimer won the head, or the head was a duplicate. Try again.
    Contended,
}

/// Store backed by an embedded SurrealDB instance.
///
/// Every mutation that must be atomic is a single conditional statement, so
/// several `SurrealStore` handles over one database coordinate through the
/// database alone.
pub struct SurrealStore {
    db: Database,
    poll_interval: Duration,
    seq: AtomicI64,
}

impl SurrealStore {
    /// Connect using `config` and make sure the schema exists.
    pub async fn open(config: &DbConfig) -> Result<Self, DbError> {
        let db = open(config).await?;
        init_schema(&db).await?;
        Ok(Self::new(db, config.poll_interval))
    }

    /// Wrap an existing connection. The schema must already be initialized.
    pub fn new(db: Database, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval,
            seq: AtomicI64::new(Utc::now().timestamp_micros()),
        }
    }

    /// Monotonic score for the waiting and dead-letter tables, roughly
    /// microseconds since epoch.
    fn next_seq(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let step = |prev: i64| prev.saturating_add(1).max(now);
        match self
            .seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(step(prev)))
        {
            Ok(prev) | Err(prev) => step(prev),
        }
    }

    async fn upsert_index(&self, table: &'static str, id: JobId, score: i64) -> StoreResult<()> {
        let sql = format!(
            "UPSERT type::thing('{table}', $id) SET job_id = $id, score = $score RETURN NONE"
        );
        self.db
            .query(sql)
            .bind(("id", id.to_string()))
            .bind(("score", score))
            .await
            .map_err(StoreError::unavailable)?
            .check()
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    /// Insert an index row unless one already exists for `id`.
    async fn insert_index(&self, table: &'static str, id: JobId, score: i64) -> StoreResult<()> {
        let sql = format!(
            "INSERT IGNORE INTO {table} {{ id: $id, job_id: $id, score: $score }} RETURN NONE"
        );
        self.db
            .query(sql)
            .bind(("id", id.to_string()))
            .bind(("score", score))
            .await
            .map_err(StoreError::unavailable)?
            .check()
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    /// Run a `DELETE ... RETURN BEFORE` and hand back the rows it removed.
    async fn delete_returning(
        &self,
        sql: &'static str,
        binds: Vec<(&'static str, surrealdb::sql::Value)>,
    ) -> StoreResult<Vec<IndexRow>> {
        let mut query = self.db.query(sql);
        for binding in binds {
            query = query.bind(binding);
        }
        let mut response = query.await.map_err(StoreError::unavailable)?;
        response.take(0).map_err(StoreError::unavailable)
    }

    async fn ordered(
        &self,
        sql: &'static str,
        bind: Option<(&'static str, i64)>,
    ) -> StoreResult<Vec<IndexRow>> {
        let mut query = self.db.query(sql);
        if let Some(binding) = bind {
            query = query.bind(binding);
        }
        let mut response = query.await.map_err(StoreError::unavailable)?;
        response.take(0).map_err(StoreError::unavailable)
    }

    async fn try_claim(&self, lease_duration: Duration) -> StoreResult<ClaimAttempt> {
        let head = self
            .ordered("SELECT job_id, score FROM waiting ORDER BY score ASC LIMIT 1", None)
            .await?;
        let Some(head) = head.into_iter().next() else {
            return Ok(ClaimAttempt::Empty);
        };

        let job_id = parse_id(&head.job_id)?;
        let now = Utc::now();
        let lease_expires_at = lease_deadline(now, lease_duration);
        let response = self
            .db
            .query(CLAIM)
            .bind(("id", head.job_id))
            .bind(("now", now.timestamp_millis()))
            .bind(("score", lease_expires_at.timestamp_millis()))
            .await;
        let claimed: Result<Vec<IndexRow>, surrealdb::Error> =
            response.and_then(|mut response| response.take(0));

        match claimed {
            Ok(rows) if rows.is_empty() => Ok(ClaimAttempt::Contended),
            Ok(_) => Ok(ClaimAttempt::Claimed(Claim {
                job_id,
                lease_expires_at,
            })),
            Err(e) if is_conflict(&e) => {
                tracing::debug!("Claim of {} lost to a concurrent transaction: {}", job_id, e);
                Ok(ClaimAttempt::Contended)
            }
            Err(e) => Err(StoreError::unavailable(e)),
        }
    }
}

#[async_trait]
impl JobStore for SurrealStore {
    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        let _: Option<JobRow> = self
            .db
            .upsert(("job", job.id.to_string()))
            .content(JobRow::from_job(job))
            .await
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let row: Option<JobRow> = self
            .db
            .select(("job", id.to_string()))
            .await
            .map_err(StoreError::unavailable)?;
        row.map(JobRow::into_job).transpose()
    }

    async fn replace_job(&self, job: &Job, expected: &Job) -> StoreResult<()> {
        let mut response = self
            .db
            .query(REPLACE_JOB)
            .bind(("id", job.id.to_string()))
            .bind(("row", JobRow::from_job(job)))
            .bind(("state", expected.state.as_str().to_string()))
            .bind(("attempts", expected.attempt_count))
            .bind(("updated", expected.updated_at.timestamp_millis()))
            .await
            .map_err(StoreError::unavailable)?;
        let replaced: Vec<IdRow> = response.take(0).map_err(StoreError::unavailable)?;
        if replaced.iter().any(|row| row.job_id == job.id.to_string()) {
            Ok(())
        } else {
            Err(StoreError::NotFound(job.id))
        }
    }

    async fn scan_jobs(&self, state: JobState) -> StoreResult<Vec<Job>> {
        let mut response = self
            .db
            .query("SELECT * FROM job WHERE state = $state ORDER BY created_at_ms ASC")
            .bind(("state", state.as_str().to_string()))
            .await
            .map_err(StoreError::unavailable)?;
        let rows: Vec<JobRow> = response.take(0).map_err(StoreError::unavailable)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn delete_job(&self, id: JobId) -> StoreResult<()> {
        let _: Option<JobRow> = self
            .db
            .delete(("job", id.to_string()))
            .await
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    async fn push_waiting(&self, id: JobId) -> StoreResult<()> {
        self.insert_index("waiting", id, self.next_seq()).await
    }

    async fn push_scheduled(&self, id: JobId, not_before: DateTime<Utc>) -> StoreResult<()> {
        self.upsert_index("scheduled", id, not_before.timestamp_millis())
            .await
    }

    async fn claim_next(
        &self,
        timeout: Duration,
        lease_duration: Duration,
    ) -> StoreResult<Option<Claim>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_claim(lease_duration).await? {
                ClaimAttempt::Claimed(claim) => return Ok(Some(claim)),
                ClaimAttempt::Contended => {
                    tokio::task::yield_now().await;
                    continue;
                }
                ClaimAttempt::Empty => {}
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn pop_due_scheduled(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        let mut due = self
            .delete_returning(
                "DELETE scheduled WHERE score <= $now RETURN BEFORE",
                vec![("now", now.timestamp_millis().into())],
            )
            .await?;
        due.sort_by(|a, b| (a.score, &a.job_id).cmp(&(b.score, &b.job_id)));
        due.iter().map(|row| parse_id(&row.job_id)).collect()
    }

    async fn remove_inflight(
        &self,
        id: JobId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let removed = self
            .delete_returning(
                "DELETE type::thing('inflight', $id) WHERE score = $lease RETURN BEFORE",
                vec![
                    ("id", id.to_string().into()),
                    ("lease", lease_expires_at.timestamp_millis().into()),
                ],
            )
            .await?;
        if removed.is_empty() {
            Err(StoreError::NotFound(id))
        } else {
            Ok(())
        }
    }

    async fn scan_inflight(&self) -> StoreResult<Vec<(JobId, DateTime<Utc>)>> {
        let rows = self
            .ordered("SELECT job_id, score FROM inflight ORDER BY score ASC", None)
            .await?;
        rows.iter()
            .map(|row| Ok((parse_id(&row.job_id)?, from_millis(row.score)?)))
            .collect()
    }

    async fn push_dead_letter(&self, id: JobId) -> StoreResult<()> {
        self.insert_index("dead_letter", id, self.next_seq()).await
    }

    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<JobId>> {
        let rows = self
            .ordered(
                "SELECT job_id, score FROM dead_letter ORDER BY score ASC LIMIT $limit",
                Some(("limit", i64::try_from(limit).unwrap_or(i64::MAX))),
            )
            .await?;
        rows.iter().map(|row| parse_id(&row.job_id)).collect()
    }

    async fn remove_dead_letter(&self, id: JobId) -> StoreResult<()> {
        let removed = self
            .delete_returning(
                "DELETE type::thing('dead_letter', $id) RETURN BEFORE",
                vec![("id", id.to_string().into())],
            )
            .await?;
        if removed.is_empty() {
            Err(StoreError::NotFound(id))
        } else {
            Ok(())
        }
    }

    async fn depth(&self) -> StoreResult<QueueDepth> {
        let mut response = self
            .db
            .query(COUNTS)
            .await
            .map_err(StoreError::unavailable)?;

        let mut counts = [0u64; 4];
        for (index, count) in counts.iter_mut().enumerate() {
            let row: Option<CountRow> = response.take(index).map_err(StoreError::unavailable)?;
            *count = row.map_or(0, |r| r.total.max(0) as u64);
        }

        Ok(QueueDepth {
            waiting: counts[0],
            scheduled: counts[1],
            in_flight: counts[2],
            dead_lettered: counts[3],
        })
    }
}
