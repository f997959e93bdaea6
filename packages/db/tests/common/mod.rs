//! Store contract checks shared by every backend.

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use queue_core::{Job, JobId, JobState, QueueDepth, StoreError};

use db::JobStore;

pub type TestResult = Result<(), Box<dyn Error>>;

const LEASE: Duration = Duration::from_secs(30);
const NO_WAIT: Duration = Duration::from_millis(0);

async fn enqueue(store: &dyn JobStore, job_type: &str) -> Result<JobId, StoreError> {
    let job = Job::new(job_type, "payload", 3);
    store.put_job(&job).await?;
    store.push_waiting(job.id).await?;
    Ok(job.id)
}

pub async fn job_bodies(store: Arc<dyn JobStore>) -> TestResult {
    let mut job = Job::new("echo", vec![0u8, 1, 2, 255], 4);
    store.put_job(&job).await?;

    let loaded = store.get_job(job.id).await?.ok_or("job missing")?;
    assert_eq!(loaded, job);

    let now = Utc::now();
    job.begin_attempt(now + ChronoDuration::seconds(30), now)?;
    store.put_job(&job).await?;
    let loaded = store.get_job(job.id).await?.ok_or("job missing")?;
    assert_eq!(loaded.state, JobState::InFlight);
    assert_eq!(loaded.attempt_count, 1);
    assert_eq!(loaded.lease_expires_at, job.lease_expires_at);

    store.delete_job(job.id).await?;
    assert!(store.get_job(job.id).await?.is_none());
    store.delete_job(job.id).await?;
    Ok(())
}

pub async fn claims_are_fifo_and_leased(store: Arc<dyn JobStore>) -> TestResult {
    let first = enqueue(store.as_ref(), "a").await?;
    let second = enqueue(store.as_ref(), "b").await?;

    let before = Utc::now();
    let claim = store.claim_next(NO_WAIT, LEASE).await?.ok_or("nothing claimed")?;
    assert_eq!(claim.job_id, first);
    assert!(claim.lease_expires_at >= before + ChronoDuration::seconds(29));

    let claim_b = store.claim_next(NO_WAIT, LEASE).await?.ok_or("nothing claimed")?;
    assert_eq!(claim_b.job_id, second);
    assert!(store.claim_next(NO_WAIT, LEASE).await?.is_none());

    let inflight = store.scan_inflight().await?;
    let ids: HashSet<JobId> = inflight.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, HashSet::from([first, second]));
    assert!(inflight.contains(&(first, claim.lease_expires_at)));
    Ok(())
}

pub async fn claim_times_out_when_idle(store: Arc<dyn JobStore>) -> TestResult {
    let started = tokio::time::Instant::now();
    let claim = store.claim_next(Duration::from_millis(100), LEASE).await?;
    assert!(claim.is_none());
    assert!(started.elapsed() >= Duration::from_millis(90));
    Ok(())
}

pub async fn blocked_claim_wakes_on_push(store: Arc<dyn JobStore>) -> TestResult {
    let claimer = {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next(Duration::from_secs(5), LEASE).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let id = enqueue(store.as_ref(), "late").await?;

    let claim = claimer.await??.ok_or("claim timed out")?;
    assert_eq!(claim.job_id, id);
    Ok(())
}

pub async fn no_double_claim(store: Arc<dyn JobStore>) -> TestResult {
    no_double_claim_across(vec![store; 8]).await
}

/// One claimer task per handle. The handles may be distinct store instances
/// over the same data.
pub async fn no_double_claim_across(stores: Vec<Arc<dyn JobStore>>) -> TestResult {
    let first = stores.first().ok_or("no stores")?.clone();
    let mut ids = HashSet::new();
    for _ in 0..100 {
        ids.insert(enqueue(first.as_ref(), "race").await?);
    }

    let mut claimers = Vec::new();
    for store in stores {
        claimers.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(claim) = store.claim_next(Duration::from_millis(50), LEASE).await? {
                mine.push(claim.job_id);
            }
            Ok::<_, StoreError>(mine)
        }));
    }

    let mut claimed = Vec::new();
    for claimer in claimers {
        claimed.extend(claimer.await??);
    }

    assert_eq!(claimed.len(), ids.len(), "every job claimed exactly once");
    assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), ids);
    assert_eq!(first.depth().await?.in_flight, 100);
    Ok(())
}

pub async fn duplicate_of_live_claim_is_dropped(store: Arc<dyn JobStore>) -> TestResult {
    let id = enqueue(store.as_ref(), "dup").await?;
    let claim = store.claim_next(NO_WAIT, LEASE).await?.ok_or("nothing claimed")?;

    store.push_waiting(id).await?;
    assert!(store.claim_next(NO_WAIT, LEASE).await?.is_none());
    assert_eq!(store.depth().await?.waiting, 0);
    assert_eq!(store.scan_inflight().await?, vec![(id, claim.lease_expires_at)]);
    Ok(())
}

pub async fn expired_claim_is_taken_over(store: Arc<dyn JobStore>) -> TestResult {
    let id = enqueue(store.as_ref(), "stale").await?;
    let stale = store
        .claim_next(NO_WAIT, Duration::ZERO)
        .await?
        .ok_or("nothing claimed")?;
    tokio::time::sleep(Duration::from_millis(5)).await;

    store.push_waiting(id).await?;
    let fresh = store.claim_next(NO_WAIT, LEASE).await?.ok_or("nothing claimed")?;
    assert_eq!(fresh.job_id, id);
    assert!(fresh.lease_expires_at > stale.lease_expires_at);
    assert_eq!(store.scan_inflight().await?, vec![(id, fresh.lease_expires_at)]);
    assert_eq!(
        store.remove_inflight(id, stale.lease_expires_at).await,
        Err(StoreError::NotFound(id))
    );
    Ok(())
}

pub async fn waiting_ignores_duplicates(store: Arc<dyn JobStore>) -> TestResult {
    let id = enqueue(store.as_ref(), "twice").await?;
    store.push_waiting(id).await?;
    assert_eq!(store.depth().await?.waiting, 1);

    let claim = store.claim_next(NO_WAIT, LEASE).await?.ok_or("nothing claimed")?;
    assert_eq!(claim.job_id, id);
    assert!(store.claim_next(NO_WAIT, LEASE).await?.is_none());
    Ok(())
}

pub async fn replace_job_checks_the_revision(store: Arc<dyn JobStore>) -> TestResult {
    let original = Job::new("cas", "payload", 3);
    store.put_job(&original).await?;

    let now = Utc::now();
    let mut started = original.clone();
    started.begin_attempt(now + ChronoDuration::seconds(30), now)?;
    store.replace_job(&started, &original).await?;
    assert_eq!(store.get_job(original.id).await?, Some(started.clone()));

    let mut rival = original.clone();
    rival.begin_attempt(now + ChronoDuration::seconds(60), now)?;
    assert_eq!(
        store.replace_job(&rival, &original).await,
        Err(StoreError::NotFound(original.id))
    );
    assert_eq!(store.get_job(original.id).await?, Some(started));

    let missing = Job::new("cas", "payload", 3);
    assert_eq!(
        store.replace_job(&missing, &missing).await,
        Err(StoreError::NotFound(missing.id))
    );
    assert!(store.get_job(missing.id).await?.is_none());
    Ok(())
}

pub async fn scan_jobs_by_state(store: Arc<dyn JobStore>) -> TestResult {
    let older = Job::new("scan", "a", 3);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let newer = Job::new("scan", "b", 3);
    let now = Utc::now();
    let mut running = Job::new("scan", "c", 3);
    running.begin_attempt(now + ChronoDuration::seconds(30), now)?;
    for job in [&newer, &running, &older] {
        store.put_job(job).await?;
    }

    let waiting: Vec<JobId> = store
        .scan_jobs(JobState::Waiting)
        .await?
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(waiting, vec![older.id, newer.id]);
    assert_eq!(store.scan_jobs(JobState::InFlight).await?, vec![running]);
    assert!(store.scan_jobs(JobState::DeadLettered).await?.is_empty());
    Ok(())
}

pub async fn single_job_has_single_owner(store: Arc<dyn JobStore>) -> TestResult {
    let id = enqueue(store.as_ref(), "contested").await?;

    let claimers: Vec<_> = (0..10)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next(Duration::from_millis(50), LEASE).await })
        })
        .collect();

    let mut winners = 0;
    for claimer in claimers {
        if let Some(claim) = claimer.await?? {
            assert_eq!(claim.job_id, id);
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

pub async fn due_scheduled_pop_once(store: Arc<dyn JobStore>) -> TestResult {
    let now = Utc::now();
    let early = JobId::new();
    let later = JobId::new();
    let future = JobId::new();
    store
        .push_scheduled(later, now - ChronoDuration::milliseconds(10))
        .await?;
    store
        .push_scheduled(early, now - ChronoDuration::seconds(5))
        .await?;
    store
        .push_scheduled(future, now + ChronoDuration::hours(1))
        .await?;

    let due = store.pop_due_scheduled(now).await?;
    assert_eq!(due, vec![early, later]);
    assert!(store.pop_due_scheduled(now).await?.is_empty());

    let depth = store.depth().await?;
    assert_eq!(depth.scheduled, 1);
    Ok(())
}

pub async fn inflight_release_is_fenced(store: Arc<dyn JobStore>) -> TestResult {
    let id = enqueue(store.as_ref(), "fenced").await?;
    let claim = store.claim_next(NO_WAIT, LEASE).await?.ok_or("nothing claimed")?;

    let stale = claim.lease_expires_at - ChronoDuration::seconds(1);
    assert_eq!(
        store.remove_inflight(id, stale).await,
        Err(StoreError::NotFound(id))
    );

    store.remove_inflight(id, claim.lease_expires_at).await?;
    assert_eq!(
        store.remove_inflight(id, claim.lease_expires_at).await,
        Err(StoreError::NotFound(id))
    );
    assert!(store.scan_inflight().await?.is_empty());
    Ok(())
}

pub async fn dead_letters(store: Arc<dyn JobStore>) -> TestResult {
    let first = JobId::new();
    let second = JobId::new();
    store.push_dead_letter(first).await?;
    tokio::time::sleep(Duration::from_millis(2)).await;
    store.push_dead_letter(second).await?;
    store.push_dead_letter(first).await?;

    assert_eq!(store.list_dead_letters(10).await?, vec![first, second]);
    assert_eq!(store.list_dead_letters(1).await?, vec![first]);

    store.remove_dead_letter(first).await?;
    assert_eq!(
        store.remove_dead_letter(first).await,
        Err(StoreError::NotFound(first))
    );
    assert_eq!(store.list_dead_letters(10).await?, vec![second]);
    Ok(())
}

pub async fn depth_counts_each_collection(store: Arc<dyn JobStore>) -> TestResult {
    assert_eq!(store.depth().await?, QueueDepth::default());

    enqueue(store.as_ref(), "a").await?;
    enqueue(store.as_ref(), "b").await?;
    store.claim_next(NO_WAIT, LEASE).await?;
    store
        .push_scheduled(JobId::new(), Utc::now() + ChronoDuration::minutes(1))
        .await?;
    store.push_dead_letter(JobId::new()).await?;

    assert_eq!(
        store.depth().await?,
        QueueDepth {
            waiting: 1,
            scheduled: 1,
            in_flight: 1,
            dead_lettered: 1,
        }
    );
    Ok(())
}
