mod common;

use std::sync::Arc;

use db::{JobStore, MemoryStore};
use queue_core::{Job, StoreError};

use common::TestResult;

fn store() -> Arc<dyn JobStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test]
async fn job_bodies() -> TestResult {
    common::job_bodies(store()).await
}

#[tokio::test]
async fn claims_are_fifo_and_leased() -> TestResult {
    common::claims_are_fifo_and_leased(store()).await
}

#[tokio::test]
async fn claim_times_out_when_idle() -> TestResult {
    common::claim_times_out_when_idle(store()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_claim_wakes_on_push() -> TestResult {
    common::blocked_claim_wakes_on_push(store()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_double_claim() -> TestResult {
    common::no_double_claim(store()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_job_has_single_owner() -> TestResult {
    common::single_job_has_single_owner(store()).await
}

#[tokio::test]
async fn due_scheduled_pop_once() -> TestResult {
    common::due_scheduled_pop_once(store()).await
}

#[tokio::test]
async fn inflight_release_is_fenced() -> TestResult {
    common::inflight_release_is_fenced(store()).await
}

#[tokio::test]
async fn dead_letters() -> TestResult {
    common::dead_letters(store()).await
}

#[tokio::test]
async fn depth_counts_each_collection() -> TestResult {
    common::depth_counts_each_collection(store()).await
}

#[tokio::test]
async fn duplicate_of_live_claim_is_dropped() -> TestResult {
    common::duplicate_of_live_claim_is_dropped(store()).await
}

#[tokio::test]
async fn expired_claim_is_taken_over() -> TestResult {
    common::expired_claim_is_taken_over(store()).await
}

#[tokio::test]
async fn waiting_ignores_duplicates() -> TestResult {
    common::waiting_ignores_duplicates(store()).await
}

#[tokio::test]
async fn replace_job_checks_the_revision() -> TestResult {
    common::replace_job_checks_the_revision(store()).await
}

#[tokio::test]
async fn scan_jobs_by_state() -> TestResult {
    common::scan_jobs_by_state(store()).await
}

#[tokio::test]
async fn injected_outage_fails_then_recovers() -> TestResult {
    let store = MemoryStore::new();
    let job = Job::new("echo", "x", 1);

    store.inject_outage(2);
    assert!(matches!(
        store.put_job(&job).await,
        Err(StoreError::Unavailable(_))
    ));
    assert!(matches!(
        store.get_job(job.id).await,
        Err(StoreError::Unavailable(_))
    ));

    store.put_job(&job).await?;
    assert!(store.get_job(job.id).await?.is_some());
    Ok(())
}
