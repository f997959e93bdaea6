//! Core domain types for the job queue system.
//!
//! This crate contains shared types used across all packages:
//! - Job and JobState for work items
//! - QueueConfig, QueueDepth and QueueStats for queue behavior
//! - RetryPolicy for backoff decisions
//! - Events and observer hooks for monitoring

mod error;
mod events;
mod job;
mod observer;
mod queue;
mod retry;

pub use error::{ConfigError, FailureReason, QueueError, StoreError};
pub use events::JobEvent;
pub use job::{Job, JobId, JobState, JobSummary, store_time};
pub use observer::{CountingObserver, NoopObserver, ObserverSet, QueueObserver};
pub use queue::{MAX_DURATION_MS, QueueConfig, QueueDepth, QueueStats, Retention, StoreRetry};
pub use retry::{RetryDecision, RetryPolicy};
