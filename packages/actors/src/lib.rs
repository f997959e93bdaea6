//! Actor runtime for the job queue.
//!
//! This crate provides the Ractor-based actors that move jobs through the
//! store, plus the producer-facing [`JobQueue`] handle.
//!
//! # Architecture
//!
//! - `Supervisor` - Owns every other actor and restarts the ones that fail
//! - `WorkerActor` - One dispatcher slot: claim, run the handler, settle
//! - `SweeperActor` - Promotes due scheduled jobs into waiting
//! - `ReaperActor` - Recovers jobs whose lease expired
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobHandlerRegistry, QueueRuntimeArgs, EnqueueOptions, job_handler, start_queue};
//!
//! let mut handlers = JobHandlerRegistry::new();
//! handlers.register(job_handler!("echo", |payload| {
//!     tracing::info!("echo: {:?}", payload);
//!     Ok(())
//! }))?;
//!
//! let runtime = start_queue(QueueRuntimeArgs::new(store, handlers, config)).await?;
//! runtime.queue().enqueue("echo", "hello", EnqueueOptions::default()).await?;
//! runtime.shutdown().await?;
//! ```

mod broadcast;
mod context;
mod handler;
mod messages;
mod queue;
mod reaper;
mod settle;
mod supervisor;
mod sweeper;
mod worker_actor;

pub use broadcast::BroadcastObserver;
pub use context::{QueueContext, retry_store};
pub use handler::{FnHandler, HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry};
pub use messages::{
    ActorError, ActorResult, ReaperMessage, SupervisorMessage, SweeperMessage, WorkerMessage,
};
pub use queue::{EnqueueOptions, JobQueue};
pub use reaper::{Reaper, ReaperActor};
pub use settle::{SettleOutcome, Settlement};
pub use supervisor::{QueueRuntime, QueueRuntimeArgs, Supervisor, start_queue};
pub use sweeper::{Sweeper, SweeperActor};
pub use worker_actor::{PollOutcome, WorkerActor, WorkerActorState, WorkerArgs};

/// Re-exported for handler signatures and the `job_handler!` macro.
pub use bytes::Bytes;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
