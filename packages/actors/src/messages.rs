//! Message types for actor communication.

use queue_core::QueueError;
use ractor::RpcReplyPort;

/// Messages for a WorkerActor (one dispatcher slot).
#[derive(Debug)]
pub enum WorkerMessage {
    /// Claim and process the next job, then poll again.
    Poll,
}

/// Messages for the SweeperActor.
#[derive(Debug)]
pub enum SweeperMessage {
    /// Periodic tick: promote due scheduled jobs.
    Tick,

    /// Sweep immediately and report how many jobs were promoted.
    SweepNow { reply: RpcReplyPort<usize> },
}

/// Messages for the ReaperActor.
#[derive(Debug)]
pub enum ReaperMessage {
    /// Periodic tick: recover expired leases.
    Tick,

    /// Reap immediately and report how many jobs were recovered.
    ReapNow { reply: RpcReplyPort<usize> },
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Forward an immediate sweep to the sweeper.
    SweepNow { reply: RpcReplyPort<usize> },

    /// Forward an immediate reap to the reaper.
    ReapNow { reply: RpcReplyPort<usize> },

    /// Stop every child, then the supervisor itself.
    Shutdown { reply: RpcReplyPort<()> },

    /// Periodic tick for depth sampling.
    Tick,
}

/// Result type for runtime operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Failed to spawn actor: {0}")]
    Spawn(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Timeout")]
    Timeout,

    #[error(transparent)]
    Queue(#[from] QueueError),
}
