//! Supervisor actor owning the worker pool, the sweeper and the reaper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use db::JobStore;
use futures_util::future::join_all;
use queue_core::{
    CountingObserver, JobEvent, ObserverSet, QueueConfig, QueueObserver, QueueStats, RetryPolicy,
};
use ractor::{Actor, ActorCell, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;

use crate::broadcast::BroadcastObserver;
use crate::context::QueueContext;
use crate::handler::JobHandlerRegistry;
use crate::messages::{
    ActorError, ActorResult, ReaperMessage, SupervisorMessage, SweeperMessage, WorkerMessage,
};
use crate::queue::JobQueue;
use crate::reaper::ReaperActor;
use crate::sweeper::SweeperActor;
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// State for the supervisor actor.
pub struct SupervisorState {
    ctx: QueueContext,
    /// Worker actors by actor id, with their worker ids.
    workers: HashMap<ActorId, (String, ActorRef<WorkerMessage>)>,
    sweeper: Option<ActorRef<SweeperMessage>>,
    reaper: Option<ActorRef<ReaperMessage>>,
    /// Worker counter for unique IDs.
    worker_counter: u64,
    shutting_down: bool,
}

impl SupervisorState {
    fn new(ctx: QueueContext) -> Self {
        Self {
            ctx,
            workers: HashMap::new(),
            sweeper: None,
            reaper: None,
            worker_counter: 0,
            shutting_down: false,
        }
    }

    /// Generate a unique worker ID.
    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("worker-{}", self.worker_counter)
    }

    fn children(&self) -> Vec<ActorCell> {
        let mut cells: Vec<ActorCell> = self
            .workers
            .values()
            .map(|(_, worker)| worker.get_cell())
            .collect();
        cells.extend(self.sweeper.as_ref().map(|s| s.get_cell()));
        cells.extend(self.reaper.as_ref().map(|r| r.get_cell()));
        cells
    }
}

async fn spawn_worker(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
) -> Result<(), ActorProcessingErr> {
    let worker_id = state.next_worker_id();
    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        ctx: state.ctx.clone(),
    };

    let (worker, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

    state.workers.insert(worker.get_id(), (worker_id, worker));
    Ok(())
}

async fn spawn_sweeper(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
) -> Result<(), ActorProcessingErr> {
    let (sweeper, _handle) =
        Actor::spawn_linked(None, SweeperActor, state.ctx.clone(), myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn sweeper: {}", e)))?;
    state.sweeper = Some(sweeper);
    Ok(())
}

async fn spawn_reaper(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
) -> Result<(), ActorProcessingErr> {
    let (reaper, _handle) =
        Actor::spawn_linked(None, ReaperActor, state.ctx.clone(), myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn reaper: {}", e)))?;
    state.reaper = Some(reaper);
    Ok(())
}

/// Supervisor actor that keeps the pool at `concurrency` workers.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = QueueContext;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        ctx: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting job queue supervisor with {} workers",
            ctx.config.concurrency
        );

        let stats_interval = ctx.config.stats_interval();
        let mut state = SupervisorState::new(ctx);

        spawn_sweeper(&myself, &mut state).await?;
        spawn_reaper(&myself, &mut state).await?;
        for _ in 0..state.ctx.config.concurrency {
            spawn_worker(&myself, &mut state).await?;
        }

        // Start periodic tick
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::SweepNow { reply } => {
                if let Some(sweeper) = &state.sweeper {
                    sweeper.send_message(SweeperMessage::SweepNow { reply })?;
                }
            }

            SupervisorMessage::ReapNow { reply } => {
                if let Some(reaper) = &state.reaper {
                    reaper.send_message(ReaperMessage::ReapNow { reply })?;
                }
            }

            SupervisorMessage::Shutdown { reply } => {
                tracing::info!("Shutting down supervisor");
                state.shutting_down = true;

                // Handlers never outlive their lease, so neither does the wait.
                let grace = state.ctx.config.lease_duration() + state.ctx.config.claim_timeout();
                let children = state.children();
                let stopped = join_all(
                    children
                        .iter()
                        .map(|child| child.stop_and_wait(None, Some(grace))),
                )
                .await;
                for result in stopped {
                    if let Err(e) = result {
                        tracing::warn!("Child did not stop cleanly: {}", e);
                    }
                }

                let _ = reply.send(());
                myself.stop(None);
                return Ok(());
            }

            SupervisorMessage::Tick => {
                let store = &state.ctx.store;
                match state.ctx.retry_store("depth", || store.depth()).await {
                    Ok(depth) => {
                        tracing::info!(
                            "Queue depth: waiting={} scheduled={} in_flight={} dead_lettered={}",
                            depth.waiting,
                            depth.scheduled,
                            depth.in_flight,
                            depth.dead_lettered
                        );
                        state.ctx.observer.on_depth(&depth);
                    }
                    Err(e) => tracing::warn!("Failed to sample queue depth: {}", e),
                }
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, err) => {
                let id = cell.get_id();
                if state.shutting_down {
                    tracing::warn!("Child actor {} failed during shutdown: {}", id, err);
                    return Ok(());
                }

                if let Some((worker_id, _)) = state.workers.remove(&id) {
                    tracing::error!("Worker {} failed: {}; restarting", worker_id, err);
                    spawn_worker(&myself, state).await?;
                } else if state.sweeper.as_ref().is_some_and(|s| s.get_id() == id) {
                    tracing::error!("Sweeper failed: {}; restarting", err);
                    spawn_sweeper(&myself, state).await?;
                } else if state.reaper.as_ref().is_some_and(|r| r.get_id() == id) {
                    tracing::error!("Reaper failed: {}; restarting", err);
                    spawn_reaper(&myself, state).await?;
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                let id = cell.get_id();
                state.workers.remove(&id);
                tracing::debug!("Child actor {} terminated: {:?}", id, reason);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Everything needed to start a queue runtime.
pub struct QueueRuntimeArgs {
    pub store: Arc<dyn JobStore>,
    pub handlers: JobHandlerRegistry,
    pub config: QueueConfig,
    /// Extra observers; counters and the event broadcast are always attached.
    pub observers: ObserverSet,
    /// Overrides the policy derived from `config`.
    pub policy: Option<RetryPolicy>,
}

impl QueueRuntimeArgs {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: JobHandlerRegistry,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            config,
            observers: ObserverSet::new(),
            policy: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// A running queue: supervisor, workers, sweeper and reaper.
pub struct QueueRuntime {
    supervisor: ActorRef<SupervisorMessage>,
    handle: tokio::task::JoinHandle<()>,
    queue: JobQueue,
    counters: Arc<CountingObserver>,
    events: BroadcastObserver,
    call_timeout: Duration,
}

impl QueueRuntime {
    /// Producer handle over the same store.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Event counters plus a fresh depth sample when the store answers.
    pub async fn stats(&self) -> QueueStats {
        let mut stats = self.counters.snapshot();
        match self.queue.depth().await {
            Ok(depth) => stats.depth = depth,
            Err(e) => tracing::warn!("Using last sampled depth: {}", e),
        }
        stats
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Promote due scheduled jobs now instead of waiting for the next tick.
    pub async fn sweep_now(&self) -> ActorResult<usize> {
        self.call(|reply| SupervisorMessage::SweepNow { reply }).await
    }

    /// Recover expired leases now instead of waiting for the next tick.
    pub async fn reap_now(&self) -> ActorResult<usize> {
        self.call(|reply| SupervisorMessage::ReapNow { reply }).await
    }

    /// Stop every actor, waiting for in-progress attempts to settle.
    pub async fn shutdown(self) -> ActorResult<()> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.supervisor
            .send_message(SupervisorMessage::Shutdown { reply: tx.into() })
            .map_err(|e| ActorError::Actor(e.to_string()))?;
        let _ = rx.await;
        self.handle
            .await
            .map_err(|e| ActorError::Actor(e.to_string()))?;
        tracing::info!("Job queue stopped");
        Ok(())
    }

    async fn call<T, F>(&self, build: F) -> ActorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(ractor::RpcReplyPort<T>) -> SupervisorMessage,
    {
        match ractor::rpc::call(&self.supervisor, build, Some(self.call_timeout)).await {
            Ok(ractor::rpc::CallResult::Success(value)) => Ok(value),
            Ok(ractor::rpc::CallResult::Timeout) => Err(ActorError::Timeout),
            Ok(ractor::rpc::CallResult::SenderError) => {
                Err(ActorError::Actor("reply channel dropped".into()))
            }
            Err(e) => Err(ActorError::Actor(e.to_string())),
        }
    }
}

/// Start a queue runtime.
pub async fn start_queue(args: QueueRuntimeArgs) -> ActorResult<QueueRuntime> {
    let counters = Arc::new(CountingObserver::new());
    let events = BroadcastObserver::default();
    let observers = args
        .observers
        .with(counters.clone())
        .with(Arc::new(events.clone()));

    let mut ctx = QueueContext::new(args.store, args.handlers, args.config, Arc::new(observers))?;
    if let Some(policy) = args.policy {
        ctx = ctx.with_policy(policy);
    }

    let queue = JobQueue::new(ctx.store.clone(), ctx.config.clone(), ctx.observer.clone());
    let call_timeout = ctx.config.lease_duration().max(Duration::from_secs(5));

    let (supervisor, handle) = Actor::spawn(None, Supervisor, ctx)
        .await
        .map_err(|e| ActorError::Spawn(e.to_string()))?;

    Ok(QueueRuntime {
        supervisor,
        handle,
        queue,
        counters,
        events,
        call_timeout,
    })
}
