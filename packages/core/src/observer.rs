//! Observability hooks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{JobEvent, QueueDepth, QueueStats};

/// Receives queue events and depth samples.
///
/// Both methods default to doing nothing, so implementors only override
/// what they care about. Calls happen inline on actor tasks and must not block.
pub trait QueueObserver: Send + Sync + 'static {
    fn on_event(&self, event: &JobEvent) {
        let _ = event;
    }

    fn on_depth(&self, depth: &QueueDepth) {
        let _ = depth;
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl QueueObserver for NoopObserver {}

/// Fans every call out to a list of observers.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn QueueObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn QueueObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl QueueObserver for ObserverSet {
    fn on_event(&self, event: &JobEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    fn on_depth(&self, depth: &QueueDepth) {
        for observer in &self.observers {
            observer.on_depth(depth);
        }
    }
}

/// Lock-free counters fed by events.
#[derive(Debug, Default)]
pub struct CountingObserver {
    enqueued: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    lease_expired: AtomicU64,
    waiting: AtomicU64,
    scheduled: AtomicU64,
    in_flight: AtomicU64,
    dead_letter_depth: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values and the latest depth sample.
    pub fn snapshot(&self) -> QueueStats {
        QueueStats {
            depth: QueueDepth {
                waiting: self.waiting.load(Ordering::Relaxed),
                scheduled: self.scheduled.load(Ordering::Relaxed),
                in_flight: self.in_flight.load(Ordering::Relaxed),
                dead_lettered: self.dead_letter_depth.load(Ordering::Relaxed),
            },
            enqueued: self.enqueued.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lease_expired: self.lease_expired.load(Ordering::Relaxed),
        }
    }
}

impl QueueObserver for CountingObserver {
    fn on_event(&self, event: &JobEvent) {
        let counter = match event {
            JobEvent::JobEnqueued { .. } => &self.enqueued,
            JobEvent::JobStarted { .. } => &self.started,
            JobEvent::JobCompleted { .. } => &self.completed,
            JobEvent::JobFailed { .. } => &self.failed,
            JobEvent::JobRetryScheduled { .. } => &self.retried,
            JobEvent::JobDeadLettered { .. } => &self.dead_lettered,
            JobEvent::LeaseExpired { .. } => &self.lease_expired,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_depth(&self, depth: &QueueDepth) {
        self.waiting.store(depth.waiting, Ordering::Relaxed);
        self.scheduled.store(depth.scheduled, Ordering::Relaxed);
        self.in_flight.store(depth.in_flight, Ordering::Relaxed);
        self.dead_letter_depth
            .store(depth.dead_lettered, Ordering::Relaxed);
    }
}
