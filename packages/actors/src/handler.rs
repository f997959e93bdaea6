//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use queue_core::QueueError;

/// Result type for job handlers. The error string becomes `last_error`.
pub type HandlerResult = Result<(), String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of a specific type are processed.
/// Delivery is at-least-once, so handlers must tolerate running the same
/// payload more than once.
pub trait JobHandler: Send + Sync + 'static {
    /// The job type this handler processes.
    fn job_type(&self) -> &str;

    /// Process a job payload.
    fn handle(&self, payload: Bytes) -> HandlerFuture;
}

/// Registry for job handlers.
///
/// Maps job types to their handlers. Exactly one handler per type.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type.
    pub fn register<H: JobHandler>(&mut self, handler: H) -> Result<(), QueueError> {
        let job_type = handler.job_type().to_string();
        if job_type.is_empty() {
            return Err(QueueError::InvalidArgument("job type must not be empty".into()));
        }
        if self.handlers.contains_key(&job_type) {
            return Err(QueueError::AlreadyRegistered(job_type));
        }
        tracing::debug!("Registered handler for job type: {}", job_type);
        self.handlers.insert(job_type, Arc::new(handler));
        Ok(())
    }

    /// Get a handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a handler exists for a job type.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// List all registered job types.
    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(Bytes) -> HandlerFuture + Send + Sync + 'static,
{
    job_type: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Bytes) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(job_type: impl Into<String>, handler: F) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(Bytes) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn handle(&self, payload: Bytes) -> HandlerFuture {
        (self.handler)(payload)
    }
}

/// Helper macro for creating job handlers from async blocks.
///
/// ```ignore
/// registry.register(job_handler!("echo", |payload| {
///     tracing::info!("echo: {:?}", payload);
///     Ok(())
/// }))?;
/// ```
#[macro_export]
macro_rules! job_handler {
    ($job_type:expr, |$payload:ident| $body:expr) => {
        $crate::FnHandler::new($job_type, |$payload: $crate::Bytes| {
            Box::pin(async move { $body })
        })
    };
}
