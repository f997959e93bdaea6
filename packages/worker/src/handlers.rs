//! Demo handlers for trying the queue out.

use std::time::Duration;

use actors::{Bytes, FnHandler, HandlerFuture, JobHandlerRegistry};
use queue_core::QueueError;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SleepArgs {
    #[serde(default = "default_sleep_ms")]
    millis: u64,
}

fn default_sleep_ms() -> u64 {
    1_000
}

/// Register `echo`, `sleep` and `noop-fail`.
pub fn register_demo_handlers(handlers: &mut JobHandlerRegistry) -> Result<(), QueueError> {
    // Echo handler
    handlers.register(FnHandler::new("echo", |payload: Bytes| -> HandlerFuture {
        Box::pin(async move {
            tracing::info!("Echo job: {}", String::from_utf8_lossy(&payload));
            Ok(())
        })
    }))?;

    // Sleep handler, payload `{"millis": n}`
    handlers.register(FnHandler::new("sleep", |payload: Bytes| -> HandlerFuture {
        Box::pin(async move {
            let args: SleepArgs = serde_json::from_slice(&payload)
                .map_err(|e| format!("invalid sleep payload: {}", e))?;
            tracing::info!("Sleeping for {}ms", args.millis);
            tokio::time::sleep(Duration::from_millis(args.millis)).await;
            Ok(())
        })
    }))?;

    // Always fails, for watching retries and dead-lettering
    handlers.register(FnHandler::new("noop-fail", |_payload: Bytes| -> HandlerFuture {
        Box::pin(async { Err("Intentional failure".to_string()) })
    }))?;

    Ok(())
}
