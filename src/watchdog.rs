//! Processing-timeout supervision for message handlers.
//!
//! Each dispatched message runs its handler as a spawned task raced against
//! a one-shot timer. If the timer fires first the broker synthesizes a
//! failure and detaches the task; whatever the handler returns later is
//! discarded, so a late ack can never resurrect a record the retry policy
//! has already settled. On normal completion the timer is simply dropped.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinError;

use crate::consumer::MessageHandler;

/// Terminal outcome of one handler dispatch.
#[derive(Debug)]
pub(crate) enum HandlerVerdict {
    /// Handler returned `Ok`; the record is acknowledged.
    Ack,
    /// Handler returned an error or panicked.
    Fail(String),
    /// The processing budget elapsed before the handler finished.
    TimedOut,
}

/// Run `handler` on `payload`, bounded by `budget` when one is set.
///
/// A panicking handler yields `Fail`, not a crashed consumer.
pub(crate) async fn supervise(
    handler: Arc<dyn MessageHandler>,
    payload: Value,
    budget: Option<Duration>,
) -> HandlerVerdict {
    let task = tokio::spawn(async move { handler.handle(payload).await });
    match budget {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => verdict(joined),
            // The task keeps running detached; its completion is ignored.
            Err(_) => HandlerVerdict::TimedOut,
        },
        None => verdict(task.await),
    }
}

fn verdict(joined: Result<anyhow::Result<()>, JoinError>) -> HandlerVerdict {
    match joined {
        Ok(Ok(())) => HandlerVerdict::Ack,
        Ok(Err(e)) => HandlerVerdict::Fail(e.to_string()),
        Err(e) => HandlerVerdict::Fail(format!("handler panicked: {e}")),
    }
}
