//! Small helpers shared by every background loop that honors a shutdown watch

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Sleep for `delay` unless shutdown is signalled first.
/// Returns `true` if the sleep completed, `false` on shutdown.
pub async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            // A dropped sender counts as shutdown
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Abort a background task and wait until it has actually stopped
pub async fn stop_task<T>(handle: JoinHandle<T>, name: &str) {
    handle.abort();
    match handle.await {
        Ok(_) => debug!(task = name, "Task finished before abort"),
        Err(e) if e.is_cancelled() => debug!(task = name, "Task cancelled"),
        Err(e) => error!(task = name, error = %e, "Task panicked"),
    }
}

/// Give a task `grace` to finish on its own, then abort it
pub async fn join_or_abort<T>(mut handle: JoinHandle<T>, name: &str, grace: Duration) {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(_)) => debug!(task = name, "Task stopped"),
        Ok(Err(e)) if e.is_cancelled() => debug!(task = name, "Task cancelled"),
        Ok(Err(e)) => error!(task = name, error = %e, "Task panicked"),
        Err(_) => {
            warn!(task = name, grace_ms = grace.as_millis() as u64, "Task did not stop in time, aborting");
            stop_task(handle, name).await;
        }
    }
}
