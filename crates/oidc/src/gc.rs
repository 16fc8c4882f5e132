//! Background garbage collection of expired records

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use storage::Storage;
use tracing::{debug, info, warn};

/// Spawn a task that purges expired authorization requests, codes and
/// refresh tokens every `interval`. The store already hides expired records
/// from reads, so a skipped cycle only delays reclaiming space.
pub fn spawn_gc_task(storage: Arc<dyn Storage>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Nothing has expired yet at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            gc_cycle(storage.as_ref()).await;
        }
    })
}

async fn gc_cycle(storage: &dyn Storage) {
    match storage.garbage_collect(Utc::now()).await {
        Ok(result) if result.is_empty() => debug!("garbage collection found nothing to remove"),
        Ok(result) => info!(
            auth_requests = result.auth_requests,
            auth_codes = result.auth_codes,
            refresh_tokens = result.refresh_tokens,
            "garbage collection removed expired records"
        ),
        Err(e) => warn!(error = %e, "garbage collection failed"),
    }
}
