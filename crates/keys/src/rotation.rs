//! Background key rotation
//!
//! Runs off the request path. A failed cycle only delays the next key: the
//! manager keeps signing with the key it already has.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::manager::{KeyManager, Rotation};

/// Spawn a task that checks every `check_interval` whether the signing key is
/// due for rotation. The first check runs immediately so a fresh deployment
/// has a key before the first token request.
pub fn spawn_rotation_task(
    manager: Arc<KeyManager>,
    check_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            rotation_cycle(&manager).await;
        }
    })
}

async fn rotation_cycle(manager: &KeyManager) {
    match manager.rotate().await {
        Ok(Rotation::Rotated { key_id }) => {
            debug!(key_id = %key_id, "rotation cycle installed new key")
        }
        Ok(Rotation::NotDue) => debug!("signing key not due for rotation"),
        Err(e) => {
            metrics::counter!("idbridge_key_rotations_total", "outcome" => "failed").increment(1);
            warn!(error = %e, "key rotation failed, continuing with current key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::RotationPolicy;
    use storage::{MemStorage, Storage};

    #[tokio::test(start_paused = true)]
    async fn task_installs_a_key_on_first_tick() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let manager = Arc::new(KeyManager::new(storage.clone(), RotationPolicy::default()));

        let handle = spawn_rotation_task(manager.clone(), Duration::from_secs(60));
        // Let the spawned task run its first cycle.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if !manager.jwks().await.unwrap().keys.is_empty() {
                break;
            }
        }
        handle.abort();

        assert!(storage.get_keys().await.unwrap().signing_key.is_some());
        assert_eq!(manager.jwks().await.unwrap().keys.len(), 1);
    }

    #[tokio::test]
    async fn cycle_within_period_keeps_existing_key() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let manager = KeyManager::new(storage, RotationPolicy::default());
        manager.rotate().await.unwrap();
        let before = manager.jwks().await.unwrap();

        // A cycle inside the rotation period leaves the key set alone.
        rotation_cycle(&manager).await;
        assert_eq!(manager.jwks().await.unwrap(), before);
    }
}
