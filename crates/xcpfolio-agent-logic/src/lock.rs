//! Coordination: in-process run exclusivity and a distributed TTL lock
//!
//! The fulfillment controller only needs in-process exclusion (its pipeline
//! is idempotent against the ledger); maintenance additionally takes a
//! distributed lock so replicas and overlapping serverless invocations
//! never compose duplicate listings.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::store::StateStore;

/// A held distributed lock. Release is holder-checked: the key is deleted
/// only if it still carries our identifier, so an expired-and-reacquired
/// lock is never released by the previous holder.
#[derive(Debug)]
pub struct DistributedLock {
    key: String,
    id: String,
}

impl DistributedLock {
    /// Try to acquire `key` for `ttl`. Returns `None` if another holder has it.
    pub async fn acquire<S: StateStore + ?Sized>(
        store: &S,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, ApiError> {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();

        if store.set_if_absent(key, id.clone(), ttl).await? {
            debug!("Acquired lock {} as {}", key, id);
            Ok(Some(Self {
                key: key.to_string(),
                id,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release the lock if we still hold it. Errors are logged, not
    /// propagated — the TTL bounds a failed release.
    pub async fn release<S: StateStore + ?Sized>(self, store: &S) {
        match store.get_fresh_raw(&self.key).await {
            Ok(Some(current)) if current == self.id => {
                if let Err(e) = store.del(&self.key).await {
                    warn!("Failed to release lock {}: {}", self.key, e);
                }
            }
            Ok(_) => {
                warn!(
                    "Lock {} no longer held by us at release; leaving it alone",
                    self.key
                );
            }
            Err(e) => warn!("Failed to check lock {} at release: {}", self.key, e),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_lock_mutual_exclusion() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        let first = DistributedLock::acquire(&store, "lock", ttl)
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(DistributedLock::acquire(&store, "lock", ttl)
            .await
            .unwrap()
            .is_none());

        first.release(&store).await;
        assert!(DistributedLock::acquire(&store, "lock", ttl)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_keeps_key() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(20);

        let stale = DistributedLock::acquire(&store, "lock", ttl)
            .await
            .unwrap()
            .unwrap();

        // Lock expires; a second holder takes it with a different id.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = DistributedLock::acquire(&store, "lock", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("expired lock is claimable");

        // The stale holder's release must not delete the fresh holder's key.
        stale.release(&store).await;
        assert_eq!(
            store.get_fresh_raw("lock").await.unwrap(),
            Some(fresh.id().to_string())
        );
    }
}
