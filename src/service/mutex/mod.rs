use std::{sync::Arc, time::Duration};

use tracing::warn;

use crate::{coordination::CoordinationStore, utils, Result};

/// Every lease lives under this prefix in the coordination store.
pub const LOCK_PREFIX: &str = "ov_meet_lock:";
/// Companion set of currently known lock names, used for observability and
/// for the lock GC jobs.
pub const LOCK_REGISTRY: &str = "ov_meet_lock_registry:";

/// A held lease. Dropping it does not release the lease; callers release
/// explicitly on every exit path, and the TTL covers crashes.
#[derive(Debug, Clone)]
pub struct Lock {
    name: String,
    token: String,
    ttl: Duration,
}

impl Lock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

pub struct Service {
    pub store: Arc<dyn CoordinationStore>,
}

impl Service {
    fn key(resource: &str) -> String {
        format!("{LOCK_PREFIX}{resource}")
    }

    /// Non-blocking attempt. `Ok(None)` means the lease is held elsewhere;
    /// callers must degrade safely and never assume the lock was granted.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lock>> {
        let token = utils::random_string(32);

        if !self.store.set_nx(&Self::key(resource), &token, ttl).await? {
            return Ok(None);
        }

        if let Err(e) = self.store.sadd(LOCK_REGISTRY, resource).await {
            // The lease itself is valid; a missing registry entry only
            // degrades observability until the next acquire.
            warn!("Could not register lock {resource}: {e}");
        }

        Ok(Some(Lock {
            name: resource.to_owned(),
            token,
            ttl,
        }))
    }

    /// Bounded retry with a fixed backoff between attempts.
    #[tracing::instrument(skip(self))]
    pub async fn acquire_with_retry(
        &self,
        resource: &str,
        ttl: Duration,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<Option<Lock>> {
        for attempt in 0..max_attempts {
            if let Some(lock) = self.acquire(resource, ttl).await? {
                return Ok(Some(lock));
            }
            if attempt + 1 < max_attempts {
                tokio::time::sleep(backoff).await;
            }
        }
        Ok(None)
    }

    /// Idempotent, token-checked release. Returns false when the lease had
    /// already expired or was taken over by another holder.
    #[tracing::instrument(skip(self, lock), fields(resource = lock.name))]
    pub async fn release(&self, lock: &Lock) -> Result<bool> {
        let released = self
            .store
            .del_if_equals(&Self::key(&lock.name), &lock.token)
            .await?;

        if released {
            if let Err(e) = self.store.srem(LOCK_REGISTRY, &lock.name).await {
                warn!("Could not deregister lock {}: {e}", lock.name);
            }
        }

        Ok(released)
    }

    /// Refreshes the lease for another `ttl`. Returns false when the lease is
    /// no longer ours, in which case the caller must abandon its critical
    /// section.
    #[tracing::instrument(skip(self, lock), fields(resource = lock.name))]
    pub async fn extend(&self, lock: &Lock, ttl: Duration) -> Result<bool> {
        self.store
            .expire_if_equals(&Self::key(&lock.name), &lock.token, ttl)
            .await
    }

    pub async fn is_held(&self, resource: &str) -> Result<bool> {
        Ok(self.store.get(&Self::key(resource)).await?.is_some())
    }

    /// All lock names currently present in the registry. Entries whose key
    /// already expired are pruned as a side effect.
    pub async fn registered_names(&self) -> Result<Vec<String>> {
        let mut held = Vec::new();
        for name in self.store.smembers(LOCK_REGISTRY).await? {
            if self.store.get(&Self::key(&name)).await?.is_some() {
                held.push(name);
            } else {
                self.store.srem(LOCK_REGISTRY, &name).await?;
            }
        }
        Ok(held)
    }

    /// Unconditional release, used only by GC jobs that have established the
    /// holder is gone.
    #[tracing::instrument(skip(self))]
    pub async fn force_release(&self, resource: &str) -> Result<()> {
        self.store.del(&Self::key(resource)).await?;
        self.store.srem(LOCK_REGISTRY, resource).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory;

    fn service() -> Service {
        Service {
            store: Arc::new(memory::Store::new()),
        }
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let mutex = service();
        let lock = mutex
            .acquire("room:abc", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(mutex
            .acquire("room:abc", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        assert!(mutex.release(&lock).await.unwrap());
        assert!(mutex
            .acquire("room:abc", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_token_checked() {
        let mutex = service();
        let lock = mutex
            .acquire("res", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(mutex.release(&lock).await.unwrap());
        assert!(!mutex.release(&lock).await.unwrap());

        // A new holder's lease survives a stale release
        let second = mutex
            .acquire("res", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(!mutex.release(&lock).await.unwrap());
        assert!(mutex.is_held("res").await.unwrap());
        assert!(mutex.release(&second).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let mutex = service();
        let _lock = mutex
            .acquire("gone", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(mutex
            .acquire("gone", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn extend_refreshes_only_own_lease() {
        let mutex = service();
        let lock = mutex
            .acquire("ext", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert!(mutex.extend(&lock, Duration::from_secs(5)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Still held thanks to the extension
        assert!(mutex.is_held("ext").await.unwrap());

        mutex.release(&lock).await.unwrap();
        assert!(!mutex.extend(&lock, Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_with_retry_wins_after_release() {
        let mutex = Arc::new(service());
        let lock = mutex
            .acquire("busy", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let contender = {
            let mutex = Arc::clone(&mutex);
            tokio::spawn(async move {
                mutex
                    .acquire_with_retry(
                        "busy",
                        Duration::from_secs(5),
                        20,
                        Duration::from_millis(10),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        mutex.release(&lock).await.unwrap();

        let won = contender.await.unwrap().unwrap();
        assert!(won.is_some());
    }

    #[tokio::test]
    async fn registry_tracks_live_locks() {
        let mutex = service();
        let lock = mutex
            .acquire("tracked", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mutex.registered_names().await.unwrap(), vec!["tracked"]);

        mutex.release(&lock).await.unwrap();
        assert!(mutex.registered_names().await.unwrap().is_empty());
    }
}
