//! Lease-based scoped mutual exclusion
//!
//! A lock is a transient store entry `<resource>.lock` holding a per-acquire
//! owner token with a millisecond TTL. Acquisition is a bounded retry loop
//! over `SET NX PX`; release is an atomic compare-and-delete on the owner
//! token, so a guard whose lease already expired (and was possibly taken by
//! another owner) never deletes a lease it does not hold.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::error::{PhononError, Result};
use crate::store::SharedStore;

/// Tunables for a lock acquisition.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease TTL; the lock disappears this long after acquisition even if
    /// the holder never releases.
    pub ttl: Duration,

    /// Sleep between attempts while blocking.
    pub retry_interval: Duration,

    /// Total time to keep retrying. Zero means a single non-blocking attempt.
    pub blocking_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1800),
            retry_interval: Duration::from_millis(500),
            blocking_timeout: Duration::from_secs(500),
        }
    }
}

/// Outcome of a lock acquisition attempt.
pub enum Acquisition {
    /// The lease was taken; release it through the guard.
    Acquired(LockGuard),
    /// The lease was held by another owner for the whole blocking window.
    TimedOut,
}

impl Acquisition {
    /// Unwrap into a guard, mapping a timeout to [`PhononError::AlreadyLocked`]
    /// for callers that treat contention as an error.
    pub fn into_guard(self) -> Result<LockGuard> {
        match self {
            Acquisition::Acquired(guard) => Ok(guard),
            Acquisition::TimedOut => Err(PhononError::AlreadyLocked(
                "lock acquisition timed out".to_string(),
            )),
        }
    }

    /// Whether the lease was acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }
}

/// Lock acquisition entry points.
pub struct Lock;

impl Lock {
    /// Acquire the lease on `<resource>.lock`.
    ///
    /// Retries every `retry_interval` until `blocking_timeout` elapses.
    /// A zero timeout makes exactly one attempt.
    pub async fn acquire(
        store: Arc<dyn SharedStore>,
        resource: &str,
        opts: &LockOptions,
    ) -> Result<Acquisition> {
        let lock_key = format!("{}.lock", resource);
        let token = Uuid::new_v4().to_string();
        let ttl_ms = opts.ttl.as_millis() as u64;
        let deadline = Instant::now() + opts.blocking_timeout;

        loop {
            if store.set_nx_px(&lock_key, &token, ttl_ms).await? {
                return Ok(Acquisition::Acquired(LockGuard {
                    store,
                    lock_key,
                    token,
                    released: false,
                }));
            }
            if opts.blocking_timeout.is_zero() || Instant::now() >= deadline {
                return Ok(Acquisition::TimedOut);
            }
            tokio::time::sleep(opts.retry_interval).await;
        }
    }
}

/// An acquired lease. Dropping the guard releases best-effort; call
/// [`LockGuard::release`] to observe release errors.
pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    lock_key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_key", &self.lock_key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// The owner token stored in the lease.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The lease key.
    pub fn key(&self) -> &str {
        &self.lock_key
    }

    /// Release the lease. Deletes the entry only while it still holds this
    /// guard's token; a missing key or a foreign token is a no-op success.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.del_if_equals(&self.lock_key, &self.token).await?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.del_if_equals(&lock_key, &token).await {
                    warn!(key = %lock_key, error = %e, "failed to release dropped lock");
                }
            });
        }
        // Without a runtime the lease simply expires at its TTL.
    }
}
