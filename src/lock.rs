//! Advisory lock manager
//!
//! Mutual exclusion keyed by cache key, built only on the contract's atomic
//! `add`: the lock record lives under a derived key (the `::lock` suffix
//! cannot be produced by the key codec) with the reentry class as its value
//! and the capped expiry as its TTL. Locks are advisory (`unlock` does not
//! verify the caller is the holder) and self-expiring, so a crashed holder
//! blocks others for at most [`MAX_LOCK_EXPIRY`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;
use crate::flags::Flags;
use crate::store::CacheStore;
use crate::ttl::Ttl;

/// Hard cap on lock expiry, bounding the blast radius of a crashed holder.
pub const MAX_LOCK_EXPIRY: Duration = Duration::from_secs(86_400);

/// A scoped release this close to the lock's expiry is skipped: another
/// holder may already have re-acquired the key after expiry, and deleting
/// their record would be unsafe.
pub const RELEASE_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Initial poll interval while waiting for a contended lock.
const LOCK_POLL_START: Duration = Duration::from_millis(10);

/// Poll interval ceiling.
const LOCK_POLL_MAX: Duration = Duration::from_millis(100);

/// Derived key of the lock record for `key`.
#[inline]
pub(crate) fn lock_key(key: &str) -> String {
    format!("{key}::lock")
}

/// Acquire the advisory lock on `key`; see [`CacheStore::lock`].
pub(crate) async fn lock_on<S>(
    store: &S,
    key: &str,
    wait_timeout: Duration,
    expiry: Duration,
    reentry_class: &str,
) -> Result<bool>
where
    S: CacheStore + ?Sized,
{
    let lock_key = lock_key(key);
    let capped = expiry.min(MAX_LOCK_EXPIRY);
    let ttl = Ttl::Seconds(capped.as_secs().max(1) as i64);
    let record = Bytes::copy_from_slice(reentry_class.as_bytes());

    let deadline = Instant::now() + wait_timeout;
    let mut poll = LOCK_POLL_START;
    loop {
        if store
            .add(&lock_key, record.clone(), ttl, Flags::empty())
            .await?
        {
            return Ok(true);
        }

        // Reentrant acquisition: same non-empty class succeeds without
        // extending the expiry.
        if !reentry_class.is_empty() {
            if let Some(holder) = store.get(&lock_key, Flags::READ_LATEST).await? {
                if holder == record {
                    return Ok(true);
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        sleep(remaining.min(poll)).await;
        poll = (poll * 2).min(LOCK_POLL_MAX);
    }
}

/// Scope-bound lock acquisition: on success the returned handle must be
/// released explicitly on every exit path; `Ok(None)` means the lock was
/// not obtained within `wait_timeout`.
pub async fn scoped_lock(
    store: Arc<dyn CacheStore>,
    key: &str,
    wait_timeout: Duration,
    expiry: Duration,
) -> Result<Option<ScopedLock>> {
    let capped = expiry.min(MAX_LOCK_EXPIRY);
    if store.lock(key, wait_timeout, capped, "").await? {
        Ok(Some(ScopedLock {
            store,
            key: key.to_string(),
            acquired: Instant::now(),
            expiry: capped,
            released: false,
        }))
    } else {
        Ok(None)
    }
}

/// Release handle for a scoped lock.
///
/// Releases exactly once and is idempotent. If the holding time has come
/// within [`RELEASE_SAFETY_MARGIN`] of the lock's expiry, the underlying
/// record is **not** deleted, since it may already belong to another
/// holder; a warning is logged instead. Dropping an unreleased handle also
/// only logs a warning: the record self-expires, and an async `unlock`
/// cannot run in `Drop`.
#[must_use = "release the lock on every exit path"]
pub struct ScopedLock {
    store: Arc<dyn CacheStore>,
    key: String,
    acquired: Instant,
    expiry: Duration,
    released: bool,
}

impl ScopedLock {
    /// Key this handle guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Time this handle has held the lock.
    pub fn held_for(&self) -> Duration {
        self.acquired.elapsed()
    }

    /// Release the lock. Safe to call on an already-released handle.
    pub async fn release(mut self) -> Result<()> {
        self.release_inner().await
    }

    async fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let held = self.acquired.elapsed();
        if held + RELEASE_SAFETY_MARGIN >= self.expiry {
            warn!(
                key = %self.key,
                held_ms = held.as_millis() as u64,
                expiry_ms = self.expiry.as_millis() as u64,
                "lock held into its expiry window, skipping unlock"
            );
            return Ok(());
        }
        self.store.unlock(&self.key).await
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if !self.released {
            warn!(key = %self.key, "scoped lock dropped without release; record will self-expire");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
