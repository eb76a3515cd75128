//! Merge engine - optimistic read-modify-write with bounded retries
//!
//! Backends range from "native CAS" to "no atomic primitive at all", so the
//! engine degrades gracefully: when the store exposes compare-and-swap the
//! commit is optimistic and conflicts trigger a re-read/re-invoke retry;
//! otherwise the read-modify-write runs under the advisory key lock. Either
//! way the external contract is the same, and the retry loop yields between
//! attempts instead of spinning.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::flags::Flags;
use crate::store::{CacheStore, CasOutcome, MergeFn, MergeUpdate};
use crate::ttl::Ttl;

/// How long a lock-guarded merge waits for the key lock, per attempt.
const MERGE_LOCK_WAIT: Duration = Duration::from_secs(3);

/// Expiry of the lock taken by a lock-guarded merge.
const MERGE_LOCK_EXPIRY: Duration = Duration::from_secs(6);

/// Yielding backoff between conflict retries.
fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(5u64 << attempt.min(5))
}

/// Optimistic merge over a native compare-and-swap primitive.
///
/// An absent key commits through atomic `add`; a lost `add` race or a CAS
/// conflict re-reads and re-invokes the updater, up to `max_attempts`.
pub(crate) async fn merge_with_cas<S>(
    store: &S,
    key: &str,
    updater: &MergeFn,
    ttl: Ttl,
    max_attempts: u32,
    flags: Flags,
) -> Result<bool>
where
    S: CacheStore + ?Sized,
{
    let attempts = max_attempts.max(1);
    for attempt in 0..attempts {
        if attempt > 0 {
            debug!(key, attempt, "merge conflict, retrying");
            sleep(backoff(attempt)).await;
        }

        match store.get_cas(key, flags).await? {
            Some((current, token)) => match updater(Some(current)) {
                MergeUpdate::Skip => return Ok(true),
                MergeUpdate::Set(value) => {
                    if commit_cas(store, key, value, token, ttl, flags).await? {
                        return Ok(true);
                    }
                }
                MergeUpdate::SetWithTtl(value, new_ttl) => {
                    if commit_cas(store, key, value, token, new_ttl, flags).await? {
                        return Ok(true);
                    }
                }
            },
            None => {
                let (value, new_ttl) = match updater(None) {
                    MergeUpdate::Skip => return Ok(true),
                    MergeUpdate::Set(value) => (value, ttl),
                    MergeUpdate::SetWithTtl(value, new_ttl) => (value, new_ttl),
                };
                // A lost add race means someone created the key first.
                if store.add(key, value, new_ttl, flags).await? {
                    return Ok(true);
                }
            }
        }
    }

    store.record_last_error(&Error::Conflict {
        key: key.to_string(),
        attempts,
    });
    debug!(key, attempts, "merge retries exhausted");
    Ok(false)
}

async fn commit_cas<S>(
    store: &S,
    key: &str,
    value: bytes::Bytes,
    token: u64,
    ttl: Ttl,
    flags: Flags,
) -> Result<bool>
where
    S: CacheStore + ?Sized,
{
    match store.cas(key, value, token, ttl, flags).await? {
        CasOutcome::Stored => Ok(true),
        CasOutcome::Conflict | CasOutcome::NotFound => Ok(false),
    }
}

/// Pessimistic merge for backends without compare-and-swap.
///
/// Each attempt takes the advisory key lock (non-reentrant, so concurrent
/// merges on the same key serialize), re-reads, re-invokes the updater and
/// writes. Failing to win the lock counts as a conflict attempt.
pub(crate) async fn merge_with_lock<S>(
    store: &S,
    key: &str,
    updater: &MergeFn,
    ttl: Ttl,
    max_attempts: u32,
    flags: Flags,
) -> Result<bool>
where
    S: CacheStore + ?Sized,
{
    let attempts = max_attempts.max(1);
    for attempt in 0..attempts {
        if attempt > 0 {
            debug!(key, attempt, "merge lock contended, retrying");
            sleep(backoff(attempt)).await;
        }

        if !store.lock(key, MERGE_LOCK_WAIT, MERGE_LOCK_EXPIRY, "").await? {
            continue;
        }

        // Re-read under the lock, bypassing stale fast paths.
        let result = match store.get(key, flags | Flags::READ_LATEST).await {
            Ok(current) => match updater(current) {
                MergeUpdate::Skip => Ok(true),
                MergeUpdate::Set(value) => store.set(key, value, ttl, flags).await.map(|_| true),
                MergeUpdate::SetWithTtl(value, new_ttl) => {
                    store.set(key, value, new_ttl, flags).await.map(|_| true)
                }
            },
            Err(e) => Err(e),
        };

        if let Err(e) = store.unlock(key).await {
            warn!(key, error = %e, "failed to release merge lock");
            if result.is_ok() {
                return Err(e);
            }
        }
        return result;
    }

    store.record_last_error(&Error::Conflict {
        key: key.to_string(),
        attempts,
    });
    debug!(key, attempts, "merge lock attempts exhausted");
    Ok(false)
}

// =============================================================================
// Tests
// =============================================================================
