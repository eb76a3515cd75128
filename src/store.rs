//! The cache store contract
//!
//! Every backend (in-process map, local disk, shared memory service,
//! replicated network service) plugs in by implementing [`CacheStore`].
//! Composition (tiered and fan-out routing) holds other implementations of
//! the same trait rather than subclassing, and the cross-cutting pieces
//! (batched operations, the merge engine, advisory locking, key
//! construction) are provided methods built only on the required
//! primitives, so any backend gets them for free.
//!
//! # Failure model
//!
//! Routine outcomes are `Ok` variants: a miss is `Ok(None)`, a lost `add`
//! race is `Ok(false)`, a lock wait timeout is `Ok(false)`. `Err` is
//! reserved for backend faults and programmer errors, and every `Err`
//! return is also recorded in the instance's last-error slot.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;

use crate::error::{Error, ErrorKind, Result};
use crate::flags::Flags;
use crate::key::{self, AccessScope};
use crate::qos::QosMap;
use crate::ttl::Ttl;

/// Decision returned by a merge updater.
#[derive(Debug, Clone)]
pub enum MergeUpdate {
    /// Store this value under the TTL passed to `merge`
    Set(Bytes),
    /// Store this value under an adjusted TTL
    SetWithTtl(Bytes, Ttl),
    /// Leave the entry untouched
    Skip,
}

/// Merge updater: maps the current value (or a miss) to a decision.
///
/// May be invoked more than once per `merge` call: once per retry after a
/// detected conflict, and once per member store per attempt under a
/// fan-out router. It must therefore be side-effect free.
pub type MergeFn = dyn Fn(Option<Bytes>) -> MergeUpdate + Send + Sync;

/// Outcome of a compare-and-swap commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Value committed; the token still matched
    Stored,
    /// The value changed since the token was issued
    Conflict,
    /// The key no longer holds a live value
    NotFound,
}

/// A size bound that may be absent, instead of a numeric infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeLimit {
    /// No bound declared
    #[default]
    Unlimited,
    /// Bound in bytes
    Bytes(usize),
}

impl SizeLimit {
    /// True if `len` exceeds the bound
    #[inline]
    pub fn exceeded_by(&self, len: usize) -> bool {
        match *self {
            SizeLimit::Unlimited => false,
            SizeLimit::Bytes(limit) => len > limit,
        }
    }
}

/// Uniform contract for ephemeral key/value storage.
///
/// All operations may be called concurrently from multiple tasks against
/// the same instance; implementations keep their own bookkeeping free of
/// data races. Backend I/O awaits instead of blocking the executor.
#[async_trait]
pub trait CacheStore: Send + Sync {
    // --- backend primitives ---

    /// Fetch a value. `READ_LATEST` bypasses any staleness-tolerant path.
    async fn get(&self, key: &str, flags: Flags) -> Result<Option<Bytes>>;

    /// Store a value unconditionally.
    async fn set(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<()>;

    /// Store a value only if the key holds no live value; `Ok(false)` if it
    /// does. Atomic with respect to concurrent `add` on the same backend.
    async fn add(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<bool>;

    /// Remove a key. Succeeds whether or not the key existed.
    async fn delete(&self, key: &str, flags: Flags) -> Result<()>;

    /// Update the TTL of an existing value; `Ok(false)` if the key is absent.
    async fn change_ttl(&self, key: &str, ttl: Ttl, flags: Flags) -> Result<bool>;

    /// Adjust a counter by `delta` (negative deltas saturate at zero).
    /// `Ok(None)` if the key is absent; the entry's TTL is preserved.
    async fn incr(&self, key: &str, delta: i64) -> Result<Option<u64>>;

    /// Adjust a counter, initializing it to `init` under `ttl` if absent.
    async fn incr_with_init(&self, key: &str, ttl: Ttl, delta: i64, init: u64) -> Result<u64>;

    /// Declared guarantee ranks for this instance.
    fn qos(&self) -> QosMap;

    /// Most recent failure code, until explicitly cleared.
    fn last_error(&self) -> Option<ErrorKind>;

    /// Clear the last-error slot.
    fn clear_last_error(&self);

    /// Record a failure in the last-error slot without surfacing it as an
    /// `Err` return. The provided engines use this for outcomes that the
    /// contract reports as `Ok(false)`, such as merge-retry exhaustion.
    fn record_last_error(&self, _error: &Error) {}

    // --- capability surface ---

    /// Value size beyond which segmentation applies, if this backend
    /// declares one.
    fn chunk_threshold(&self) -> SizeLimit {
        SizeLimit::Unlimited
    }

    /// Breadth over which this instance's guarantees hold.
    fn access_scope(&self) -> AccessScope {
        AccessScope::Process
    }

    /// Whether this backend exposes a native compare-and-swap primitive.
    fn supports_cas(&self) -> bool {
        false
    }

    /// Fetch a value together with its CAS token.
    async fn get_cas(&self, _key: &str, _flags: Flags) -> Result<Option<(Bytes, u64)>> {
        Err(Error::CasUnsupported)
    }

    /// Commit a value only if the CAS token still matches.
    async fn cas(
        &self,
        _key: &str,
        _value: Bytes,
        _token: u64,
        _ttl: Ttl,
        _flags: Flags,
    ) -> Result<CasOutcome> {
        Err(Error::CasUnsupported)
    }

    // --- provided operations ---

    /// Decrement counterpart of [`incr`](CacheStore::incr); saturates at zero.
    async fn decr(&self, key: &str, delta: i64) -> Result<Option<u64>> {
        self.incr(key, -delta).await
    }

    /// Optimistic read-modify-write with bounded retries.
    ///
    /// Commits through native CAS when the backend has one, otherwise
    /// through a lock-guarded read-modify-write. Returns `Ok(true)` when
    /// the updater's decision was applied (or it chose [`MergeUpdate::Skip`]),
    /// `Ok(false)` when `max_attempts` conflicts were exhausted.
    async fn merge(
        &self,
        key: &str,
        updater: &MergeFn,
        ttl: Ttl,
        max_attempts: u32,
        flags: Flags,
    ) -> Result<bool> {
        if self.supports_cas() {
            crate::merge::merge_with_cas(self, key, updater, ttl, max_attempts, flags).await
        } else {
            crate::merge::merge_with_lock(self, key, updater, ttl, max_attempts, flags).await
        }
    }

    /// Advisory, self-expiring mutual exclusion on `key`.
    ///
    /// Reentrant for a matching non-empty `reentry_class` (without
    /// extending the expiry). Blocks up to `wait_timeout` (zero means
    /// non-blocking); a timeout is `Ok(false)`, not an error. The expiry
    /// is capped at [`crate::lock::MAX_LOCK_EXPIRY`].
    async fn lock(
        &self,
        key: &str,
        wait_timeout: Duration,
        expiry: Duration,
        reentry_class: &str,
    ) -> Result<bool> {
        crate::lock::lock_on(self, key, wait_timeout, expiry, reentry_class).await
    }

    /// Release the advisory lock on `key`, whoever holds it.
    async fn unlock(&self, key: &str) -> Result<()> {
        self.delete(&crate::lock::lock_key(key), Flags::empty()).await
    }

    /// Batched get. Misses are omitted; backend faults propagate.
    async fn get_multi(&self, keys: &[&str], flags: Flags) -> Result<HashMap<String, Bytes>> {
        let results = join_all(keys.iter().map(|k| self.get(k, flags))).await;
        let mut found = HashMap::with_capacity(keys.len());
        for (k, r) in keys.iter().zip(results) {
            if let Some(v) = r? {
                found.insert((*k).to_string(), v);
            }
        }
        Ok(found)
    }

    /// Batched set. Never segments (to bound read amplification); succeeds
    /// only if every member write succeeded.
    async fn set_multi(&self, entries: &[(&str, Bytes)], ttl: Ttl, flags: Flags) -> Result<()> {
        let flags = flags & !Flags::WRITE_ALLOW_SEGMENTS;
        let results = join_all(
            entries
                .iter()
                .map(|(k, v)| self.set(k, v.clone(), ttl, flags)),
        )
        .await;
        for r in results {
            r?;
        }
        Ok(())
    }

    /// Batched delete; succeeds only if every member delete succeeded.
    async fn delete_multi(&self, keys: &[&str], flags: Flags) -> Result<()> {
        let results = join_all(keys.iter().map(|k| self.delete(k, flags))).await;
        for r in results {
            r?;
        }
        Ok(())
    }

    /// Batched TTL update; `Ok(true)` only if every key was present.
    async fn change_ttl_multi(&self, keys: &[&str], ttl: Ttl, flags: Flags) -> Result<bool> {
        let results = join_all(keys.iter().map(|k| self.change_ttl(k, ttl, flags))).await;
        let mut all = true;
        for r in results {
            all &= r?;
        }
        Ok(all)
    }

    // --- key construction ---

    /// Deterministic key scoped to this instance's access scope.
    fn make_key(&self, keyspace: &str, components: &[&str]) -> String {
        key::make_key(self.access_scope(), keyspace, components)
    }

    /// Deterministic key portable across access scopes.
    fn make_global_key(&self, keyspace: &str, components: &[&str]) -> String {
        key::make_global_key(keyspace, components)
    }
}

// =============================================================================
// Tests
// =============================================================================
