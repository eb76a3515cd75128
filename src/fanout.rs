//! Fan-out router for multi-write replication
//!
//! [`FanoutStore`] composes an ordered list of stores. Writes propagate to
//! every member (continuing past failures to maximize eventual consistency,
//! while still reporting the first failure) and reads are satisfied from
//! the first member, falling back through the rest in order on a miss.
//! That read fallback is a deliberate policy choice (no write-back
//! promotion happens); callers that need strict first-tier reads should
//! address that member directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, ErrorKind, ErrorSlot, Result};
use crate::flags::Flags;
use crate::key::AccessScope;
use crate::qos::QosMap;
use crate::store::{CacheStore, MergeFn, SizeLimit};
use crate::ttl::Ttl;

/// Multi-write router over an ordered store list
pub struct FanoutStore {
    stores: Vec<Arc<dyn CacheStore>>,
    errors: ErrorSlot,
}

impl std::fmt::Debug for FanoutStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutStore")
            .field("stores", &self.stores.len())
            .field("errors", &self.errors)
            .finish()
    }
}

impl FanoutStore {
    /// Compose an ordered, non-empty list of stores; the first member is
    /// the read-primary and the `WRITE_CACHE_ONLY` target.
    pub fn new(stores: Vec<Arc<dyn CacheStore>>) -> Result<Self> {
        if stores.is_empty() {
            return Err(Error::InvalidConfig(
                "fan-out router requires at least one store".into(),
            ));
        }
        Ok(Self {
            stores,
            errors: ErrorSlot::new(),
        })
    }

    /// Members a write applies to under the given flags.
    #[inline]
    fn write_targets(&self, flags: Flags) -> &[Arc<dyn CacheStore>] {
        if flags.contains(Flags::WRITE_CACHE_ONLY) {
            &self.stores[..1]
        } else {
            &self.stores
        }
    }

    fn fold_error(&self, first_err: Option<Error>) -> Result<()> {
        match first_err {
            Some(e) => self.errors.track(Err(e)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CacheStore for FanoutStore {
    async fn get(&self, key: &str, flags: Flags) -> Result<Option<Bytes>> {
        let mut first_err = None;
        for store in &self.stores {
            match store.get(key, flags).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => continue,
                Err(e) => {
                    debug!(key, error = %e, "fan-out member read failed, trying next");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => self.errors.track(Err(e)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<()> {
        if flags.contains(Flags::WRITE_BACKGROUND) {
            let stores = self.write_targets(flags).to_vec();
            let key = key.to_string();
            let flags = flags & !Flags::WRITE_BACKGROUND;
            tokio::spawn(async move {
                for store in stores {
                    if let Err(e) = store.set(&key, value.clone(), ttl, flags).await {
                        debug!(key = %key, error = %e, "background fan-out set failed");
                    }
                }
            });
            return Ok(());
        }

        let mut first_err = None;
        for store in self.write_targets(flags) {
            if let Err(e) = store.set(key, value.clone(), ttl, flags).await {
                debug!(key, error = %e, "fan-out member set failed, continuing");
                first_err.get_or_insert(e);
            }
        }
        self.fold_error(first_err)
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<bool> {
        let mut first_err = None;
        let mut all_added = true;
        for store in self.write_targets(flags) {
            match store.add(key, value.clone(), ttl, flags).await {
                Ok(added) => all_added &= added,
                Err(e) => {
                    debug!(key, error = %e, "fan-out member add failed, continuing");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => self.errors.track(Err(e)),
            None => Ok(all_added),
        }
    }

    async fn delete(&self, key: &str, flags: Flags) -> Result<()> {
        if flags.contains(Flags::WRITE_BACKGROUND) {
            let stores = self.write_targets(flags).to_vec();
            let key = key.to_string();
            let flags = flags & !Flags::WRITE_BACKGROUND;
            tokio::spawn(async move {
                for store in stores {
                    if let Err(e) = store.delete(&key, flags).await {
                        debug!(key = %key, error = %e, "background fan-out delete failed");
                    }
                }
            });
            return Ok(());
        }

        let mut first_err = None;
        for store in self.write_targets(flags) {
            if let Err(e) = store.delete(key, flags).await {
                debug!(key, error = %e, "fan-out member delete failed, continuing");
                first_err.get_or_insert(e);
            }
        }
        self.fold_error(first_err)
    }

    async fn change_ttl(&self, key: &str, ttl: Ttl, flags: Flags) -> Result<bool> {
        let mut first_err = None;
        let mut all_present = true;
        for store in self.write_targets(flags) {
            match store.change_ttl(key, ttl, flags).await {
                Ok(present) => all_present &= present,
                Err(e) => {
                    debug!(key, error = %e, "fan-out member change_ttl failed, continuing");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => self.errors.track(Err(e)),
            None => Ok(all_present),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<u64>> {
        let mut first_err = None;
        let mut primary = None;
        for (i, store) in self.stores.iter().enumerate() {
            match store.incr(key, delta).await {
                Ok(value) => {
                    if i == 0 {
                        primary = value;
                    }
                }
                Err(e) => {
                    debug!(key, error = %e, "fan-out member incr failed, continuing");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => self.errors.track(Err(e)),
            None => Ok(primary),
        }
    }

    async fn incr_with_init(&self, key: &str, ttl: Ttl, delta: i64, init: u64) -> Result<u64> {
        let mut first_err = None;
        let mut primary = init;
        for (i, store) in self.stores.iter().enumerate() {
            match store.incr_with_init(key, ttl, delta, init).await {
                Ok(value) => {
                    if i == 0 {
                        primary = value;
                    }
                }
                Err(e) => {
                    debug!(key, error = %e, "fan-out member incr failed, continuing");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => self.errors.track(Err(e)),
            None => Ok(primary),
        }
    }

    /// Merge delegates to each member in order, so the updater runs once
    /// per member per attempt; it must be side-effect free.
    async fn merge(
        &self,
        key: &str,
        updater: &MergeFn,
        ttl: Ttl,
        max_attempts: u32,
        flags: Flags,
    ) -> Result<bool> {
        let mut first_err = None;
        let mut all_applied = true;
        for store in self.write_targets(flags) {
            match store.merge(key, updater, ttl, max_attempts, flags).await {
                Ok(applied) => all_applied &= applied,
                Err(e) => {
                    debug!(key, error = %e, "fan-out member merge failed, continuing");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => self.errors.track(Err(e)),
            None => Ok(all_applied),
        }
    }

    /// Locks live on the primary member only. Fanning the lock record out
    /// would let two contenders each win a different member, leaving both
    /// with a failed acquisition and stranded records on the rest.
    async fn lock(
        &self,
        key: &str,
        wait_timeout: Duration,
        expiry: Duration,
        reentry_class: &str,
    ) -> Result<bool> {
        self.errors.track(
            self.stores[0]
                .lock(key, wait_timeout, expiry, reentry_class)
                .await,
        )
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.errors.track(self.stores[0].unlock(key).await)
    }

    fn qos(&self) -> QosMap {
        let mut merged = self.stores[0].qos();
        for store in &self.stores[1..] {
            merged = merged.merge(&store.qos());
        }
        merged
    }

    fn last_error(&self) -> Option<ErrorKind> {
        self.errors
            .get()
            .or_else(|| self.stores.iter().find_map(|s| s.last_error()))
    }

    fn clear_last_error(&self) {
        self.errors.clear();
        for store in &self.stores {
            store.clear_last_error();
        }
    }

    fn record_last_error(&self, error: &Error) {
        self.errors.record(error);
    }

    fn chunk_threshold(&self) -> SizeLimit {
        // Weakest member bound governs the composition.
        let mut limit = SizeLimit::Unlimited;
        for store in &self.stores {
            limit = match (limit, store.chunk_threshold()) {
                (SizeLimit::Unlimited, other) => other,
                (current, SizeLimit::Unlimited) => current,
                (SizeLimit::Bytes(a), SizeLimit::Bytes(b)) => SizeLimit::Bytes(a.min(b)),
            };
        }
        limit
    }

    fn access_scope(&self) -> AccessScope {
        self.stores[0].access_scope()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConfig, MemoryStore};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn fanout_pair() -> (Arc<MemoryStore>, Arc<MemoryStore>, FanoutStore) {
        let first = Arc::new(MemoryStore::new());
        let second = Arc::new(MemoryStore::new());
        let fanout = FanoutStore::new(vec![first.clone(), second.clone()]).unwrap();
        (first, second, fanout)
    }

    #[test]
    fn test_empty_store_list_is_fatal() {
        let err = FanoutStore::new(vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_writes_propagate_to_all_members() {
        let (first, second, fanout) = fanout_pair();
        fanout.set("k", b("v"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        assert_eq!(first.get("k", Flags::empty()).await.unwrap(), Some(b("v")));
        assert_eq!(second.get("k", Flags::empty()).await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_read_falls_back_through_members() {
        let (_, second, fanout) = fanout_pair();
        second.set("k", b("only-here"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        assert_eq!(fanout.get("k", Flags::empty()).await.unwrap(), Some(b("only-here")));
        assert_eq!(fanout.get("missing", Flags::empty()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_cache_only_hits_first_member() {
        let (first, second, fanout) = fanout_pair();
        fanout
            .set("k", b("v"), Ttl::Indefinite, Flags::WRITE_CACHE_ONLY)
            .await
            .unwrap();

        assert_eq!(first.get("k", Flags::empty()).await.unwrap(), Some(b("v")));
        assert_eq!(second.get("k", Flags::empty()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_background_write_lands_eventually() {
        let (first, second, fanout) = fanout_pair();
        fanout
            .set("k", b("v"), Ttl::Indefinite, Flags::WRITE_BACKGROUND)
            .await
            .unwrap();

        // Poll for the spawned write to complete.
        for _ in 0..50 {
            if first.get("k", Flags::empty()).await.unwrap().is_some()
                && second.get("k", Flags::empty()).await.unwrap().is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background write never landed");
    }

    #[tokio::test]
    async fn test_delete_propagates() {
        let (first, second, fanout) = fanout_pair();
        fanout.set("k", b("v"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        fanout.delete("k", Flags::empty()).await.unwrap();

        assert_eq!(first.get("k", Flags::empty()).await.unwrap(), None);
        assert_eq!(second.get("k", Flags::empty()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_merge_applies_per_member() {
        let (first, second, fanout) = fanout_pair();
        // Members diverge before the merge.
        first.set("k", b("a"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        let updater = |current: Option<Bytes>| {
            let mut out = current.map(|v| v.to_vec()).unwrap_or_default();
            out.push(b'!');
            crate::store::MergeUpdate::Set(Bytes::from(out))
        };
        assert!(fanout
            .merge("k", &updater, Ttl::Indefinite, 3, Flags::empty())
            .await
            .unwrap());

        // The updater ran once against each member's own state.
        assert_eq!(first.get("k", Flags::empty()).await.unwrap(), Some(b("a!")));
        assert_eq!(second.get("k", Flags::empty()).await.unwrap(), Some(b("!")));
    }

    #[tokio::test]
    async fn test_counters_report_primary_value() {
        let (first, second, fanout) = fanout_pair();
        // First member already has a higher count.
        first.set("n", b("10"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        second.set("n", b("1"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        assert_eq!(fanout.incr("n", 1).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_chunk_threshold_is_weakest_member() {
        use crate::store::SizeLimit;
        let small = Arc::new(MemoryStore::with_config(MemoryConfig {
            chunk_threshold: SizeLimit::Bytes(64),
            ..MemoryConfig::default()
        }));
        let large = Arc::new(MemoryStore::with_config(MemoryConfig {
            chunk_threshold: SizeLimit::Bytes(4096),
            ..MemoryConfig::default()
        }));
        let fanout = FanoutStore::new(vec![large, small]).unwrap();
        assert_eq!(fanout.chunk_threshold(), SizeLimit::Bytes(64));
    }

    #[tokio::test]
    async fn test_locks_live_on_primary_member_only() {
        let (first, second, fanout) = fanout_pair();
        assert!(fanout
            .lock("k", Duration::ZERO, Duration::from_secs(5), "X")
            .await
            .unwrap());

        // Held on the primary, free on the rest.
        assert!(!first
            .lock("k", Duration::ZERO, Duration::from_secs(5), "Y")
            .await
            .unwrap());
        assert!(second
            .lock("k2", Duration::ZERO, Duration::from_secs(5), "Y")
            .await
            .unwrap());
        assert!(second
            .get(&crate::lock::lock_key("k"), Flags::empty())
            .await
            .unwrap()
            .is_none());

        fanout.unlock("k").await.unwrap();
        assert!(first
            .lock("k", Duration::ZERO, Duration::from_secs(5), "Y")
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lock_has_single_winner() {
        let (first, second, fanout) = fanout_pair();
        let fanout = Arc::new(fanout);

        let mut handles = Vec::new();
        for class in ["A", "B", "C", "D"] {
            let fanout = fanout.clone();
            handles.push(tokio::spawn(async move {
                fanout
                    .lock("k", Duration::ZERO, Duration::from_secs(5), class)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        // Losers leave no stranded records on any member.
        assert!(first
            .get(&crate::lock::lock_key("k"), Flags::empty())
            .await
            .unwrap()
            .is_some());
        assert!(second
            .get(&crate::lock::lock_key("k"), Flags::empty())
            .await
            .unwrap()
            .is_none());

        // The key stays unlockable.
        fanout.unlock("k").await.unwrap();
        assert!(fanout
            .lock("k", Duration::ZERO, Duration::from_secs(5), "E")
            .await
            .unwrap());
    }
}
