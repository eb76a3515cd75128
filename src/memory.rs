//! In-process cache backend
//!
//! A process-scoped [`CacheStore`] over a concurrent hash map, with native
//! compare-and-swap and lazy expiry (expired entries are treated as absent
//! on the next read and removed then, never actively swept).
//!
//! # Design
//!
//! - `DashMap` for lock-free concurrent access; `add`, `incr` and `cas`
//!   use the shard-level entry API for atomicity
//! - Per-instance monotonically increasing CAS token
//! - Atomic hit/miss/write counters, snapshot via [`MemoryStore::stats`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::error::{Error, ErrorKind, ErrorSlot, Result};
use crate::flags::Flags;
use crate::key::AccessScope;
use crate::qos::{GuaranteeRank, QosAttribute, QosMap};
use crate::store::{CacheStore, CasOutcome, SizeLimit};
use crate::ttl::Ttl;

/// Configuration for a [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Value size beyond which a segmenting wrapper should partition
    pub chunk_threshold: SizeLimit,
    /// Declared guarantee ranks
    pub qos: QosMap,
    /// Scope of this instance's guarantees
    pub access_scope: AccessScope,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: SizeLimit::Unlimited,
            // Process memory: fast and consistent, gone on restart.
            qos: QosMap::new()
                .with(QosAttribute::Durability, GuaranteeRank::Low)
                .with(QosAttribute::LatencyClass, GuaranteeRank::High)
                .with(QosAttribute::Consistency, GuaranteeRank::High),
            access_scope: AccessScope::Process,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<SystemTime>,
    cas: u64,
}

impl Entry {
    #[inline]
    fn is_live(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(at) => now < at,
            None => true,
        }
    }
}

/// Backend statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Entries currently held (live and not-yet-collected expired)
    pub entries: usize,
    /// Read hits
    pub hits: u64,
    /// Read misses
    pub misses: u64,
    /// Write operations
    pub sets: u64,
    /// Delete operations
    pub deletes: u64,
}

/// In-process cache store
pub struct MemoryStore {
    map: DashMap<String, Entry>,
    config: MemoryConfig,
    errors: ErrorSlot,
    next_cas: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_config(MemoryConfig::default())
    }
}

impl MemoryStore {
    /// Create a store with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with custom configuration
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            map: DashMap::new(),
            config,
            errors: ErrorSlot::new(),
            next_cas: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Number of held entries (live and not-yet-collected expired)
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if no entries are held
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.map.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn next_token(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn make_entry(&self, value: Bytes, ttl: Ttl, now: SystemTime) -> Entry {
        Entry {
            value,
            expires_at: ttl.expires_at(now),
            cas: self.next_token(),
        }
    }

    /// Collect a lazily observed expired entry
    fn collect_expired(&self, key: &str, now: SystemTime) {
        self.map.remove_if(key, |_, e| !e.is_live(now));
    }

    fn read(&self, key: &str) -> Option<Entry> {
        let now = SystemTime::now();
        if let Some(entry) = self.map.get(key) {
            if entry.is_live(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
        }
        self.collect_expired(key, now);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn apply_delta(current: u64, delta: i64) -> u64 {
        if delta >= 0 {
            current.saturating_add(delta as u64)
        } else {
            current.saturating_sub(delta.unsigned_abs())
        }
    }

    fn parse_counter(key: &str, value: &Bytes) -> Result<u64> {
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::BadValue {
                key: key.to_string(),
            })
    }

    #[cfg(test)]
    pub(crate) fn raw_expiry(&self, key: &str) -> Option<Option<SystemTime>> {
        self.map.get(key).map(|e| e.expires_at)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str, _flags: Flags) -> Result<Option<Bytes>> {
        // All reads are latest here: single authoritative map.
        Ok(self.read(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl, _flags: Flags) -> Result<()> {
        let now = SystemTime::now();
        self.sets.fetch_add(1, Ordering::Relaxed);
        if ttl.expired_on_write(now) {
            // Dead on arrival: equivalent to a delete.
            self.map.remove(key);
            return Ok(());
        }
        self.map
            .insert(key.to_string(), self.make_entry(value, ttl, now));
        Ok(())
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Ttl, _flags: Flags) -> Result<bool> {
        let now = SystemTime::now();
        if ttl.expired_on_write(now) {
            // Dead on arrival: nothing gets stored, but a live value under
            // the key still wins the conditional.
            if let Some(entry) = self.map.get(key) {
                if entry.is_live(now) {
                    return Ok(false);
                }
            }
            self.collect_expired(key, now);
            return Ok(true);
        }
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(self.make_entry(value, ttl, now));
                    Ok(true)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(self.make_entry(value, ttl, now));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str, _flags: Flags) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.map.remove(key);
        Ok(())
    }

    async fn change_ttl(&self, key: &str, ttl: Ttl, _flags: Flags) -> Result<bool> {
        let now = SystemTime::now();
        if ttl.expired_on_write(now) {
            return Ok(self.map.remove_if(key, |_, e| e.is_live(now)).is_some());
        }
        match self.map.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = ttl.expires_at(now);
                Ok(true)
            }
            _ => {
                self.collect_expired(key, now);
                Ok(false)
            }
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<u64>> {
        let now = SystemTime::now();
        let result = match self.map.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                let current = Self::parse_counter(key, &entry.value)?;
                let next = Self::apply_delta(current, delta);
                entry.value = Bytes::from(next.to_string());
                entry.cas = self.next_token();
                // TTL deliberately untouched.
                Ok(Some(next))
            }
            _ => {
                self.collect_expired(key, now);
                Ok(None)
            }
        };
        self.errors.track(result)
    }

    async fn incr_with_init(&self, key: &str, ttl: Ttl, delta: i64, init: u64) -> Result<u64> {
        let now = SystemTime::now();
        let result = match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let current = Self::parse_counter(key, &occupied.get().value)?;
                let next = Self::apply_delta(current, delta);
                let entry = occupied.get_mut();
                entry.value = Bytes::from(next.to_string());
                entry.cas = self.next_token();
                Ok(next)
            }
            MapEntry::Occupied(mut occupied) => {
                occupied.insert(self.make_entry(Bytes::from(init.to_string()), ttl, now));
                Ok(init)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(self.make_entry(Bytes::from(init.to_string()), ttl, now));
                Ok(init)
            }
        };
        self.errors.track(result)
    }

    fn qos(&self) -> QosMap {
        self.config.qos.clone()
    }

    fn last_error(&self) -> Option<ErrorKind> {
        self.errors.get()
    }

    fn clear_last_error(&self) {
        self.errors.clear();
    }

    fn record_last_error(&self, error: &Error) {
        self.errors.record(error);
    }

    fn chunk_threshold(&self) -> SizeLimit {
        self.config.chunk_threshold
    }

    fn access_scope(&self) -> AccessScope {
        self.config.access_scope
    }

    fn supports_cas(&self) -> bool {
        true
    }

    async fn get_cas(&self, key: &str, _flags: Flags) -> Result<Option<(Bytes, u64)>> {
        Ok(self.read(key).map(|e| (e.value, e.cas)))
    }

    async fn cas(
        &self,
        key: &str,
        value: Bytes,
        token: u64,
        ttl: Ttl,
        _flags: Flags,
    ) -> Result<CasOutcome> {
        let now = SystemTime::now();
        match self.map.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                if entry.cas != token {
                    return Ok(CasOutcome::Conflict);
                }
                *entry = self.make_entry(value, ttl, now);
                Ok(CasOutcome::Stored)
            }
            _ => {
                self.collect_expired(key, now);
                Ok(CasOutcome::NotFound)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStore::new();
        store.set("k", b("v"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_get_miss() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing", Flags::empty()).await.unwrap(), None);
        assert_eq!(store.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_add_only_when_absent() {
        let store = MemoryStore::new();
        assert!(store.add("k", b("v"), Ttl::Indefinite, Flags::empty()).await.unwrap());
        assert!(!store.add("k", b("v2"), Ttl::Indefinite, Flags::empty()).await.unwrap());
        // The original value survives the failed add.
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let store = MemoryStore::new();
        store.set("k", b("v"), Ttl::Seconds(-1), Flags::empty()).await.unwrap();
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_with_expired_ttl_never_touches_live_value() {
        let store = MemoryStore::new();
        store.set("k", b("live"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        // A dead-on-arrival add is still conditional on the live value.
        assert!(!store.add("k", b("dead"), Ttl::Seconds(-1), Flags::empty()).await.unwrap());
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), Some(b("live")));

        // On an absent key it succeeds without storing anything.
        assert!(store.add("gone", b("dead"), Ttl::Seconds(0), Flags::empty()).await.unwrap());
        assert_eq!(store.get("gone", Flags::empty()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_over_expired_entry() {
        let store = MemoryStore::new();
        store.set("k", b("old"), Ttl::At(1), Flags::empty()).await.unwrap();
        assert!(store.add("k", b("new"), Ttl::Indefinite, Flags::empty()).await.unwrap());
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), Some(b("new")));
    }

    #[tokio::test]
    async fn test_delete_succeeds_on_absent_key() {
        let store = MemoryStore::new();
        store.delete("missing", Flags::empty()).await.unwrap();
        store.set("k", b("v"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        store.delete("k", Flags::empty()).await.unwrap();
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_change_ttl() {
        let store = MemoryStore::new();
        assert!(!store.change_ttl("k", Ttl::Seconds(60), Flags::empty()).await.unwrap());

        store.set("k", b("v"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        assert!(store.change_ttl("k", Ttl::Seconds(60), Flags::empty()).await.unwrap());
        assert!(store.raw_expiry("k").unwrap().is_some());
        // Value untouched.
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), Some(b("v")));
    }

    #[tokio::test]
    async fn test_incr_preserves_ttl() {
        let store = MemoryStore::new();
        let far = UNIX_EPOCH + Duration::from_secs(4_000_000_000);
        let ts = far.duration_since(UNIX_EPOCH).unwrap().as_secs();
        store.set("n", b("41"), Ttl::At(ts), Flags::empty()).await.unwrap();
        let before = store.raw_expiry("n").unwrap();

        assert_eq!(store.incr("n", 1).await.unwrap(), Some(42));
        assert_eq!(store.raw_expiry("n").unwrap(), before);
    }

    #[tokio::test]
    async fn test_incr_absent_key() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_non_numeric_value() {
        let store = MemoryStore::new();
        store.set("n", b("not a number"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        let err = store.incr("n", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadValue);
        assert_eq!(store.last_error(), Some(ErrorKind::BadValue));

        store.clear_last_error();
        assert_eq!(store.last_error(), None);
    }

    #[tokio::test]
    async fn test_decr_saturates_at_zero() {
        let store = MemoryStore::new();
        store.set("n", b("3"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        assert_eq!(store.decr("n", 10).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_incr_with_init() {
        let store = MemoryStore::new();
        assert_eq!(
            store.incr_with_init("n", Ttl::Indefinite, 1, 5).await.unwrap(),
            5
        );
        assert_eq!(
            store.incr_with_init("n", Ttl::Indefinite, 1, 5).await.unwrap(),
            6
        );
    }

    #[tokio::test]
    async fn test_cas_conflict() {
        let store = MemoryStore::new();
        store.set("k", b("v1"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        let (_, token) = store.get_cas("k", Flags::empty()).await.unwrap().unwrap();
        store.set("k", b("v2"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        let outcome = store
            .cas("k", b("v3"), token, Ttl::Indefinite, Flags::empty())
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
        assert_eq!(store.get("k", Flags::empty()).await.unwrap(), Some(b("v2")));
    }

    #[tokio::test]
    async fn test_cas_stored_and_not_found() {
        let store = MemoryStore::new();
        store.set("k", b("v1"), Ttl::Indefinite, Flags::empty()).await.unwrap();

        let (_, token) = store.get_cas("k", Flags::empty()).await.unwrap().unwrap();
        assert_eq!(
            store.cas("k", b("v2"), token, Ttl::Indefinite, Flags::empty()).await.unwrap(),
            CasOutcome::Stored
        );

        store.delete("k", Flags::empty()).await.unwrap();
        assert_eq!(
            store.cas("k", b("v3"), token, Ttl::Indefinite, Flags::empty()).await.unwrap(),
            CasOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_multi_ops() {
        let store = MemoryStore::new();
        store
            .set_multi(
                &[("a", b("1")), ("b", b("2"))],
                Ttl::Indefinite,
                Flags::empty(),
            )
            .await
            .unwrap();

        let found = store.get_multi(&["a", "b", "missing"], Flags::empty()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], b("1"));

        assert!(!store
            .change_ttl_multi(&["a", "missing"], Ttl::Seconds(60), Flags::empty())
            .await
            .unwrap());

        store.delete_multi(&["a", "b"], Flags::empty()).await.unwrap();
        assert!(store.get_multi(&["a", "b"], Flags::empty()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_make_key_uses_access_scope() {
        let store = MemoryStore::new();
        assert_eq!(store.make_key("ks", &["a", "b"]), "local:ks:a:b");
        assert_eq!(store.make_global_key("ks", &["a"]), "global:ks:a");
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let store = MemoryStore::new();
        store.set("k", b("v"), Ttl::Indefinite, Flags::empty()).await.unwrap();
        store.get("k", Flags::empty()).await.unwrap();
        store.get("miss", Flags::empty()).await.unwrap();
        store.delete("k", Flags::empty()).await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.deletes, 1);
    }
}
