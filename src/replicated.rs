//! Tiered router for asymmetric read/write backends
//!
//! [`ReplicatedStore`] composes exactly one write-store and one read-store
//! (e.g. a primary and a replica). Every mutating operation goes to the
//! write-store; reads go to the read-store unless `READ_LATEST` asks to
//! bypass replication lag, in which case they go to the write-store too.
//! The composition's QoS map is the weakest-rank merge of both members.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::flags::Flags;
use crate::key::AccessScope;
use crate::qos::QosMap;
use crate::store::{CacheStore, CasOutcome, MergeFn, SizeLimit};
use crate::ttl::Ttl;

/// Write-to-one / read-from-another router
pub struct ReplicatedStore {
    write: Arc<dyn CacheStore>,
    read: Arc<dyn CacheStore>,
}

impl ReplicatedStore {
    /// Compose a write-store and a read-store.
    pub fn new(write: Arc<dyn CacheStore>, read: Arc<dyn CacheStore>) -> Self {
        Self { write, read }
    }

    #[inline]
    fn read_target(&self, flags: Flags) -> &Arc<dyn CacheStore> {
        if flags.contains(Flags::READ_LATEST) {
            &self.write
        } else {
            &self.read
        }
    }
}

#[async_trait]
impl CacheStore for ReplicatedStore {
    async fn get(&self, key: &str, flags: Flags) -> Result<Option<Bytes>> {
        self.read_target(flags).get(key, flags).await
    }

    async fn get_multi(&self, keys: &[&str], flags: Flags) -> Result<HashMap<String, Bytes>> {
        self.read_target(flags).get_multi(keys, flags).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<()> {
        self.write.set(key, value, ttl, flags).await
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<bool> {
        self.write.add(key, value, ttl, flags).await
    }

    async fn delete(&self, key: &str, flags: Flags) -> Result<()> {
        self.write.delete(key, flags).await
    }

    async fn change_ttl(&self, key: &str, ttl: Ttl, flags: Flags) -> Result<bool> {
        self.write.change_ttl(key, ttl, flags).await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<u64>> {
        self.write.incr(key, delta).await
    }

    async fn incr_with_init(&self, key: &str, ttl: Ttl, delta: i64, init: u64) -> Result<u64> {
        self.write.incr_with_init(key, ttl, delta, init).await
    }

    async fn set_multi(&self, entries: &[(&str, Bytes)], ttl: Ttl, flags: Flags) -> Result<()> {
        self.write.set_multi(entries, ttl, flags).await
    }

    async fn delete_multi(&self, keys: &[&str], flags: Flags) -> Result<()> {
        self.write.delete_multi(keys, flags).await
    }

    async fn change_ttl_multi(&self, keys: &[&str], ttl: Ttl, flags: Flags) -> Result<bool> {
        self.write.change_ttl_multi(keys, ttl, flags).await
    }

    // Merge and locking run entirely on the write-store, so their
    // read-modify-write cycles see their own writes.
    async fn merge(
        &self,
        key: &str,
        updater: &MergeFn,
        ttl: Ttl,
        max_attempts: u32,
        flags: Flags,
    ) -> Result<bool> {
        self.write.merge(key, updater, ttl, max_attempts, flags).await
    }

    async fn lock(
        &self,
        key: &str,
        wait_timeout: Duration,
        expiry: Duration,
        reentry_class: &str,
    ) -> Result<bool> {
        self.write.lock(key, wait_timeout, expiry, reentry_class).await
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.write.unlock(key).await
    }

    fn supports_cas(&self) -> bool {
        self.write.supports_cas()
    }

    async fn get_cas(&self, key: &str, flags: Flags) -> Result<Option<(Bytes, u64)>> {
        self.write.get_cas(key, flags).await
    }

    async fn cas(
        &self,
        key: &str,
        value: Bytes,
        token: u64,
        ttl: Ttl,
        flags: Flags,
    ) -> Result<CasOutcome> {
        self.write.cas(key, value, token, ttl, flags).await
    }

    fn qos(&self) -> QosMap {
        self.write.qos().merge(&self.read.qos())
    }

    fn last_error(&self) -> Option<ErrorKind> {
        self.write.last_error().or_else(|| self.read.last_error())
    }

    fn clear_last_error(&self) {
        self.write.clear_last_error();
        self.read.clear_last_error();
    }

    fn record_last_error(&self, error: &Error) {
        self.write.record_last_error(error);
    }

    fn chunk_threshold(&self) -> SizeLimit {
        self.write.chunk_threshold()
    }

    fn access_scope(&self) -> AccessScope {
        self.write.access_scope()
    }
}

// =============================================================================
// Tests
// =============================================================================
