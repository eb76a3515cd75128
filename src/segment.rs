//! Large-value segmentation
//!
//! [`SegmentedStore`] wraps any [`CacheStore`] and transparently partitions
//! oversized values: on `set` with `WRITE_ALLOW_SEGMENTS`, a value larger
//! than the inner store's declared chunk threshold is split into fixed-size
//! chunks under derived keys, and a descriptor is stored under the primary
//! key. Reads resolve descriptors transparently; a descriptor is never
//! returned to a caller as if it were the value, and a value with any chunk
//! missing reads as a miss, never as a partial value.
//!
//! Chunk keys derive as `"{key}#{index}"`; `#` cannot survive the key codec
//! unescaped, so derived keys cannot collide with codec-built keys.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, ErrorKind, ErrorSlot, Result};
use crate::flags::Flags;
use crate::key::AccessScope;
use crate::qos::QosMap;
use crate::store::{CacheStore, MergeFn, SizeLimit};
use crate::ttl::Ttl;

/// Marker prefix distinguishing a stored descriptor from a raw value.
const SEGMENT_MAGIC: &[u8] = b"\x00\x01SGMT";

/// Default bound on the number of chunks a single value may produce.
pub const DEFAULT_MAX_CHUNKS: usize = 1024;

/// Descriptor stored under the primary key of a segmented value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Size of the reassembled value in bytes
    pub total_size: u64,
    /// Number of dependent chunks
    pub chunk_count: u32,
    /// Chunk keys, in reassembly order
    pub chunk_keys: Vec<String>,
}

#[inline]
fn is_descriptor(raw: &[u8]) -> bool {
    raw.starts_with(SEGMENT_MAGIC)
}

fn encode_descriptor(descriptor: &SegmentDescriptor) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(SEGMENT_MAGIC.len() + 64);
    buf.extend_from_slice(SEGMENT_MAGIC);
    serde_json::to_writer(&mut buf, descriptor)
        .map_err(|e| Error::InvalidConfig(format!("descriptor encode: {e}")))?;
    Ok(Bytes::from(buf))
}

fn decode_descriptor(raw: &[u8]) -> Option<SegmentDescriptor> {
    let body = raw.strip_prefix(SEGMENT_MAGIC)?;
    serde_json::from_slice(body).ok()
}

/// Derived key of chunk `index` for `key`.
#[inline]
pub(crate) fn chunk_key(key: &str, index: usize) -> String {
    format!("{key}#{index}")
}

/// Segmentation layer over an inner store.
///
/// Batched writes never segment (bounding read amplification) and `add`
/// stores raw. `merge` reassembles, mutates and re-segments; counter
/// operations on a segmented value are rejected with `BadValue`, since the
/// contract cannot read back the remaining TTL it would have to preserve.
/// Compare-and-swap is not exposed: chunk writes cannot be committed
/// atomically, so `merge` always takes the lock-guarded path.
pub struct SegmentedStore {
    inner: Arc<dyn CacheStore>,
    max_chunks: usize,
    errors: ErrorSlot,
}

impl SegmentedStore {
    /// Wrap `inner` with the default chunk-count bound.
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self::with_max_chunks(inner, DEFAULT_MAX_CHUNKS)
    }

    /// Wrap `inner` with a custom chunk-count bound.
    pub fn with_max_chunks(inner: Arc<dyn CacheStore>, max_chunks: usize) -> Self {
        Self {
            inner,
            max_chunks: max_chunks.max(1),
            errors: ErrorSlot::new(),
        }
    }

    async fn write_segmented(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        flags: Flags,
        chunk_size: usize,
    ) -> Result<()> {
        let len = value.len();
        let chunk_size = chunk_size.max(1);
        let count = len.div_ceil(chunk_size).max(1);
        if count > self.max_chunks {
            return self.errors.track(Err(Error::CapacityExceeded {
                size: len,
                limit: self.max_chunks * chunk_size,
            }));
        }

        let inner_flags = flags & !Flags::WRITE_ALLOW_SEGMENTS;
        let chunk_keys: Vec<String> = (0..count).map(|i| chunk_key(key, i)).collect();

        let writes = chunk_keys.iter().enumerate().map(|(i, ck)| {
            let start = i * chunk_size;
            let end = ((i + 1) * chunk_size).min(len);
            self.inner.set(ck, value.slice(start..end), ttl, inner_flags)
        });
        for result in join_all(writes).await {
            self.errors.track(result)?;
        }

        // Chunks first, descriptor last: a reader never sees a descriptor
        // whose chunks were not yet written.
        let descriptor = SegmentDescriptor {
            total_size: len as u64,
            chunk_count: count as u32,
            chunk_keys,
        };
        self.errors
            .track(self.inner.set(key, encode_descriptor(&descriptor)?, ttl, inner_flags).await)
    }

    async fn resolve(
        &self,
        key: &str,
        descriptor: &SegmentDescriptor,
        flags: Flags,
    ) -> Result<Option<Bytes>> {
        let refs: Vec<&str> = descriptor.chunk_keys.iter().map(String::as_str).collect();
        let chunks = self.inner.get_multi(&refs, flags).await?;

        let mut buf = BytesMut::with_capacity(descriptor.total_size as usize);
        for ck in &descriptor.chunk_keys {
            match chunks.get(ck) {
                Some(chunk) => buf.extend_from_slice(chunk),
                None => {
                    debug!(key, chunk = %ck, "segment chunk missing, treating value as absent");
                    return Ok(None);
                }
            }
        }
        if buf.len() as u64 != descriptor.total_size {
            debug!(key, "segment size mismatch, treating value as absent");
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

#[async_trait]
impl CacheStore for SegmentedStore {
    async fn get(&self, key: &str, flags: Flags) -> Result<Option<Bytes>> {
        match self.errors.track(self.inner.get(key, flags).await)? {
            Some(raw) if is_descriptor(&raw) => match decode_descriptor(&raw) {
                Some(descriptor) => self.resolve(key, &descriptor, flags).await,
                None => {
                    debug!(key, "undecodable segment descriptor, treating value as absent");
                    Ok(None)
                }
            },
            other => Ok(other),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<()> {
        let threshold = self.inner.chunk_threshold();
        if flags.contains(Flags::WRITE_ALLOW_SEGMENTS) && threshold.exceeded_by(value.len()) {
            let chunk_size = match threshold {
                SizeLimit::Bytes(n) => n,
                SizeLimit::Unlimited => value.len(),
            };
            return self.write_segmented(key, value, ttl, flags, chunk_size).await;
        }
        if is_descriptor(&value) {
            // A raw value that happens to carry the descriptor marker is
            // stored as a single-chunk segment so it round-trips intact.
            let chunk_size = value.len().max(1);
            return self.write_segmented(key, value, ttl, flags, chunk_size).await;
        }
        self.errors.track(self.inner.set(key, value, ttl, flags).await)
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Ttl, flags: Flags) -> Result<bool> {
        // add never segments: its atomicity is the backend's.
        self.errors.track(self.inner.add(key, value, ttl, flags).await)
    }

    async fn delete(&self, key: &str, flags: Flags) -> Result<()> {
        if flags.contains(Flags::WRITE_PRUNE_SEGMENTS) {
            if let Some(raw) = self.inner.get(key, Flags::READ_LATEST).await? {
                if let Some(descriptor) = decode_descriptor(&raw) {
                    let refs: Vec<&str> =
                        descriptor.chunk_keys.iter().map(String::as_str).collect();
                    self.errors.track(self.inner.delete_multi(&refs, flags).await)?;
                }
            }
        }
        // Without the prune flag only the descriptor goes; orphaned chunks
        // stay unreachable until they expire.
        self.errors.track(self.inner.delete(key, flags).await)
    }

    async fn change_ttl(&self, key: &str, ttl: Ttl, flags: Flags) -> Result<bool> {
        if let Some(raw) = self.inner.get(key, Flags::READ_LATEST).await? {
            if let Some(descriptor) = decode_descriptor(&raw) {
                let refs: Vec<&str> = descriptor.chunk_keys.iter().map(String::as_str).collect();
                self.errors
                    .track(self.inner.change_ttl_multi(&refs, ttl, flags).await)?;
            }
        }
        self.errors.track(self.inner.change_ttl(key, ttl, flags).await)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<u64>> {
        match self.inner.get(key, Flags::READ_LATEST).await? {
            Some(raw) if is_descriptor(&raw) => {
                // The remaining TTL of a segmented value cannot be read back
                // through the contract, so any rewrite here would extend the
                // counter's lifetime. Counters must stay unsegmented.
                self.errors.track(Err(Error::BadValue {
                    key: key.to_string(),
                }))
            }
            _ => self.errors.track(self.inner.incr(key, delta).await),
        }
    }

    async fn incr_with_init(&self, key: &str, ttl: Ttl, delta: i64, init: u64) -> Result<u64> {
        match self.incr(key, delta).await? {
            Some(n) => Ok(n),
            None => self
                .errors
                .track(self.inner.incr_with_init(key, ttl, delta, init).await),
        }
    }

    /// Merge with reassembled reads and re-segmenting writes. Always the
    /// lock-guarded path: chunks cannot be committed by CAS.
    async fn merge(
        &self,
        key: &str,
        updater: &MergeFn,
        ttl: Ttl,
        max_attempts: u32,
        flags: Flags,
    ) -> Result<bool> {
        crate::merge::merge_with_lock(self, key, updater, ttl, max_attempts, flags).await
    }

    fn qos(&self) -> QosMap {
        self.inner.qos()
    }

    fn last_error(&self) -> Option<ErrorKind> {
        self.errors.get().or_else(|| self.inner.last_error())
    }

    fn clear_last_error(&self) {
        self.errors.clear();
        self.inner.clear_last_error();
    }

    fn record_last_error(&self, error: &Error) {
        self.errors.record(error);
    }

    fn chunk_threshold(&self) -> SizeLimit {
        self.inner.chunk_threshold()
    }

    fn access_scope(&self) -> AccessScope {
        self.inner.access_scope()
    }
}

// =============================================================================
// Tests
// =============================================================================
