//! StrataCache - Tiered Cache Abstraction Layer
//!
//! A uniform contract for ephemeral key/value storage over wildly different
//! physical backends (in-process map, local disk, shared memory service,
//! replicated network service), plus the policy wrappers that compose
//! multiple stores into one logical cache with routing, replication and
//! quality-of-service negotiation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Routers (hold other CacheStores)                │
//! │  ReplicatedStore (write-one / read-other)                       │
//! │  FanoutStore     (write-all / read-first-with-fallback)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  SegmentedStore  (transparent large-value partitioning)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      CacheStore contract                        │
//! │  get/set/add/delete/changeTtl · counters · multi ops            │
//! │  merge (CAS or lock-guarded)  · advisory locks · key codec      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │               Backends (MemoryStore, plug-ins...)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The merge engine and lock manager are cross-cutting: any backend gets
//! them for free as provided trait methods built only on `get`/`set`/`add`.
//! Composed stores negotiate guarantees through [`qos::QosMap`], merged to
//! the lowest common denominator, so a caller never silently assumes the
//! strongest tier's guarantee applies to the whole composition.
//!
//! # Modules
//!
//! - [`store`] - the `CacheStore` contract and flag semantics
//! - [`memory`] - in-process backend with native compare-and-swap
//! - `merge` - optimistic read-modify-write engine (crate-internal)
//! - [`lock`] - advisory, reentrant, self-expiring key locks
//! - [`segment`] - large-value segmentation codec
//! - [`replicated`] - tiered router for asymmetric read/write backends
//! - [`fanout`] - multi-write router over an ordered store list
//! - [`key`] - deterministic composite key construction
//! - [`qos`] - quality-of-service attribute maps
//! - [`ttl`] - entry lifetime specification
//! - [`flags`] - advisory operation flags
//! - [`error`] - error types and the last-error registry

pub mod error;
pub mod fanout;
pub mod flags;
pub mod key;
pub mod lock;
pub mod memory;
pub(crate) mod merge;
pub mod qos;
pub mod replicated;
pub mod segment;
pub mod store;
pub mod ttl;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result};
pub use fanout::FanoutStore;
pub use flags::Flags;
pub use key::{make_global_key, make_key, AccessScope};
pub use lock::{scoped_lock, ScopedLock, MAX_LOCK_EXPIRY};
pub use memory::{MemoryConfig, MemoryStore};
pub use qos::{GuaranteeRank, QosAttribute, QosMap};
pub use replicated::ReplicatedStore;
pub use segment::{SegmentDescriptor, SegmentedStore};
pub use store::{CacheStore, CasOutcome, MergeFn, MergeUpdate, SizeLimit};
pub use ttl::Ttl;
