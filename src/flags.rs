//! Advisory operation flags
//!
//! A plain bitmask attached to every read/write call. Flags are hints:
//! a backend that cannot honor one ignores it rather than failing, and a
//! router consults them to pick delegation targets.

use bitflags::bitflags;

bitflags! {
    /// Per-operation flag set, combined with bitwise OR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// Bypass any staleness-tolerant fast path (e.g. a replica read)
        const READ_LATEST = 1 << 0;
        /// Caller guarantees staleness-safety, permitting tier promotion
        const READ_VERIFIED = 1 << 1;
        /// Block until the write is durable across the access scope
        const WRITE_SYNC = 1 << 2;
        /// Affect only the fastest/in-memory tier
        const WRITE_CACHE_ONLY = 1 << 3;
        /// Permit partitioning of oversized values into chunks
        const WRITE_ALLOW_SEGMENTS = 1 << 4;
        /// On delete, also remove dependent chunks
        const WRITE_PRUNE_SEGMENTS = 1 << 5;
        /// Fire-and-forget: do not wait for the write to complete
        const WRITE_BACKGROUND = 1 << 6;
    }
}

// =============================================================================
// Tests
// =============================================================================
