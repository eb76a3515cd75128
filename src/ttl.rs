//! Entry lifetime specification
//!
//! Callers hand TTLs in three shapes: "never expire", a relative duration
//! in seconds, or an absolute unix timestamp. Wire-compatible callers that
//! only carry a raw integer go through [`Ttl::from_raw`], which uses a fixed
//! 30-day cutoff to disambiguate: `0` means indefinite, values up to the
//! cutoff are seconds-from-now, anything larger is an absolute timestamp.
//! A non-positive relative value resolves to "already expired".

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Raw TTL values at or below this are relative seconds; above, unix timestamps.
pub const TTL_RAW_CUTOFF: i64 = 30 * 24 * 3600;

/// Entry lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Live until deleted or evicted
    Indefinite,
    /// Relative seconds from the moment of the write; `<= 0` is already expired
    Seconds(i64),
    /// Absolute expiry as a unix timestamp in seconds
    At(u64),
}

impl Ttl {
    /// Disambiguate a raw integer TTL using the fixed 30-day cutoff.
    pub fn from_raw(raw: i64) -> Self {
        if raw == 0 {
            Ttl::Indefinite
        } else if raw > TTL_RAW_CUTOFF {
            Ttl::At(raw as u64)
        } else {
            Ttl::Seconds(raw)
        }
    }

    /// Relative TTL from a duration.
    pub fn from_duration(d: Duration) -> Self {
        Ttl::Seconds(d.as_secs() as i64)
    }

    /// Resolve to an absolute expiry instant; `None` means "never expires".
    pub fn expires_at(&self, now: SystemTime) -> Option<SystemTime> {
        match *self {
            Ttl::Indefinite => None,
            Ttl::Seconds(s) if s > 0 => Some(now + Duration::from_secs(s as u64)),
            // Non-positive relative TTL: already expired.
            Ttl::Seconds(_) => Some(UNIX_EPOCH),
            Ttl::At(ts) => Some(UNIX_EPOCH + Duration::from_secs(ts)),
        }
    }

    /// True if a value written now with this TTL would be dead on arrival.
    pub fn expired_on_write(&self, now: SystemTime) -> bool {
        match self.expires_at(now) {
            Some(at) => now >= at,
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
