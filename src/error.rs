//! Error types for the cache abstraction layer
//!
//! Routine cache outcomes (a miss, a lost `add` race, a lock wait that
//! timed out) are **not** errors; they come back as `Ok(None)` / `Ok(false)`.
//! The [`Error`] enum covers backend faults and programmer errors only, so
//! call sites can treat `Err` as "degrade to the source of truth".

use parking_lot::Mutex;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a cache store or router
#[derive(Error, Debug)]
pub enum Error {
    /// Backend transiently unreachable or refused the operation
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Compare-and-swap or merge contention not resolved within the retry bound
    #[error("merge conflict on key {key} after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    /// Missing or contradictory configuration (fatal at construction)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Value too large even after segmentation, or too many chunks
    #[error("capacity exceeded: {size} bytes over limit {limit}")]
    CapacityExceeded { size: usize, limit: usize },

    /// Backend does not expose a compare-and-swap primitive
    #[error("backend does not support compare-and-swap")]
    CasUnsupported,

    /// Stored value is not usable for the requested operation
    /// (e.g. a non-numeric value handed to a counter op)
    #[error("bad value under key {key}")]
    BadValue { key: String },

    /// I/O error from a backend driver
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Collapse to the copyable failure code kept in the last-error slot
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Error::CasUnsupported => ErrorKind::InvalidConfig,
            Error::BadValue { .. } => ErrorKind::BadValue,
            Error::Io(_) => ErrorKind::BackendUnavailable,
        }
    }
}

/// Copyable failure code for the per-instance last-error registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient backend fault; retryable
    BackendUnavailable,
    /// CAS/merge contention exhausted its retry budget
    Conflict,
    /// Programmer error: bad arguments or missing configuration
    InvalidConfig,
    /// Value or chunk count over the declared limit
    CapacityExceeded,
    /// Stored value unusable for the requested operation
    BadValue,
}

/// Last-operation-failure slot, one per store instance.
///
/// Recorded on every `Err` return and held until the caller clears it
/// explicitly; a later success does **not** clear it. Concurrent calls on
/// the same instance race on this slot, so per-call error attribution must
/// use the operation's `Result` instead.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: Mutex<Option<ErrorKind>>,
}

impl ErrorSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the failure code of an error
    pub fn record(&self, err: &Error) {
        *self.last.lock() = Some(err.kind());
    }

    /// Read the most recent failure code, if any
    pub fn get(&self) -> Option<ErrorKind> {
        *self.last.lock()
    }

    /// Clear the slot
    pub fn clear(&self) {
        *self.last.lock() = None;
    }

    /// Record the error of a failed result and pass the result through
    pub fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            self.record(e);
        }
        result
    }
}

// =============================================================================
// Tests
// =============================================================================
