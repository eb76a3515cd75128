//! Quality-of-service attribute maps
//!
//! Each store instance declares a guarantee rank per semantic attribute
//! (durability, latency class, ...). When stores are composed, the merged
//! map takes the **weakest** rank declared by any member for every
//! attribute, and an attribute declared by only one member merges to
//! [`GuaranteeRank::Unknown`]. Composition never silently assumes the
//! strongest tier's guarantee applies to the whole.

use std::collections::BTreeMap;

/// Named guarantee dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QosAttribute {
    /// Survival of process/node restarts
    Durability,
    /// Expected operation latency class
    LatencyClass,
    /// Propagation of writes to replicas
    Replication,
    /// Read-your-writes visibility
    Consistency,
}

/// Ordered guarantee rank; lower is weaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum GuaranteeRank {
    /// Not declared, or lost in composition
    #[default]
    Unknown,
    /// No guarantee beyond best effort
    Low,
    /// Holds except under faults
    Medium,
    /// Holds across the declared access scope
    High,
}

/// Per-instance `attribute -> rank` declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QosMap {
    ranks: BTreeMap<QosAttribute, GuaranteeRank>,
}

impl QosMap {
    /// Empty map: every attribute reads as `Unknown`
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a rank for an attribute
    pub fn with(mut self, attr: QosAttribute, rank: GuaranteeRank) -> Self {
        self.ranks.insert(attr, rank);
        self
    }

    /// Declared rank for an attribute, `Unknown` if absent
    pub fn rank_of(&self, attr: QosAttribute) -> GuaranteeRank {
        self.ranks.get(&attr).copied().unwrap_or_default()
    }

    /// Declared attributes, in stable order
    pub fn attributes(&self) -> impl Iterator<Item = QosAttribute> + '_ {
        self.ranks.keys().copied()
    }

    /// Lowest-common-denominator merge of two maps.
    ///
    /// Union of attributes; per attribute the weaker declared rank wins,
    /// and an attribute missing from either side merges to `Unknown`.
    pub fn merge(&self, other: &QosMap) -> QosMap {
        let mut merged = BTreeMap::new();
        for attr in self.ranks.keys().chain(other.ranks.keys()) {
            let a = self.ranks.get(attr).copied().unwrap_or_default();
            let b = other.ranks.get(attr).copied().unwrap_or_default();
            merged.insert(*attr, a.min(b));
        }
        QosMap { ranks: merged }
    }
}

// =============================================================================
// Tests
// =============================================================================
