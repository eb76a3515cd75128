//! Cache key construction
//!
//! Keys are colon-delimited: an access-scope tag, a keyspace, then the
//! escaped components. Every segment is percent-encoded so a literal `:`
//! (or `%`) inside a component can never be confused with a delimiter;
//! two distinct component sequences therefore never escape to the same
//! string. Encoding is deterministic, so key construction is a pure
//! function of its inputs.

use std::fmt;

/// Breadth over which a store's consistency guarantees hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessScope {
    /// Single process (in-memory map)
    #[default]
    Process,
    /// Single node (local disk, shared memory)
    Node,
    /// Full cluster (shared cache service)
    Cluster,
    /// Multi-datacenter
    Global,
}

impl AccessScope {
    /// Key prefix tag for this scope
    pub fn tag(&self) -> &'static str {
        match self {
            AccessScope::Process => "local",
            AccessScope::Node => "node",
            AccessScope::Cluster => "cluster",
            AccessScope::Global => "global",
        }
    }
}

impl fmt::Display for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Escape one key segment so it cannot contain a delimiter.
#[inline]
pub fn escape_component(component: &str) -> String {
    urlencoding::encode(component).into_owned()
}

/// Build a key scoped to the given access scope.
pub fn make_key(scope: AccessScope, keyspace: &str, components: &[&str]) -> String {
    build(scope.tag(), keyspace, components)
}

/// Build a key portable across scopes (always the `global` tag).
pub fn make_global_key(keyspace: &str, components: &[&str]) -> String {
    build(AccessScope::Global.tag(), keyspace, components)
}

fn build(tag: &str, keyspace: &str, components: &[&str]) -> String {
    let mut key = String::with_capacity(tag.len() + keyspace.len() + 16 * components.len());
    key.push_str(tag);
    key.push(':');
    key.push_str(&escape_component(keyspace));
    for component in components {
        key.push(':');
        key.push_str(&escape_component(component));
    }
    key
}

// =============================================================================
// Tests
// =============================================================================
