//! Core coordination-entity identifiers shared across every component.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoordError;

/// Positive integer, unique cluster-wide. Must stay below 2^31 per the
/// identity binder's validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const MAX: u32 = 1 << 31;

    pub fn value(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for NodeId {
    type Error = CoordError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value == 0 || value >= Self::MAX {
            return Err(CoordError::Validation(format!(
                "node id {value} must be a positive integer below 2^31"
            )));
        }
        Ok(NodeId(value))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Election epoch. Advanced whenever a node starts a new election.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two lockable resource classes. Ordering here fixes the global lock
/// acquisition order required to avoid deadlock in multi-lock workflows:
/// `Doctor` locks are always acquired before `Bed` locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceKind {
    Doctor,
    Bed,
}

/// Key identifying a single lockable resource: `(kind, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: i64,
}

impl ResourceKey {
    pub fn doctor(id: i64) -> Self {
        Self { kind: ResourceKind::Doctor, id }
    }

    pub fn bed(id: i64) -> Self {
        Self { kind: ResourceKind::Bed, id }
    }

    /// Sorts a set of keys into the fixed global acquisition order
    /// (kind enum order, then id ascending) required by the lock manager.
    pub fn sort_for_acquisition(keys: &mut [ResourceKey]) {
        keys.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_zero_and_overflow() {
        assert!(NodeId::try_from(0).is_err());
        assert!(NodeId::try_from(NodeId::MAX).is_err());
        assert!(NodeId::try_from(1).is_ok());
    }

    #[test]
    fn resource_keys_sort_doctor_before_bed() {
        let mut keys = vec![ResourceKey::bed(3), ResourceKey::doctor(7), ResourceKey::doctor(2)];
        ResourceKey::sort_for_acquisition(&mut keys);
        assert_eq!(
            keys,
            vec![ResourceKey::doctor(2), ResourceKey::doctor(7), ResourceKey::bed(3)]
        );
    }
}
