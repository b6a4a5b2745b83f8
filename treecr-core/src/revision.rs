//! Revision objects
//!
//! A revision is an immutable snapshot: a tree id plus the ordered ops that
//! produced it from its first parent. Merge revisions carry a second parent,
//! the unmerged head they absorbed.

use crate::object::{BranchId, ObjectId, RevisionId};
use crate::ops::{Op, OpOrder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Parent revision IDs (empty for the initial revision)
    pub parents: Vec<RevisionId>,
    /// Position in the first-parent chain (initial revision is 0)
    pub seq: u64,
    /// Participant that produced the revision
    pub branch: BranchId,
    /// Commit timestamp (Unix seconds)
    pub timestamp: i64,
    pub message: String,
    /// Tree snapshot for this revision
    pub tree_id: ObjectId,
    /// Ops applied on top of the first parent
    pub ops: Vec<Op>,
}

impl Revision {
    pub fn new(
        parents: Vec<RevisionId>,
        seq: u64,
        branch: BranchId,
        timestamp: i64,
        message: String,
        tree_id: ObjectId,
        ops: Vec<Op>,
    ) -> Self {
        Self {
            parents,
            seq,
            branch,
            timestamp,
            message,
            tree_id,
            ops,
        }
    }

    /// Compute the object ID
    pub fn id(&self) -> RevisionId {
        ObjectId::from_data(&bincode::serialize(self).unwrap_or_default())
    }

    /// Serialize to binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary format
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn is_initial(&self) -> bool {
        self.parents.is_empty()
    }

    /// True for revisions published by conflict resolution
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn first_parent(&self) -> Option<RevisionId> {
        self.parents.first().copied()
    }

    /// Ops paired with their branch-wide order
    pub fn ordered_ops(&self) -> impl Iterator<Item = (OpOrder, &Op)> {
        self.ops
            .iter()
            .enumerate()
            .map(|(i, op)| (OpOrder::new(self.seq, i as u32), op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{NodeId, Tree};
    use crate::ops::Attr;

    #[test]
    fn test_revision_serialization() {
        let rev = Revision::new(
            vec![ObjectId::new([2u8; 32])],
            3,
            BranchId::new("alice"),
            1234567890,
            "Test message".to_string(),
            Tree::new().id(),
            vec![Op::SetAttr {
                node: NodeId::root(),
                attr: Attr::Mtime(5),
            }],
        );
        let bytes = rev.to_bytes().unwrap();
        let rev2 = Revision::from_bytes(&bytes).unwrap();
        assert_eq!(rev.id(), rev2.id());
        assert!(!rev.is_merge());
        assert_eq!(rev.ordered_ops().next().map(|(o, _)| o), Some(OpOrder::new(3, 0)));
    }
}
