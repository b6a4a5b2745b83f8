//! Corrective actions and the resolution report
//!
//! The resolver turns per-node chains into [`Action`]s against the merged
//! head tree and records, for every node the unmerged branch touched, which
//! [`Resolution`] accounts for its ops.

use serde::{Deserialize, Serialize};

use crate::object::{EntryKind, NodeAttrs, NodeId, ObjectId, RevisionId};
use crate::ops::{Attr, OpOrder};

/// What a placement attaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// A node already present in the merged tree, moved
    Existing,
    /// A node the merged tree lacks, inserted with these attributes
    Fresh(NodeAttrs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Attach `node` as `parent/name`
    Place {
        node: NodeId,
        parent: NodeId,
        name: String,
        placement: Placement,
        order: OpOrder,
    },
    /// Unlink `node` from wherever the merged tree holds it
    Remove { node: NodeId, order: OpOrder },
    Write {
        node: NodeId,
        content: ObjectId,
        size: u64,
    },
    SetAttr { node: NodeId, attr: Attr },
    SetEntryType { node: NodeId, kind: EntryKind },
    /// Keep the unmerged content of `source` as a sibling copy
    ConflictCopy {
        source: NodeId,
        copy: NodeId,
        attrs: NodeAttrs,
        order: OpOrder,
    },
    /// Link at `parent/name` standing in for a placement of `target` that
    /// would close a cycle
    Symlink {
        parent: NodeId,
        name: String,
        link: NodeId,
        target: NodeId,
        order: OpOrder,
    },
}

impl Action {
    /// Node whose state the action changes
    pub fn node(&self) -> NodeId {
        match self {
            Action::Place { node, .. }
            | Action::Remove { node, .. }
            | Action::Write { node, .. }
            | Action::SetAttr { node, .. }
            | Action::SetEntryType { node, .. } => *node,
            Action::ConflictCopy { source, .. } => *source,
            Action::Symlink { target, .. } => *target,
        }
    }

    /// A placement moving a node the merged tree already has
    pub fn is_move(&self) -> bool {
        matches!(
            self,
            Action::Place {
                placement: Placement::Existing,
                ..
            }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Action::Place {
                placement: Placement::Existing,
                ..
            } => "move",
            Action::Place { .. } => "place",
            Action::Remove { .. } => "remove",
            Action::Write { .. } => "write",
            Action::SetAttr { .. } => "setattr",
            Action::SetEntryType { .. } => "settype",
            Action::ConflictCopy { .. } => "conflict-copy",
            Action::Symlink { .. } => "symlink",
        }
    }
}

/// How the unmerged ops on a node ended up in the merged revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Replayed as-is
    Applied,
    /// Unmerged data kept under a conflict name
    ConflictCopy,
    /// A node removed on one side survives because the other side changed it
    Resurrected,
    /// Missing ancestor directory rebuilt to hold surviving unmerged nodes
    Recreated,
    /// Removed on both sides
    RemoveIdempotent,
    /// The merged branch moved the node elsewhere; that location wins
    RenameSuperseded,
    /// Unmerged attribute value replaces a different merged value
    AttributeOverride,
    /// Placement replaced by a symlink to keep the tree acyclic
    CycleBroken,
    /// Overridden by a later op or by a merged-side remove
    Moot,
    /// Directory removal skipped because the directory keeps entries
    KeptNonEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub node: NodeId,
    pub resolution: Resolution,
    pub detail: String,
}

/// Accounting for one merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub ancestor: Option<RevisionId>,
    pub merged_head: Option<RevisionId>,
    pub unmerged_head: Option<RevisionId>,
    pub merged_ops: usize,
    pub unmerged_ops: usize,
    pub records: Vec<ResolutionRecord>,
}

impl MergeReport {
    pub fn record(&mut self, node: NodeId, resolution: Resolution, detail: impl Into<String>) {
        self.records.push(ResolutionRecord {
            node,
            resolution,
            detail: detail.into(),
        });
    }

    pub fn for_node(&self, node: &NodeId) -> impl Iterator<Item = &ResolutionRecord> {
        self.records.iter().filter(move |r| r.node == *node)
    }

    pub fn has(&self, node: &NodeId, resolution: Resolution) -> bool {
        self.for_node(node).any(|r| r.resolution == resolution)
    }

    pub fn count(&self, resolution: Resolution) -> usize {
        self.records.iter().filter(|r| r.resolution == resolution).count()
    }

    /// Nothing beyond plain replay happened
    pub fn is_clean(&self) -> bool {
        self.records.iter().all(|r| r.resolution == Resolution::Applied)
    }
}

/// Actions plus the records explaining them
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub report: MergeReport,
}

impl Plan {
    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn record(&mut self, node: NodeId, resolution: Resolution, detail: impl Into<String>) {
        self.report.record(node, resolution, detail);
    }

    pub fn placement_of(&self, node: &NodeId) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| matches!(a, Action::Place { node: n, .. } if n == node))
    }

    pub fn removal_of(&self, node: &NodeId) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| matches!(a, Action::Remove { node: n, .. } if n == node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_queries() {
        let a = NodeId::derive(&[b"a"]);
        let b = NodeId::derive(&[b"b"]);
        let mut report = MergeReport::default();
        report.record(a, Resolution::Applied, "write");
        assert!(report.is_clean());
        report.record(b, Resolution::ConflictCopy, "b.conflict");
        assert!(!report.is_clean());
        assert!(report.has(&b, Resolution::ConflictCopy));
        assert_eq!(report.count(Resolution::Applied), 1);
        assert_eq!(report.for_node(&a).count(), 1);
    }

    #[test]
    fn test_plan_lookup() {
        let a = NodeId::derive(&[b"a"]);
        let mut plan = Plan::default();
        plan.push(Action::Remove {
            node: a,
            order: OpOrder::new(1, 0),
        });
        assert_eq!(plan.removal_of(&a), Some(0));
        assert_eq!(plan.placement_of(&a), None);
        assert_eq!(plan.actions[0].label(), "remove");
    }
}
