//! Per-node op chains
//!
//! Regroups the flat per-revision op logs of both branches into one chain per
//! node. An op lands in the chain of every node it touches, so a rename shows
//! up for the moved node and for both parent directories.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::object::{EntryKind, NodeId, ObjectId, Tree};
use crate::ops::{Attr, Op, OpOrder};
use crate::revision::Revision;

use super::{CrError, Result};

/// Branch an op came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Merged,
    Unmerged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedOp {
    pub order: OpOrder,
    pub op: Op,
}

/// Chains of one node on both branches, each in branch order
#[derive(Debug, Clone, Default)]
pub struct NodeChains {
    pub merged: Vec<ChainedOp>,
    pub unmerged: Vec<ChainedOp>,
}

impl NodeChains {
    pub fn side(&self, side: Side) -> &[ChainedOp] {
        match side {
            Side::Merged => &self.merged,
            Side::Unmerged => &self.unmerged,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpChains {
    nodes: BTreeMap<NodeId, NodeChains>,
}

impl OpChains {
    pub fn build(merged: &[Arc<Revision>], unmerged: &[Arc<Revision>]) -> Self {
        let mut chains = Self::default();
        chains.extend(Side::Merged, merged);
        chains.extend(Side::Unmerged, unmerged);
        chains
    }

    fn extend(&mut self, side: Side, revisions: &[Arc<Revision>]) {
        for rev in revisions {
            for (order, op) in rev.ordered_ops() {
                for node in op.nodes() {
                    let entry = self.nodes.entry(node).or_default();
                    let chain = match side {
                        Side::Merged => &mut entry.merged,
                        Side::Unmerged => &mut entry.unmerged,
                    };
                    chain.push(ChainedOp { order, op: op.clone() });
                }
            }
        }
    }

    pub fn get(&self, node: &NodeId) -> Option<&NodeChains> {
        self.nodes.get(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeChains)> {
        self.nodes.iter()
    }

    /// Nodes touched by the unmerged branch, by first unmerged op then id
    pub fn unmerged_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<(OpOrder, NodeId)> = self
            .nodes
            .iter()
            .filter_map(|(id, c)| c.unmerged.first().map(|op| (op.order, *id)))
            .collect();
        nodes.sort();
        nodes.into_iter().map(|(_, id)| id).collect()
    }

    /// Fold a node's chain on one side
    pub fn summary(&self, node: &NodeId, side: Side) -> ChainSummary {
        match self.nodes.get(node) {
            Some(chains) => ChainSummary::fold(node, chains.side(side)),
            None => ChainSummary::default(),
        }
    }

    /// Every node a chain mentions must exist at the ancestor or be created
    /// by that same chain
    pub fn validate(&self, ancestor: &Tree) -> Result<()> {
        for (id, chains) in &self.nodes {
            if ancestor.contains(id) {
                continue;
            }
            for (side, ops) in [("merged", &chains.merged), ("unmerged", &chains.unmerged)] {
                if ops.is_empty() {
                    continue;
                }
                let created = ops
                    .iter()
                    .any(|c| matches!(&c.op, Op::Create { node, .. } if node == id));
                if !created {
                    return Err(CrError::CorruptChain(format!(
                        "{} chain references node {} (first at {}) that never existed",
                        side, id, ops[0].order
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One branch's net effect on a node, last op wins within the branch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSummary {
    /// Some op targets the node itself, not only its entries
    pub touched: bool,
    pub created: bool,
    pub removed: bool,
    pub moved: bool,
    /// Latest content written (content, size)
    pub wrote: Option<(ObjectId, u64)>,
    pub executable: Option<bool>,
    pub mtime: Option<i64>,
    pub kind: Option<EntryKind>,
    /// Entries were added, removed or renamed inside this directory
    pub children_changed: bool,
    pub first: Option<OpOrder>,
    /// Order of the last create or rename that placed the node
    pub placed_at: Option<OpOrder>,
    pub removed_at: Option<OpOrder>,
}

impl ChainSummary {
    pub fn fold(node: &NodeId, ops: &[ChainedOp]) -> Self {
        let mut s = Self::default();
        for ChainedOp { order, op } in ops {
            if op.target() != *node {
                s.children_changed = true;
                continue;
            }
            s.touched = true;
            s.first.get_or_insert(*order);
            match op {
                Op::Create { attrs, .. } => {
                    s.created = true;
                    s.removed = false;
                    s.placed_at = Some(*order);
                    // A merge that resurrects a file logs its content here
                    if let Some(content) = attrs.content {
                        s.wrote = Some((content, attrs.size));
                    }
                }
                Op::Remove { .. } => {
                    s.removed = true;
                    s.removed_at = Some(*order);
                }
                Op::Rename { .. } => {
                    s.moved = true;
                    s.removed = false;
                    s.placed_at = Some(*order);
                }
                Op::Write { content, size, .. } => s.wrote = Some((*content, *size)),
                Op::SetAttr { attr, .. } => match attr {
                    Attr::Executable(exec) => s.executable = Some(*exec),
                    Attr::Mtime(mtime) => s.mtime = Some(*mtime),
                },
                Op::SetEntryType { kind, .. } => s.kind = Some(*kind),
            }
        }
        s
    }

    /// Created and removed again on the same branch
    pub fn is_moot(&self) -> bool {
        self.created && self.removed
    }

    pub fn has_attr_change(&self) -> bool {
        self.executable.is_some() || self.mtime.is_some() || self.kind.is_some()
    }

    /// Order to attach corrective actions to
    pub fn order(&self) -> OpOrder {
        self.placed_at
            .or(self.removed_at)
            .or(self.first)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{BranchId, NodeAttrs};

    fn rev(seq: u64, ops: Vec<Op>) -> Arc<Revision> {
        Arc::new(Revision::new(vec![], seq, BranchId::new("t"), 0, String::new(), ObjectId::new([0; 32]), ops))
    }

    #[test]
    fn test_rename_lands_in_three_chains() {
        let root = NodeId::root();
        let x = NodeId::derive(&[b"x"]);
        let n = NodeId::derive(&[b"n"]);
        let chains = OpChains::build(
            &[],
            &[rev(
                1,
                vec![Op::Rename {
                    old_parent: root,
                    old_name: "n".into(),
                    new_parent: x,
                    new_name: "n".into(),
                    node: n,
                }],
            )],
        );
        assert_eq!(chains.len(), 3);
        assert!(chains.summary(&n, Side::Unmerged).moved);
        let parent = chains.summary(&x, Side::Unmerged);
        assert!(parent.children_changed && !parent.touched);
        assert!(chains.summary(&n, Side::Merged) == ChainSummary::default());
    }

    #[test]
    fn test_create_then_remove_is_moot() {
        let root = NodeId::root();
        let n = NodeId::derive(&[b"n"]);
        let ops = vec![
            Op::Create {
                parent: root,
                name: "n".into(),
                node: n,
                attrs: NodeAttrs::dir(0),
            },
            Op::SetAttr {
                node: n,
                attr: Attr::Mtime(4),
            },
            Op::Remove {
                parent: root,
                name: "n".into(),
                node: n,
            },
        ];
        let chains = OpChains::build(&[], &[rev(1, ops)]);
        let s = chains.summary(&n, Side::Unmerged);
        assert!(s.is_moot());
        assert_eq!(s.mtime, Some(4));
        assert_eq!(s.first, Some(OpOrder::new(1, 0)));
        chains.validate(&Tree::new()).unwrap();
    }

    #[test]
    fn test_recreate_with_content_counts_as_write() {
        let root = NodeId::root();
        let f = NodeId::derive(&[b"f"]);
        let content = ObjectId::from_data(b"kept");
        let ops = vec![
            Op::Remove {
                parent: root,
                name: "f".into(),
                node: f,
            },
            Op::Create {
                parent: root,
                name: "f".into(),
                node: f,
                attrs: NodeAttrs::file(content, 4, 0),
            },
        ];
        let chains = OpChains::build(&[rev(1, ops)], &[]);
        let s = chains.summary(&f, Side::Merged);
        assert!(s.created && !s.removed && !s.is_moot());
        assert_eq!(s.wrote, Some((content, 4)));
    }

    #[test]
    fn test_unmerged_nodes_in_first_op_order() {
        let root = NodeId::root();
        let a = NodeId::derive(&[b"a"]);
        let b = NodeId::derive(&[b"b"]);
        let make = |node, name: &str| Op::Create {
            parent: root,
            name: name.into(),
            node,
            attrs: NodeAttrs::dir(0),
        };
        let chains = OpChains::build(&[], &[rev(1, vec![make(b, "b")]), rev(2, vec![make(a, "a")])]);
        let order = chains.unmerged_nodes();
        assert_eq!(order.len(), 3);
        let pos = |id| order.iter().position(|n| *n == id).unwrap();
        assert!(pos(b) < pos(a));
        assert!(pos(root) < pos(a));
    }

    #[test]
    fn test_unknown_node_is_corrupt() {
        let ghost = NodeId::derive(&[b"ghost"]);
        let chains = OpChains::build(
            &[],
            &[rev(
                1,
                vec![Op::SetAttr {
                    node: ghost,
                    attr: Attr::Mtime(1),
                }],
            )],
        );
        assert!(matches!(chains.validate(&Tree::new()), Err(CrError::CorruptChain(_))));
    }
}
