//! Conflict detection and resolution policy
//!
//! Works node by node, in the order the unmerged branch first touched them,
//! against the merged head tree. Each node's unmerged chain is folded into a
//! [`ChainSummary`] and matched against the merged summary:
//!
//! - write / write with different content keeps the merged content in place
//!   and the unmerged content as a conflict copy
//! - a remove loses against a write from the other side
//! - a remove on both sides is idempotent
//! - a directory removal only applies if nothing keeps the directory alive
//! - a rename loses against a merged rename to a different location
//! - attribute changes are orthogonal to content; on a clash the unmerged
//!   value wins
//!
//! Nodes the unmerged branch needs but the merged tree lacks are placed fresh
//! with their unmerged attributes, recreating missing ancestor directories.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::object::{EntryKind, Location, NodeAttrs, NodeId, ObjectId, RevisionId, Tree};
use crate::ops::Attr;

use super::action::{Action, Placement, Plan, Resolution};
use super::chains::{ChainSummary, OpChains, Side};
use super::{CrError, Result};

/// Build the corrective action plan for one merge; `episode` is the unmerged
/// head and scopes the ids of nodes the merge invents
pub fn plan(chains: &OpChains, merged: &Tree, unmerged: &Tree, episode: RevisionId) -> Result<Plan> {
    Planner::new(chains, merged, unmerged, episode).run()
}

struct Planner<'a> {
    chains: &'a OpChains,
    merged: &'a Tree,
    unmerged: &'a Tree,
    episode: RevisionId,
    m_index: HashMap<NodeId, Location>,
    u_index: HashMap<NodeId, Location>,
    /// Nodes already given a fresh placement
    scheduled: HashSet<NodeId>,
    plan: Plan,
}

impl<'a> Planner<'a> {
    fn new(chains: &'a OpChains, merged: &'a Tree, unmerged: &'a Tree, episode: RevisionId) -> Self {
        Self {
            chains,
            merged,
            unmerged,
            episode,
            m_index: merged.parent_index(),
            u_index: unmerged.parent_index(),
            scheduled: HashSet::new(),
            plan: Plan::default(),
        }
    }

    fn run(mut self) -> Result<Plan> {
        for node in self.chains.unmerged_nodes() {
            let u = self.chains.summary(&node, Side::Unmerged);
            if !u.touched || self.scheduled.contains(&node) {
                continue;
            }
            let before = self.plan.report.records.len();
            self.resolve_node(node, &u)?;
            let recorded = self.plan.report.records[before..].iter().any(|r| r.node == node);
            if !recorded {
                self.plan.record(node, Resolution::Applied, "no change needed");
            }
        }
        debug!(actions = self.plan.actions.len(), records = self.plan.report.records.len(), "planned merge");
        Ok(self.plan)
    }

    fn resolve_node(&mut self, node: NodeId, u: &ChainSummary) -> Result<()> {
        let m = self.chains.summary(&node, Side::Merged);
        let in_m = self.in_merged(&node);

        if u.is_moot() {
            debug!(node = %node, "created and removed on unmerged branch");
            self.plan.record(node, Resolution::Moot, "created and removed on the unmerged branch");
            return Ok(());
        }
        if u.removed {
            return self.resolve_removal(node, u, &m, in_m);
        }
        if !self.in_unmerged(&node) {
            return Err(CrError::missing_node(node, "unmerged tree"));
        }
        if !in_m {
            return self.resolve_missing(node, u);
        }
        if u.moved {
            self.resolve_move(node, u, &m)?;
        }
        if let Some((content, size)) = u.wrote {
            self.resolve_write(node, content, size, u, &m)?;
        }
        self.resolve_attrs(node, u, &m)
    }

    fn resolve_removal(&mut self, node: NodeId, u: &ChainSummary, m: &ChainSummary, in_m: bool) -> Result<()> {
        if !in_m {
            debug!(node = %node, "removed on both branches");
            self.plan.record(node, Resolution::RemoveIdempotent, "removed on both branches");
        } else if m.wrote.is_some() {
            debug!(node = %node, "unmerged remove loses against merged write");
            self.plan.record(node, Resolution::Resurrected, "merged branch wrote it; remove skipped");
        } else if self.merged_kind(&node).is_some_and(|k| k.is_dir()) && !self.dir_will_empty(&node) {
            debug!(node = %node, "directory keeps entries; remove skipped");
            self.plan.record(node, Resolution::KeptNonEmpty, "directory still holds entries after merge");
        } else {
            self.plan.push(Action::Remove {
                node,
                order: u.order(),
            });
            self.plan.record(node, Resolution::Applied, "removed");
        }
        Ok(())
    }

    /// The unmerged branch changed a node the merged tree no longer has
    fn resolve_missing(&mut self, node: NodeId, u: &ChainSummary) -> Result<()> {
        if !(u.created || u.moved || u.wrote.is_some()) {
            debug!(node = %node, "attribute change on merged-removed node");
            self.plan.record(node, Resolution::Moot, "attribute change on a node the merged branch removed");
            return Ok(());
        }
        self.ensure_parent(node, u)?;
        let (parent, name) = self.unmerged_location(&node)?;
        let attrs = self.unmerged_attrs(&node)?;
        self.plan.push(Action::Place {
            node,
            parent,
            name: name.clone(),
            placement: Placement::Fresh(attrs),
            order: u.order(),
        });
        self.scheduled.insert(node);
        if u.created {
            self.plan.record(node, Resolution::Applied, format!("created '{}'", name));
        } else {
            debug!(node = %node, name = %name, "resurrecting merged-removed node");
            self.plan.record(
                node,
                Resolution::Resurrected,
                format!("merged branch removed it; restored as '{}'", name),
            );
        }
        Ok(())
    }

    fn resolve_move(&mut self, node: NodeId, u: &ChainSummary, m: &ChainSummary) -> Result<()> {
        let (parent, name) = self.unmerged_location(&node)?;
        let merged_loc = self.m_index.get(&node).cloned();
        if merged_loc.as_ref() == Some(&(parent, name.clone())) {
            self.plan.record(node, Resolution::Applied, "already in place");
            return Ok(());
        }
        if m.moved {
            debug!(node = %node, "unmerged rename superseded by merged rename");
            let detail = match merged_loc {
                Some((_, merged_name)) => format!("merged branch moved it to '{}'", merged_name),
                None => "merged branch moved it".to_string(),
            };
            self.plan.record(node, Resolution::RenameSuperseded, detail);
            return Ok(());
        }
        self.ensure_parent(node, u)?;
        self.plan.push(Action::Place {
            node,
            parent,
            name: name.clone(),
            placement: Placement::Existing,
            order: u.order(),
        });
        self.plan.record(node, Resolution::Applied, format!("moved to '{}'", name));
        Ok(())
    }

    fn resolve_write(
        &mut self,
        node: NodeId,
        content: ObjectId,
        size: u64,
        u: &ChainSummary,
        m: &ChainSummary,
    ) -> Result<()> {
        match m.wrote {
            Some((merged_content, _)) if merged_content == content => {
                self.plan.record(node, Resolution::Applied, "identical content on both branches");
            }
            Some(_) => {
                debug!(node = %node, "write/write conflict");
                let copy = NodeId::derive(&[
                    b"conflict",
                    node.as_bytes(),
                    content.as_bytes(),
                    self.episode.as_bytes(),
                ]);
                let attrs = self.unmerged_attrs(&node)?;
                self.plan.push(Action::ConflictCopy {
                    source: node,
                    copy,
                    attrs,
                    order: u.order(),
                });
                self.plan.record(
                    node,
                    Resolution::ConflictCopy,
                    format!("unmerged content kept as copy {}", copy),
                );
            }
            None => {
                self.plan.push(Action::Write { node, content, size });
                self.plan.record(node, Resolution::Applied, "content written");
            }
        }
        Ok(())
    }

    fn resolve_attrs(&mut self, node: NodeId, u: &ChainSummary, m: &ChainSummary) -> Result<()> {
        let current = self
            .merged
            .get(&node)
            .ok_or_else(|| CrError::missing_node(node, "merged tree"))?
            .attrs
            .clone();

        if let Some(exec) = u.executable {
            if current.kind.is_file() {
                if (current.kind == EntryKind::Exec) != exec {
                    self.plan.push(Action::SetAttr {
                        node,
                        attr: Attr::Executable(exec),
                    });
                }
                self.record_attr(node, m.executable.is_some_and(|v| v != exec), "executable bit");
            } else {
                self.plan.record(node, Resolution::Moot, "executable bit on a non-file");
            }
        }
        if let Some(mtime) = u.mtime {
            if current.mtime != mtime {
                self.plan.push(Action::SetAttr {
                    node,
                    attr: Attr::Mtime(mtime),
                });
            }
            self.record_attr(node, m.mtime.is_some_and(|v| v != mtime), "mtime");
        }
        if let Some(kind) = u.kind {
            if current.kind != kind {
                self.plan.push(Action::SetEntryType { node, kind });
            }
            self.record_attr(node, m.kind.is_some_and(|v| v != kind), "entry type");
        }
        Ok(())
    }

    fn record_attr(&mut self, node: NodeId, clashed: bool, what: &str) {
        if clashed {
            debug!(node = %node, attr = what, "unmerged attribute overrides merged value");
            self.plan.record(node, Resolution::AttributeOverride, format!("unmerged {} wins", what));
        } else {
            self.plan.record(node, Resolution::Applied, format!("{} set", what));
        }
    }

    /// Place every ancestor directory of `node` that the merged tree lacks,
    /// outermost first, at its unmerged location
    fn ensure_parent(&mut self, node: NodeId, u: &ChainSummary) -> Result<()> {
        let (mut cur, _) = self.unmerged_location(&node)?;
        let mut missing = Vec::new();
        while !self.in_merged(&cur) && !self.scheduled.contains(&cur) {
            missing.push(cur);
            if missing.len() > self.u_index.len() {
                return Err(CrError::CorruptChain(format!("ancestors of {} loop", node)));
            }
            cur = self.unmerged_location(&cur)?.0;
        }

        for dir in missing.into_iter().rev() {
            let (parent, name) = self.unmerged_location(&dir)?;
            let attrs = self.unmerged_attrs(&dir)?;
            self.plan.push(Action::Place {
                node: dir,
                parent,
                name: name.clone(),
                placement: Placement::Fresh(attrs),
                order: u.order(),
            });
            self.scheduled.insert(dir);
            if self.chains.summary(&dir, Side::Unmerged).created {
                self.plan.record(dir, Resolution::Applied, format!("created '{}'", name));
            } else {
                debug!(dir = %dir, name = %name, "recreating removed ancestor");
                self.plan
                    .record(dir, Resolution::Recreated, format!("rebuilt '{}' to hold {}", name, node));
            }
        }
        Ok(())
    }

    /// All merged entries of `dir` leave it during this merge
    fn dir_will_empty(&self, dir: &NodeId) -> bool {
        match self.merged.entries(dir) {
            Some(entries) => entries.values().all(|child| self.leaves(child, dir)),
            None => true,
        }
    }

    fn leaves(&self, child: &NodeId, dir: &NodeId) -> bool {
        let u = self.chains.summary(child, Side::Unmerged);
        let m = self.chains.summary(child, Side::Merged);
        if u.removed {
            return m.wrote.is_none() && self.dir_will_empty(child);
        }
        if u.moved && !m.moved {
            return self.u_index.get(child).is_some_and(|(parent, _)| parent != dir);
        }
        false
    }

    fn in_merged(&self, id: &NodeId) -> bool {
        *id == self.merged.root() || self.m_index.contains_key(id)
    }

    fn in_unmerged(&self, id: &NodeId) -> bool {
        *id == self.unmerged.root() || self.u_index.contains_key(id)
    }

    fn merged_kind(&self, id: &NodeId) -> Option<EntryKind> {
        self.merged.get(id).map(|n| n.kind())
    }

    fn unmerged_location(&self, id: &NodeId) -> Result<Location> {
        self.u_index
            .get(id)
            .cloned()
            .ok_or_else(|| CrError::missing_node(*id, "unmerged tree"))
    }

    fn unmerged_attrs(&self, id: &NodeId) -> Result<NodeAttrs> {
        self.unmerged
            .get(id)
            .map(|n| n.attrs.clone())
            .ok_or_else(|| CrError::missing_node(*id, "unmerged tree"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{BranchId, Node};
    use crate::ops::Op;
    use crate::revision::Revision;
    use std::sync::Arc;

    struct Fixture {
        base: Tree,
        merged: Tree,
        unmerged: Tree,
        m_ops: Vec<Op>,
        u_ops: Vec<Op>,
    }

    impl Fixture {
        fn new(base: Tree) -> Self {
            Self {
                merged: base.clone(),
                unmerged: base.clone(),
                base,
                m_ops: vec![],
                u_ops: vec![],
            }
        }

        fn merged(&mut self, op: Op) {
            op.apply(&mut self.merged).unwrap();
            self.m_ops.push(op);
        }

        fn unmerged(&mut self, op: Op) {
            op.apply(&mut self.unmerged).unwrap();
            self.u_ops.push(op);
        }

        fn plan(&self) -> Plan {
            let rev = |ops: &Vec<Op>, branch: &str| {
                Arc::new(Revision::new(vec![], 1, BranchId::new(branch), 0, String::new(), ObjectId::new([0; 32]), ops.clone()))
            };
            let chains = OpChains::build(&[rev(&self.m_ops, "m")], &[rev(&self.u_ops, "u")]);
            chains.validate(&self.base).unwrap();
            plan(&chains, &self.merged, &self.unmerged, ObjectId::new([7; 32])).unwrap()
        }
    }

    fn id(tag: &str) -> NodeId {
        NodeId::derive(&[tag.as_bytes()])
    }

    fn content(tag: &str) -> ObjectId {
        ObjectId::from_data(tag.as_bytes())
    }

    /// root/a (dir) holding a/f (file)
    fn base() -> Tree {
        let mut tree = Tree::new();
        let root = tree.root();
        tree.insert_node(Node::new(id("a"), NodeAttrs::dir(0)));
        tree.attach(root, "a", id("a")).unwrap();
        tree.insert_node(Node::new(id("f"), NodeAttrs::file(content("v0"), 2, 0)));
        tree.attach(id("a"), "f", id("f")).unwrap();
        tree
    }

    fn write(node: &str, data: &str) -> Op {
        Op::Write {
            node: id(node),
            content: content(data),
            size: data.len() as u64,
        }
    }

    fn remove_f() -> Op {
        Op::Remove {
            parent: id("a"),
            name: "f".into(),
            node: id("f"),
        }
    }

    #[test]
    fn test_write_write_makes_conflict_copy() {
        let mut fx = Fixture::new(base());
        fx.merged(write("f", "mine"));
        fx.unmerged(write("f", "theirs"));
        let plan = fx.plan();
        assert!(plan.report.has(&id("f"), Resolution::ConflictCopy));
        assert!(matches!(
            &plan.actions[..],
            [Action::ConflictCopy { attrs, .. }] if attrs.content == Some(content("theirs"))
        ));
    }

    #[test]
    fn test_identical_writes_are_not_a_conflict() {
        let mut fx = Fixture::new(base());
        fx.merged(write("f", "same"));
        fx.unmerged(write("f", "same"));
        let plan = fx.plan();
        assert!(plan.actions.is_empty());
        assert!(plan.report.is_clean());
    }

    #[test]
    fn test_merged_write_resurrects_unmerged_remove() {
        let mut fx = Fixture::new(base());
        fx.merged(write("f", "kept"));
        fx.unmerged(remove_f());
        let plan = fx.plan();
        assert!(plan.actions.is_empty());
        assert!(plan.report.has(&id("f"), Resolution::Resurrected));
    }

    #[test]
    fn test_unmerged_write_resurrects_merged_remove() {
        let mut fx = Fixture::new(base());
        fx.merged(remove_f());
        fx.unmerged(write("f", "kept"));
        let plan = fx.plan();
        match &plan.actions[..] {
            [Action::Place { node, name, placement: Placement::Fresh(attrs), .. }] => {
                assert_eq!(*node, id("f"));
                assert_eq!(name, "f");
                assert_eq!(attrs.content, Some(content("kept")));
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert!(plan.report.has(&id("f"), Resolution::Resurrected));
    }

    #[test]
    fn test_remove_remove_is_idempotent() {
        let mut fx = Fixture::new(base());
        fx.merged(remove_f());
        fx.unmerged(remove_f());
        let plan = fx.plan();
        assert!(plan.actions.is_empty());
        assert!(plan.report.has(&id("f"), Resolution::RemoveIdempotent));
    }

    #[test]
    fn test_dir_removal_kept_when_merged_adds_entry() {
        let mut fx = Fixture::new(base());
        fx.merged(Op::Create {
            parent: id("a"),
            name: "g".into(),
            node: id("g"),
            attrs: NodeAttrs::file(content("g"), 1, 0),
        });
        fx.unmerged(remove_f());
        fx.unmerged(Op::Remove {
            parent: NodeId::root(),
            name: "a".into(),
            node: id("a"),
        });
        let plan = fx.plan();
        assert_eq!(plan.actions, vec![Action::Remove { node: id("f"), order: crate::ops::OpOrder::new(1, 0) }]);
        assert!(plan.report.has(&id("a"), Resolution::KeptNonEmpty));
    }

    #[test]
    fn test_attribute_clash_unmerged_wins() {
        let mut fx = Fixture::new(base());
        fx.merged(Op::SetAttr {
            node: id("f"),
            attr: Attr::Mtime(10),
        });
        fx.unmerged(Op::SetAttr {
            node: id("f"),
            attr: Attr::Mtime(20),
        });
        let plan = fx.plan();
        assert_eq!(
            plan.actions,
            vec![Action::SetAttr {
                node: id("f"),
                attr: Attr::Mtime(20)
            }]
        );
        assert!(plan.report.has(&id("f"), Resolution::AttributeOverride));
    }

    #[test]
    fn test_setattr_on_merged_removed_node_is_moot() {
        let mut fx = Fixture::new(base());
        fx.merged(remove_f());
        fx.unmerged(Op::SetAttr {
            node: id("f"),
            attr: Attr::Executable(true),
        });
        let plan = fx.plan();
        assert!(plan.actions.is_empty());
        assert!(plan.report.has(&id("f"), Resolution::Moot));
    }

    #[test]
    fn test_create_in_removed_dir_recreates_ancestor() {
        let mut fx = Fixture::new(base());
        fx.merged(remove_f());
        fx.merged(Op::Remove {
            parent: NodeId::root(),
            name: "a".into(),
            node: id("a"),
        });
        fx.unmerged(Op::Create {
            parent: id("a"),
            name: "n".into(),
            node: id("n"),
            attrs: NodeAttrs::file(content("n"), 1, 0),
        });
        let plan = fx.plan();
        assert_eq!(plan.placement_of(&id("a")), Some(0));
        assert_eq!(plan.placement_of(&id("n")), Some(1));
        assert!(plan.report.has(&id("a"), Resolution::Recreated));
    }

    #[test]
    fn test_rename_superseded_by_merged_rename() {
        let mut fx = Fixture::new(base());
        let rename = |to: &str| Op::Rename {
            old_parent: id("a"),
            old_name: "f".into(),
            new_parent: id("a"),
            new_name: to.into(),
            node: id("f"),
        };
        fx.merged(rename("m"));
        fx.unmerged(rename("u"));
        let plan = fx.plan();
        assert!(plan.actions.is_empty());
        assert!(plan.report.has(&id("f"), Resolution::RenameSuperseded));
    }
}
