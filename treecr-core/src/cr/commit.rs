//! Merge commit builder
//!
//! Applies a cycle-free plan to a copy of the merged head tree and logs every
//! change as an [`Op`] for the merge revision. Phases run in a fixed order:
//! non-directory removals, detaching moved nodes, directory removals (deepest
//! first), placements (parents before children), content and attribute
//! changes, conflict copies, garbage collection, cycle symlinks, validation.
//!
//! Directories go before placements so a name they free can be reused by a
//! fresh entry from the unmerged branch.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::{CrConfig, SymlinkStyle};
use crate::naming::{ConflictNamer, NamingContext};
use crate::object::{Location, Node, NodeAttrs, NodeId, Tree};
use crate::ops::Op;

use super::action::{Action, MergeReport, Placement, Plan, Resolution};
use super::{CrError, Result};

/// Merged tree plus the ops that produced it from the merged head
#[derive(Debug, Clone)]
pub struct Built {
    pub tree: Tree,
    pub ops: Vec<Op>,
}

pub fn build(
    merged: &Tree,
    plan: &mut Plan,
    namer: &dyn ConflictNamer,
    naming: &NamingContext,
    config: &CrConfig,
) -> Result<Built> {
    let mut builder = CommitBuilder {
        tree: merged.clone(),
        namer,
        naming,
        ops: Vec::new(),
        aliases: HashMap::new(),
        origins: HashMap::new(),
        report: &mut plan.report,
    };
    let actions = &plan.actions;
    let m_index = merged.parent_index();
    let depth = |id: &NodeId| merged.path_with(&m_index, id).map_or(0, |p| p.len());

    let (dir_removals, file_removals): (Vec<NodeId>, Vec<NodeId>) = actions
        .iter()
        .filter_map(|a| match a {
            Action::Remove { node, .. } => Some(*node),
            _ => None,
        })
        .partition(|id| merged.get(id).is_some_and(|n| n.kind().is_dir()));

    for node in &file_removals {
        builder.unlink(*node)?;
    }

    for action in actions {
        if let Action::Place { node, placement, .. } = action {
            match placement {
                Placement::Existing => builder.detach(*node)?,
                Placement::Fresh(attrs) => builder
                    .tree
                    .insert_new(Node::new(*node, attrs.clone()))
                    .map_err(|e| CrError::apply(e, "place"))?,
            }
        }
    }

    let mut dir_removals = dir_removals;
    dir_removals.sort_by_key(|id| (std::cmp::Reverse(depth(id)), *id));
    for node in dir_removals {
        builder.unlink(node)?;
    }

    for action in placements_parents_first(actions) {
        if let Action::Place {
            node,
            parent,
            name,
            placement,
            ..
        } = action
        {
            builder.place(*node, *parent, name, placement)?;
        }
    }

    for action in actions {
        match action {
            Action::Write { node, content, size } => builder.apply(Op::Write {
                node: *node,
                content: *content,
                size: *size,
            })?,
            Action::SetAttr { node, attr } => builder.apply(Op::SetAttr { node: *node, attr: *attr })?,
            Action::SetEntryType { node, kind } => builder.apply(Op::SetEntryType { node: *node, kind: *kind })?,
            _ => {}
        }
    }

    for action in actions {
        if let Action::ConflictCopy { source, copy, attrs, .. } = action {
            builder.conflict_copy(*source, *copy, attrs)?;
        }
    }

    let collected = builder.tree.collect_garbage();
    if collected > 0 {
        debug!(collected, "dropped unreachable nodes");
    }

    for action in actions {
        if let Action::Symlink {
            parent, name, link, target, ..
        } = action
        {
            builder.symlink(*parent, name, *link, *target, config.symlink_style)?;
        }
    }

    if config.validate_merged_tree {
        builder
            .tree
            .check_well_formed()
            .map_err(|e| CrError::apply(e, "merged tree is malformed"))?;
    }

    info!(ops = builder.ops.len(), nodes = builder.tree.len(), "merged tree built");
    Ok(Built {
        tree: builder.tree,
        ops: builder.ops,
    })
}

/// Placements reordered so a node placed under another placed node follows it
fn placements_parents_first(actions: &[Action]) -> Vec<&Action> {
    let by_node: HashMap<NodeId, &Action> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Place { node, .. } => Some((*node, a)),
            _ => None,
        })
        .collect();

    let mut ordered = Vec::with_capacity(by_node.len());
    let mut emitted = HashSet::new();
    for action in actions {
        let Action::Place { node, .. } = action else {
            continue;
        };
        let mut chain = vec![action];
        let mut cur = *node;
        while let Some(Action::Place { parent, .. }) = by_node.get(&cur).copied() {
            match by_node.get(parent) {
                Some(up) if !emitted.contains(parent) && chain.len() <= by_node.len() => {
                    chain.push(*up);
                    cur = *parent;
                }
                _ => break,
            }
        }
        for a in chain.into_iter().rev() {
            if emitted.insert(a.node()) {
                ordered.push(a);
            }
        }
    }
    ordered
}

struct CommitBuilder<'a> {
    tree: Tree,
    namer: &'a dyn ConflictNamer,
    naming: &'a NamingContext,
    ops: Vec<Op>,
    /// Fresh directories folded into a same-named merged directory
    aliases: HashMap<NodeId, NodeId>,
    /// Where each moved node was detached from
    origins: HashMap<NodeId, Location>,
    report: &'a mut MergeReport,
}

impl CommitBuilder<'_> {
    fn apply(&mut self, op: Op) -> Result<()> {
        op.apply(&mut self.tree).map_err(|e| CrError::apply(e, op.label()))?;
        self.ops.push(op);
        Ok(())
    }

    fn resolve_alias(&self, id: NodeId) -> NodeId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    fn locate(&self, node: NodeId) -> Result<Location> {
        self.tree
            .locate(&node)
            .ok_or_else(|| CrError::Apply(format!("node {} is not attached", node)))
    }

    fn unlink(&mut self, node: NodeId) -> Result<()> {
        let (parent, name) = self.locate(node)?;
        self.apply(Op::Remove { parent, name, node })
    }

    fn detach(&mut self, node: NodeId) -> Result<()> {
        let (parent, name) = self.locate(node)?;
        self.tree
            .detach(&parent, &name)
            .map_err(|e| CrError::apply(e, "detach"))?;
        self.origins.insert(node, (parent, name));
        Ok(())
    }

    fn place(&mut self, node: NodeId, parent: NodeId, name: &str, placement: &Placement) -> Result<()> {
        let parent = self.resolve_alias(parent);
        let final_name = match self.tree.lookup(&parent, name) {
            None => name.to_string(),
            Some(existing) => {
                if let Placement::Fresh(attrs) = placement {
                    if self.can_fold(node, existing, attrs) {
                        debug!(node = %node, into = %existing, name, "folding directory into merged directory");
                        self.tree
                            .remove_node(&node)
                            .map_err(|e| CrError::apply(e, "fold directory"))?;
                        self.aliases.insert(node, existing);
                        self.report.record(
                            node,
                            Resolution::Applied,
                            format!("merged into existing directory '{}'", name),
                        );
                        return Ok(());
                    }
                }
                let renamed = self.conflict_name(parent, name);
                debug!(node = %node, name, renamed = %renamed, "name taken; renaming unmerged entry");
                self.report.record(
                    node,
                    Resolution::ConflictCopy,
                    format!("'{}' was taken on the merged branch; kept as '{}'", name, renamed),
                );
                renamed
            }
        };

        match placement {
            Placement::Fresh(attrs) => {
                self.tree
                    .attach(parent, &final_name, node)
                    .map_err(|e| CrError::apply(e, "place"))?;
                self.ops.push(Op::Create {
                    parent,
                    name: final_name,
                    node,
                    attrs: attrs.clone(),
                });
            }
            Placement::Existing => {
                let (old_parent, old_name) = self
                    .origins
                    .get(&node)
                    .cloned()
                    .ok_or_else(|| CrError::Apply(format!("moved node {} was never detached", node)))?;
                self.tree
                    .attach(parent, &final_name, node)
                    .map_err(|e| CrError::apply(e, "move"))?;
                self.ops.push(Op::Rename {
                    old_parent,
                    old_name,
                    new_parent: parent,
                    new_name: final_name,
                    node,
                });
            }
        }
        Ok(())
    }

    /// A fresh, still empty directory meeting a merged directory of the same name
    fn can_fold(&self, node: NodeId, existing: NodeId, attrs: &NodeAttrs) -> bool {
        attrs.kind.is_dir()
            && self.tree.get(&existing).is_some_and(|n| n.kind().is_dir())
            && self.tree.get(&node).is_some_and(|n| n.entries.is_empty())
    }

    fn conflict_name(&self, parent: NodeId, name: &str) -> String {
        match self.tree.entries(&parent) {
            Some(siblings) => self.namer.conflict_name(name, siblings, self.naming),
            None => self.namer.candidate(name, self.naming, 0),
        }
    }

    fn conflict_copy(&mut self, source: NodeId, copy: NodeId, attrs: &NodeAttrs) -> Result<()> {
        let (parent, name) = self.locate(source)?;
        let copy_name = self.conflict_name(parent, &name);
        debug!(source = %source, copy = %copy_name, "placing conflict copy");
        self.apply(Op::Create {
            parent,
            name: copy_name,
            node: copy,
            attrs: attrs.clone(),
        })
    }

    fn symlink(&mut self, parent: NodeId, name: &str, link: NodeId, target: NodeId, style: SymlinkStyle) -> Result<()> {
        let parent = self.resolve_alias(parent);
        let index = self.tree.parent_index();
        let target_path = self
            .tree
            .path_with(&index, &target)
            .ok_or_else(|| CrError::Apply(format!("symlink target {} is unreachable", target)))?;
        let text = match style {
            SymlinkStyle::Relative => {
                let depth = self
                    .tree
                    .path_with(&index, &parent)
                    .ok_or_else(|| CrError::Apply(format!("symlink parent {} is unreachable", parent)))?
                    .len();
                format!("{}{}", "../".repeat(depth), target_path.join("/"))
            }
            SymlinkStyle::Absolute => format!("/{}", target_path.join("/")),
        };
        let mtime = self.tree.get(&target).map_or(0, |n| n.attrs.mtime);
        let link_name = match self.tree.lookup(&parent, name) {
            Some(_) => self.conflict_name(parent, name),
            None => name.to_string(),
        };
        debug!(link = %link_name, target = %text, "creating cycle symlink");
        self.apply(Op::Create {
            parent,
            name: link_name,
            node: link,
            attrs: NodeAttrs::symlink(text, mtime),
        })
    }
}
