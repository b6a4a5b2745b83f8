//! File-system operations recorded in revision logs
//!
//! Every mutation a participant performs is one [`Op`]. Ops are totally
//! ordered within a branch by [`OpOrder`] (revision sequence, then position in
//! the revision) and name the nodes they touch by id, never by path.

use crate::object::{EntryKind, Node, NodeAttrs, NodeId, ObjectId, Tree, TreeError};
use serde::{Deserialize, Serialize};

/// Attribute changed by [`Op::SetAttr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attr {
    Executable(bool),
    Mtime(i64),
}

/// One atomic mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// New entry `name` in `parent` pointing at a fresh node
    Create {
        parent: NodeId,
        name: String,
        node: NodeId,
        attrs: NodeAttrs,
    },
    /// Entry removed; the node becomes unreachable
    Remove {
        parent: NodeId,
        name: String,
        node: NodeId,
    },
    /// Entry moved, node id unchanged
    Rename {
        old_parent: NodeId,
        old_name: String,
        new_parent: NodeId,
        new_name: String,
        node: NodeId,
    },
    /// File content replaced
    Write {
        node: NodeId,
        content: ObjectId,
        size: u64,
    },
    SetAttr {
        node: NodeId,
        attr: Attr,
    },
    SetEntryType {
        node: NodeId,
        kind: EntryKind,
    },
}

impl Op {
    /// The node this op mutates
    pub fn target(&self) -> NodeId {
        match self {
            Op::Create { node, .. }
            | Op::Remove { node, .. }
            | Op::Rename { node, .. }
            | Op::Write { node, .. }
            | Op::SetAttr { node, .. }
            | Op::SetEntryType { node, .. } => *node,
        }
    }

    /// Every node the op touches: the target plus any parent directories
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.target()];
        match self {
            Op::Create { parent, .. } | Op::Remove { parent, .. } => nodes.push(*parent),
            Op::Rename {
                old_parent,
                new_parent,
                ..
            } => {
                nodes.push(*old_parent);
                if new_parent != old_parent {
                    nodes.push(*new_parent);
                }
            }
            Op::Write { .. } | Op::SetAttr { .. } | Op::SetEntryType { .. } => {}
        }
        nodes
    }

    pub fn label(&self) -> &'static str {
        match self {
            Op::Create { .. } => "create",
            Op::Remove { .. } => "remove",
            Op::Rename { .. } => "rename",
            Op::Write { .. } => "write",
            Op::SetAttr { .. } => "setattr",
            Op::SetEntryType { .. } => "settype",
        }
    }

    /// Apply the op to a tree
    pub fn apply(&self, tree: &mut Tree) -> Result<(), TreeError> {
        match self {
            Op::Create {
                parent,
                name,
                node,
                attrs,
            } => {
                tree.insert_new(Node::new(*node, attrs.clone()))?;
                tree.attach(*parent, name, *node)
            }
            Op::Remove { parent, name, node } => {
                expect_entry(tree, parent, name, node)?;
                if tree.get(node).is_some_and(|n| !n.entries.is_empty()) {
                    return Err(TreeError::NotEmpty(*node));
                }
                tree.detach(parent, name)?;
                tree.remove_node(node)?;
                Ok(())
            }
            Op::Rename {
                old_parent,
                old_name,
                new_parent,
                new_name,
                node,
            } => {
                expect_entry(tree, old_parent, old_name, node)?;
                tree.detach(old_parent, old_name)?;
                tree.attach(*new_parent, new_name, *node)
            }
            Op::Write {
                node,
                content,
                size,
            } => {
                let n = tree.get_mut(node).ok_or(TreeError::NoSuchNode(*node))?;
                if !n.kind().is_file() {
                    return Err(TreeError::NotAFile(*node));
                }
                n.attrs.content = Some(*content);
                n.attrs.size = *size;
                Ok(())
            }
            Op::SetAttr { node, attr } => {
                let n = tree.get_mut(node).ok_or(TreeError::NoSuchNode(*node))?;
                match attr {
                    Attr::Executable(exec) => {
                        if !n.kind().is_file() {
                            return Err(TreeError::NotAFile(*node));
                        }
                        n.attrs.kind = if *exec { EntryKind::Exec } else { EntryKind::File };
                    }
                    Attr::Mtime(mtime) => n.attrs.mtime = *mtime,
                }
                Ok(())
            }
            Op::SetEntryType { node, kind } => {
                let n = tree.get_mut(node).ok_or(TreeError::NoSuchNode(*node))?;
                n.attrs.kind = *kind;
                Ok(())
            }
        }
    }
}

fn expect_entry(tree: &Tree, parent: &NodeId, name: &str, node: &NodeId) -> Result<(), TreeError> {
    match tree.lookup(parent, name) {
        Some(found) if found == *node => Ok(()),
        _ => Err(TreeError::EntryMismatch {
            parent: *parent,
            name: name.to_string(),
            node: *node,
        }),
    }
}

/// Position of an op within its branch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpOrder {
    /// Sequence number of the originating revision
    pub seq: u64,
    /// Index of the op inside that revision
    pub index: u32,
}

impl OpOrder {
    pub fn new(seq: u64, index: u32) -> Self {
        Self { seq, index }
    }
}

impl std::fmt::Display for OpOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}#{}", self.seq, self.index)
    }
}
