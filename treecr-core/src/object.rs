//! Core object model for TreeCR
//!
//! Content-addressed identifiers for blocks, trees and revisions, stable node
//! identities, and the arena-style directory tree every revision snapshots.
//! Nodes are keyed by [`NodeId`]; directory entries are the only edges, so a
//! rename never changes a node's identity, only the entry that points at it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Content-addressed identifier for blocks, trees and revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex digits, used in names and log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Revisions are addressed by the digest of their encoding
pub type RevisionId = ObjectId;

/// Stable, branch-independent node identity
///
/// Allocated once when the node is created and never reassigned; derived from
/// its inputs so that every participant computes the same id for the same
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive an id from length-prefixed parts
    pub fn derive(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    /// The id every tree uses for its root directory
    pub fn root() -> Self {
        Self::derive(&[b"root"])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Identity of the participant/branch that produced a revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(String);

impl BranchId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entry type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Exec,
    Dir,
    Sym,
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Dir)
    }

    /// Regular or executable file
    pub fn is_file(&self) -> bool {
        matches!(self, EntryKind::File | EntryKind::Exec)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::File => "FILE",
            EntryKind::Exec => "EXEC",
            EntryKind::Dir => "DIR",
            EntryKind::Sym => "SYM",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-node attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub kind: EntryKind,
    /// Block reference for file content
    pub content: Option<ObjectId>,
    pub size: u64,
    /// Modification time (Unix seconds)
    pub mtime: i64,
    /// Link text for symbolic links
    pub target: Option<String>,
}

impl NodeAttrs {
    pub fn dir(mtime: i64) -> Self {
        Self {
            kind: EntryKind::Dir,
            content: None,
            size: 0,
            mtime,
            target: None,
        }
    }

    pub fn file(content: ObjectId, size: u64, mtime: i64) -> Self {
        Self {
            kind: EntryKind::File,
            content: Some(content),
            size,
            mtime,
            target: None,
        }
    }

    pub fn symlink(target: String, mtime: i64) -> Self {
        Self {
            kind: EntryKind::Sym,
            content: None,
            size: target.len() as u64,
            mtime,
            target: Some(target),
        }
    }
}

/// A file, directory or symbolic link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub attrs: NodeAttrs,
    /// Directory entries, name -> child; empty for non-directories
    pub entries: BTreeMap<String, NodeId>,
}

impl Node {
    pub fn new(id: NodeId, attrs: NodeAttrs) -> Self {
        Self {
            id,
            attrs,
            entries: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.attrs.kind
    }
}

/// Structural errors raised by tree mutations and validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NoSuchNode(NodeId),

    #[error("Node {0} is not a directory")]
    NotADirectory(NodeId),

    #[error("Node {0} is not a file")]
    NotAFile(NodeId),

    #[error("Entry '{name}' already exists in {parent}")]
    NameTaken { parent: NodeId, name: String },

    #[error("Entry '{name}' in {parent} does not point at {node}")]
    EntryMismatch {
        parent: NodeId,
        name: String,
        node: NodeId,
    },

    #[error("No entry '{name}' in {parent}")]
    NoSuchEntry { parent: NodeId, name: String },

    #[error("Directory {0} is not empty")]
    NotEmpty(NodeId),

    #[error("Node {0} already exists")]
    NodeExists(NodeId),

    #[error("Node {0} is reachable through more than one entry or a cycle")]
    Cycle(NodeId),

    #[error("Entry '{name}' in {parent} points at missing node {node}")]
    Dangling {
        parent: NodeId,
        name: String,
        node: NodeId,
    },
}

/// Location of a node: its parent directory and entry name
pub type Location = (NodeId, String);

/// Maximum symlink hops followed while resolving a path
const MAX_SYMLINK_HOPS: usize = 40;

/// Directory tree snapshot (arena of nodes keyed by id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    root: NodeId,
    nodes: BTreeMap<NodeId, Node>,
}

impl Tree {
    /// Create a tree holding only an empty root directory
    pub fn new() -> Self {
        let root = NodeId::root();
        let mut nodes = BTreeMap::new();
        nodes.insert(root, Node::new(root, NodeAttrs::dir(0)));
        Self { root, nodes }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Whether the arena holds the node (reachable or not)
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Insert an unattached node into the arena
    pub fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    /// Insert a node whose id is not yet in the arena
    pub fn insert_new(&mut self, node: Node) -> Result<(), TreeError> {
        if self.nodes.contains_key(&node.id) {
            return Err(TreeError::NodeExists(node.id));
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// Drop a node from the arena; directories must be empty
    pub fn remove_node(&mut self, id: &NodeId) -> Result<Node, TreeError> {
        let node = self.nodes.get(id).ok_or(TreeError::NoSuchNode(*id))?;
        if !node.entries.is_empty() {
            return Err(TreeError::NotEmpty(*id));
        }
        self.nodes.remove(id).ok_or(TreeError::NoSuchNode(*id))
    }

    /// Entries of a directory
    pub fn entries(&self, dir: &NodeId) -> Option<&BTreeMap<String, NodeId>> {
        self.nodes
            .get(dir)
            .filter(|n| n.kind().is_dir())
            .map(|n| &n.entries)
    }

    pub fn lookup(&self, dir: &NodeId, name: &str) -> Option<NodeId> {
        self.entries(dir).and_then(|e| e.get(name).copied())
    }

    /// Add an entry `name -> child` to `parent`
    pub fn attach(&mut self, parent: NodeId, name: &str, child: NodeId) -> Result<(), TreeError> {
        if !self.nodes.contains_key(&child) {
            return Err(TreeError::NoSuchNode(child));
        }
        let dir = self
            .nodes
            .get_mut(&parent)
            .ok_or(TreeError::NoSuchNode(parent))?;
        if !dir.kind().is_dir() {
            return Err(TreeError::NotADirectory(parent));
        }
        if dir.entries.contains_key(name) {
            return Err(TreeError::NameTaken {
                parent,
                name: name.to_string(),
            });
        }
        dir.entries.insert(name.to_string(), child);
        Ok(())
    }

    /// Remove the entry `name` from `parent`, returning the child it named
    pub fn detach(&mut self, parent: &NodeId, name: &str) -> Result<NodeId, TreeError> {
        let dir = self
            .nodes
            .get_mut(parent)
            .ok_or(TreeError::NoSuchNode(*parent))?;
        dir.entries.remove(name).ok_or(TreeError::NoSuchEntry {
            parent: *parent,
            name: name.to_string(),
        })
    }

    /// Child -> (parent, name) for every node reachable from the root
    pub fn parent_index(&self) -> HashMap<NodeId, Location> {
        let mut index = HashMap::new();
        let mut stack = vec![self.root];
        let mut seen = HashSet::new();
        while let Some(dir) = stack.pop() {
            if !seen.insert(dir) {
                continue;
            }
            if let Some(node) = self.nodes.get(&dir) {
                for (name, child) in &node.entries {
                    index.insert(*child, (dir, name.clone()));
                    stack.push(*child);
                }
            }
        }
        index
    }

    /// Find the entry pointing at `id` by scanning all directories
    pub fn locate(&self, id: &NodeId) -> Option<Location> {
        self.nodes.values().find_map(|dir| {
            dir.entries
                .iter()
                .find(|(_, child)| *child == id)
                .map(|(name, _)| (dir.id, name.clone()))
        })
    }

    /// Path components from the root to `id`, None if unreachable
    pub fn path_of(&self, id: &NodeId) -> Option<Vec<String>> {
        self.path_with(&self.parent_index(), id)
    }

    /// Like [`Tree::path_of`] with a prebuilt parent index
    pub fn path_with(&self, index: &HashMap<NodeId, Location>, id: &NodeId) -> Option<Vec<String>> {
        let mut parts = Vec::new();
        let mut cur = *id;
        while cur != self.root {
            let (parent, name) = index.get(&cur)?;
            parts.push(name.clone());
            cur = *parent;
            if parts.len() > self.nodes.len() {
                return None;
            }
        }
        parts.reverse();
        Some(parts)
    }

    /// Resolve a slash-separated path without following symlinks
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut cur = self.root;
        for part in split_path(path) {
            cur = self.lookup(&cur, part)?;
        }
        Some(cur)
    }

    /// Resolve a path, following symbolic links in every component
    pub fn resolve_follow(&self, path: &str) -> Option<NodeId> {
        let mut pending: Vec<String> = split_path(path).map(str::to_string).collect();
        pending.reverse();
        let mut stack: Vec<NodeId> = vec![self.root];
        let mut hops = 0;

        while let Some(part) = pending.pop() {
            match part.as_str() {
                "." => continue,
                ".." => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                    continue;
                }
                _ => {}
            }
            let dir = *stack.last()?;
            let child = self.lookup(&dir, &part)?;
            let node = self.nodes.get(&child)?;
            if let (EntryKind::Sym, Some(target)) = (node.kind(), node.attrs.target.as_ref()) {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return None;
                }
                if target.starts_with('/') {
                    stack.truncate(1);
                }
                for seg in split_path(target).collect::<Vec<_>>().into_iter().rev() {
                    pending.push(seg.to_string());
                }
                continue;
            }
            stack.push(child);
        }
        stack.last().copied()
    }

    /// All nodes reachable from the root through directory entries
    pub fn reachable(&self) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.entries.values().copied());
            }
        }
        seen
    }

    /// Drop unreachable nodes from the arena, returning how many went away
    pub fn collect_garbage(&mut self) -> usize {
        let live = self.reachable();
        let before = self.nodes.len();
        self.nodes.retain(|id, _| live.contains(id));
        before - self.nodes.len()
    }

    /// Check that entries form a rooted tree: no dangling entries, no node
    /// reachable twice, no cycles
    pub fn check_well_formed(&self) -> Result<(), TreeError> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(TreeError::Cycle(id));
            }
            let node = self.nodes.get(&id).ok_or(TreeError::NoSuchNode(id))?;
            if !node.entries.is_empty() && !node.kind().is_dir() {
                return Err(TreeError::NotADirectory(id));
            }
            for (name, child) in &node.entries {
                if !self.nodes.contains_key(child) {
                    return Err(TreeError::Dangling {
                        parent: id,
                        name: name.clone(),
                        node: *child,
                    });
                }
                stack.push(*child);
            }
        }
        Ok(())
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
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
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-empty components of a slash-separated path
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty())
}
