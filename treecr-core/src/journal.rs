//! Local journal
//!
//! Path-based file-system mutations against a working copy of the local
//! head tree. Every mutation is recorded as an [`Op`] and applied to the
//! working tree immediately; the batch becomes one revision when the session
//! commits it. Content bytes are held until commit and then handed to the
//! block store.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::error::JournalError;
use crate::object::{split_path, BranchId, EntryKind, NodeAttrs, NodeId, ObjectId, RevisionId, Tree};
use crate::ops::{Attr, Op};

pub type Result<T> = std::result::Result<T, JournalError>;

/// Ops, resulting tree and pending content of a finished journal
#[derive(Debug, Clone)]
pub struct JournalParts {
    pub ops: Vec<Op>,
    pub tree: Tree,
    pub blocks: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    branch: BranchId,
    /// Revision the working tree started from
    base: RevisionId,
    /// Sequence number the committed revision will carry
    seq: u64,
    tree: Tree,
    ops: Vec<Op>,
    blocks: Vec<Bytes>,
    /// Node allocations so far
    allocated: u64,
    /// Timestamp for new nodes
    now: i64,
}

impl Journal {
    pub fn new(branch: BranchId, base: RevisionId, seq: u64, tree: Tree, now: i64) -> Self {
        Self {
            branch,
            base,
            seq,
            tree,
            ops: Vec::new(),
            blocks: Vec::new(),
            allocated: 0,
            now,
        }
    }

    pub fn base(&self) -> RevisionId {
        self.base
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_parts(self) -> JournalParts {
        JournalParts {
            ops: self.ops,
            tree: self.tree,
            blocks: self.blocks,
        }
    }

    /// Create a directory and any missing parents (`mkdir -p`)
    pub fn mkdir(&mut self, path: &str) -> Result<NodeId> {
        let parts = components(path)?;
        self.make_dirs(&parts)
    }

    /// Create or overwrite a file, creating missing parent directories
    pub fn write(&mut self, path: &str, data: impl Into<Bytes>) -> Result<NodeId> {
        let data = data.into();
        let content = ObjectId::from_data(&data);
        let size = data.len() as u64;
        let (parent, name) = self.parent_for_create(path)?;

        let node = match self.tree.lookup(&parent, &name) {
            Some(existing) => {
                let target = self.follow(path, existing)?;
                self.op(Op::Write {
                    node: target,
                    content,
                    size,
                })
                .map_err(|e| match e {
                    JournalError::Tree(_) => JournalError::IsADirectory(path.to_string()),
                    other => other,
                })?;
                target
            }
            None => {
                let node = self.alloc();
                self.op(Op::Create {
                    parent,
                    name,
                    node,
                    attrs: NodeAttrs::file(content, size, self.now),
                })?;
                node
            }
        };
        self.blocks.push(data);
        Ok(node)
    }

    /// Remove a file or symlink
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (parent, name, node) = self.entry_at(path)?;
        if self.kind_of(&node).is_dir() {
            return Err(JournalError::IsADirectory(path.to_string()));
        }
        self.op(Op::Remove { parent, name, node })
    }

    /// Remove an empty directory
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let (parent, name, node) = self.entry_at(path)?;
        match self.tree.entries(&node) {
            None => Err(JournalError::NotADirectory(path.to_string())),
            Some(entries) if !entries.is_empty() => Err(JournalError::NotEmpty(path.to_string())),
            Some(_) => self.op(Op::Remove { parent, name, node }),
        }
    }

    /// Move an entry, creating missing destination parents
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let (old_parent, old_name, node) = self.entry_at(from)?;
        let (new_parent, new_name) = self.parent_for_create(to)?;
        if self.tree.lookup(&new_parent, &new_name).is_some() {
            return Err(JournalError::Exists(to.to_string()));
        }
        if self.is_within(&new_parent, &node) {
            return Err(JournalError::InvalidPath(format!("cannot move {} inside itself", from)));
        }
        self.op(Op::Rename {
            old_parent,
            old_name,
            new_parent,
            new_name,
            node,
        })
    }

    pub fn set_executable(&mut self, path: &str, executable: bool) -> Result<()> {
        let (_, _, entry) = self.entry_at(path)?;
        let node = self.follow(path, entry)?;
        if !self.kind_of(&node).is_file() {
            return Err(JournalError::IsADirectory(path.to_string()));
        }
        self.op(Op::SetAttr {
            node,
            attr: Attr::Executable(executable),
        })
    }

    pub fn set_mtime(&mut self, path: &str, mtime: i64) -> Result<()> {
        let (_, _, node) = self.entry_at(path)?;
        self.op(Op::SetAttr {
            node,
            attr: Attr::Mtime(mtime),
        })
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> Result<NodeId> {
        let (parent, name) = self.parent_for_create(path)?;
        if self.tree.lookup(&parent, &name).is_some() {
            return Err(JournalError::Exists(path.to_string()));
        }
        let node = self.alloc();
        self.op(Op::Create {
            parent,
            name,
            node,
            attrs: NodeAttrs::symlink(target.to_string(), self.now),
        })?;
        Ok(node)
    }

    /// Entries of a directory, following symlinks
    pub fn list(&self, path: &str) -> Result<BTreeMap<String, EntryKind>> {
        list_dir(&self.tree, path)
    }

    /// Content reference of a file, following symlinks
    pub fn content_of(&self, path: &str) -> Result<ObjectId> {
        content_at(&self.tree, path)
    }

    fn op(&mut self, op: Op) -> Result<()> {
        op.apply(&mut self.tree)?;
        self.ops.push(op);
        Ok(())
    }

    fn alloc(&mut self) -> NodeId {
        self.allocated += 1;
        NodeId::derive(&[
            b"node",
            self.branch.as_str().as_bytes(),
            self.base.as_bytes(),
            &self.seq.to_le_bytes(),
            &self.allocated.to_le_bytes(),
        ])
    }

    fn kind_of(&self, node: &NodeId) -> EntryKind {
        self.tree.get(node).map_or(EntryKind::File, |n| n.kind())
    }

    fn make_dirs(&mut self, parts: &[&str]) -> Result<NodeId> {
        let mut cur = self.tree.root();
        for (i, part) in parts.iter().enumerate() {
            cur = match self.tree.lookup(&cur, part) {
                Some(child) => {
                    let prefix = parts[..=i].join("/");
                    let dir = self.follow(&prefix, child)?;
                    if !self.kind_of(&dir).is_dir() {
                        return Err(JournalError::NotADirectory(prefix));
                    }
                    dir
                }
                None => {
                    let node = self.alloc();
                    self.op(Op::Create {
                        parent: cur,
                        name: part.to_string(),
                        node,
                        attrs: NodeAttrs::dir(self.now),
                    })?;
                    node
                }
            };
        }
        Ok(cur)
    }

    /// Parent directory (created if missing) and leaf name of `path`
    fn parent_for_create(&mut self, path: &str) -> Result<(NodeId, String)> {
        let parts = components(path)?;
        let (name, dirs) = parts
            .split_last()
            .ok_or_else(|| JournalError::InvalidPath(path.to_string()))?;
        let parent = self.make_dirs(dirs)?;
        Ok((parent, name.to_string()))
    }

    /// Existing entry at `path`; the leaf itself is not followed
    fn entry_at(&self, path: &str) -> Result<(NodeId, String, NodeId)> {
        let parts = components(path)?;
        let (name, dirs) = parts
            .split_last()
            .ok_or_else(|| JournalError::InvalidPath(path.to_string()))?;
        let parent = self
            .tree
            .resolve_follow(&dirs.join("/"))
            .ok_or_else(|| JournalError::NotFound(path.to_string()))?;
        if !self.kind_of(&parent).is_dir() {
            return Err(JournalError::NotADirectory(dirs.join("/")));
        }
        let node = self
            .tree
            .lookup(&parent, name)
            .ok_or_else(|| JournalError::NotFound(path.to_string()))?;
        Ok((parent, name.to_string(), node))
    }

    /// Resolve symlinks at `node`, which sits at `path`
    fn follow(&self, path: &str, node: NodeId) -> Result<NodeId> {
        if self.kind_of(&node) != EntryKind::Sym {
            return Ok(node);
        }
        self.tree
            .resolve_follow(path)
            .ok_or_else(|| JournalError::NotFound(path.to_string()))
    }

    /// `dir` is `node` or lies below it
    fn is_within(&self, dir: &NodeId, node: &NodeId) -> bool {
        let index = self.tree.parent_index();
        let mut cur = *dir;
        loop {
            if cur == *node {
                return true;
            }
            match index.get(&cur) {
                Some((parent, _)) => cur = *parent,
                None => return false,
            }
        }
    }
}

/// Entries of the directory at `path`, following symlinks
pub fn list_dir(tree: &Tree, path: &str) -> Result<BTreeMap<String, EntryKind>> {
    let dir = tree
        .resolve_follow(path)
        .ok_or_else(|| JournalError::NotFound(path.to_string()))?;
    let entries = tree
        .entries(&dir)
        .ok_or_else(|| JournalError::NotADirectory(path.to_string()))?;
    Ok(entries
        .iter()
        .filter_map(|(name, id)| tree.get(id).map(|n| (name.clone(), n.kind())))
        .collect())
}

/// Content reference of the file at `path`, following symlinks
pub fn content_at(tree: &Tree, path: &str) -> Result<ObjectId> {
    let node = tree
        .resolve_follow(path)
        .and_then(|id| tree.get(&id))
        .ok_or_else(|| JournalError::NotFound(path.to_string()))?;
    if node.kind().is_dir() {
        return Err(JournalError::IsADirectory(path.to_string()));
    }
    node.attrs
        .content
        .ok_or_else(|| JournalError::NotFound(path.to_string()))
}

fn components(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = split_path(path).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(JournalError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal() -> Journal {
        Journal::new(BranchId::new("alice"), RevisionId::new([1; 32]), 1, Tree::new(), 100)
    }

    #[test]
    fn test_write_creates_parents() {
        let mut j = journal();
        j.write("a/b/c", "hello").unwrap();
        assert_eq!(j.list("a/b").unwrap().get("c"), Some(&EntryKind::File));
        assert_eq!(j.content_of("a/b/c").unwrap(), ObjectId::from_data(b"hello"));
        // two mkdirs and a create
        assert_eq!(j.ops().len(), 3);
    }

    #[test]
    fn test_overwrite_records_write() {
        let mut j = journal();
        let first = j.write("f", "one").unwrap();
        let second = j.write("f", "two").unwrap();
        assert_eq!(first, second);
        assert!(matches!(j.ops().last(), Some(Op::Write { .. })));
        assert_eq!(j.into_parts().blocks.len(), 2);
    }

    #[test]
    fn test_rename_and_remove() {
        let mut j = journal();
        j.write("a/b", "x").unwrap();
        j.rename("a/b", "d/e").unwrap();
        assert!(j.list("a").unwrap().is_empty());
        assert_eq!(j.list("d").unwrap().get("e"), Some(&EntryKind::File));
        assert!(matches!(j.rmdir("d"), Err(JournalError::NotEmpty(_))));
        assert!(matches!(j.remove("d"), Err(JournalError::IsADirectory(_))));
        j.remove("d/e").unwrap();
        j.rmdir("d").unwrap();
        assert!(matches!(j.list("d"), Err(JournalError::NotFound(_))));
    }

    #[test]
    fn test_rename_into_itself_rejected() {
        let mut j = journal();
        j.mkdir("a/b").unwrap();
        assert!(matches!(j.rename("a", "a/b/a"), Err(JournalError::InvalidPath(_))));
    }

    #[test]
    fn test_setex_changes_kind() {
        let mut j = journal();
        j.write("a/b", "x").unwrap();
        j.set_executable("a/b", true).unwrap();
        assert_eq!(j.list("a").unwrap().get("b"), Some(&EntryKind::Exec));
        assert!(matches!(j.set_executable("a", true), Err(JournalError::IsADirectory(_))));
    }

    #[test]
    fn test_symlink_is_followed_on_read() {
        let mut j = journal();
        j.write("a/c", "hi").unwrap();
        j.symlink("l", "a").unwrap();
        assert_eq!(j.content_of("l/c").unwrap(), ObjectId::from_data(b"hi"));
        assert!(matches!(j.symlink("l", "b"), Err(JournalError::Exists(_))));
    }

    #[test]
    fn test_node_ids_differ_per_branch() {
        let mut a = journal();
        let mut b = Journal::new(BranchId::new("bob"), RevisionId::new([1; 32]), 1, Tree::new(), 100);
        assert_ne!(a.write("x", "1").unwrap(), b.write("x", "1").unwrap());
    }
}
