//! Metadata and block store interfaces
//!
//! Conflict resolution consumes the revision history and publishes merge
//! revisions through [`RevisionStore`]; file bytes live behind [`BlockStore`]
//! and are only ever referenced by [`ObjectId`]. [`MemoryStore`] implements
//! both for tests and the CLI.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::object::{BranchId, ObjectId, RevisionId, Tree};
use crate::revision::Revision;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Revision not found: {0}")]
    RevisionNotFound(RevisionId),

    #[error("Tree not found: {0}")]
    TreeNotFound(ObjectId),

    #[error("Block not found: {0}")]
    BlockNotFound(ObjectId),

    #[error("Revision {ancestor} is not an ancestor of {head}")]
    NotAncestor { head: RevisionId, ancestor: RevisionId },

    #[error("Tree {0} does not match the revision it was stored with")]
    TreeMismatch(ObjectId),

    #[error("Store has no merged head")]
    Uninitialized,
}

/// Result of a compare-and-swap publish of a merge revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The revision is now the merged head
    Published(RevisionId),
    /// Another participant moved the merged head first
    Raced { head: RevisionId },
}

/// Revision history and merged-head publication
#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Get a revision by ID
    async fn revision(&self, id: RevisionId) -> Result<Arc<Revision>>;

    /// Get a tree snapshot by ID
    async fn tree(&self, id: ObjectId) -> Result<Arc<Tree>>;

    /// Current head of the merged branch
    async fn merged_head(&self) -> Result<RevisionId>;

    /// Store a revision without publishing it (local, unmerged history)
    async fn put_revision(&self, revision: Revision, tree: Tree) -> Result<RevisionId>;

    /// Make `revision` the merged head if its first parent is still the head
    async fn publish(&self, revision: Revision, tree: Tree) -> Result<PublishOutcome>;

    /// Nearest revision reachable from both heads
    ///
    /// Ancestors of `a` are collected through every parent; the history of `b`
    /// is then walked breadth-first, first parents before merge parents, and
    /// the first shared revision wins.
    async fn common_ancestor(&self, a: RevisionId, b: RevisionId) -> Result<Option<RevisionId>> {
        let mut ancestors_of_a = HashSet::new();
        let mut queue = VecDeque::from([a]);
        while let Some(id) = queue.pop_front() {
            if !ancestors_of_a.insert(id) {
                continue;
            }
            let rev = self.revision(id).await?;
            queue.extend(rev.parents.iter().copied());
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([b]);
        while let Some(id) = queue.pop_front() {
            if ancestors_of_a.contains(&id) {
                return Ok(Some(id));
            }
            if !seen.insert(id) {
                continue;
            }
            let rev = self.revision(id).await?;
            queue.extend(rev.parents.iter().copied());
        }
        Ok(None)
    }

    /// Revisions after `ancestor` up to and including `head`, oldest first
    ///
    /// Follows first parents. A merge revision that absorbed `ancestor` as a
    /// later parent ends the walk.
    async fn revisions_since(&self, head: RevisionId, ancestor: RevisionId) -> Result<Vec<Arc<Revision>>> {
        let mut chain = Vec::new();
        let mut cur = head;
        while cur != ancestor {
            let rev = self.revision(cur).await?;
            let absorbed = rev.parents.iter().skip(1).any(|p| *p == ancestor);
            let parent = rev.first_parent();
            chain.push(rev);
            if absorbed {
                break;
            }
            cur = parent.ok_or(StoreError::NotAncestor { head, ancestor })?;
        }
        chain.reverse();
        Ok(chain)
    }
}

/// Opaque content storage
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block, returning its content address
    async fn put_block(&self, data: Bytes) -> Result<ObjectId>;

    async fn get_block(&self, id: ObjectId) -> Result<Bytes>;
}

/// In-memory revision and block store
pub struct MemoryStore {
    /// Revisions by ID (published and local)
    revisions: Arc<RwLock<HashMap<RevisionId, Arc<Revision>>>>,

    /// Tree snapshots by ID
    trees: Arc<RwLock<HashMap<ObjectId, Arc<Tree>>>>,

    /// Content blocks
    blocks: Arc<RwLock<HashMap<ObjectId, Bytes>>>,

    /// Merged branch head
    head: Arc<RwLock<Option<RevisionId>>>,

    /// Store UUID
    uuid: String,
}

impl MemoryStore {
    /// Create a new, uninitialized store
    pub fn new() -> Self {
        Self {
            revisions: Arc::new(RwLock::new(HashMap::new())),
            trees: Arc::new(RwLock::new(HashMap::new())),
            blocks: Arc::new(RwLock::new(HashMap::new())),
            head: Arc::new(RwLock::new(None)),
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Publish the initial revision (an empty root directory)
    pub async fn initialize(&self) -> Result<RevisionId> {
        if let Some(head) = *self.head.read().await {
            return Ok(head);
        }
        let tree = Tree::new();
        let rev = Revision::new(
            vec![],
            0,
            BranchId::new("system"),
            chrono::Utc::now().timestamp(),
            "Initial revision".to_string(),
            tree.id(),
            vec![],
        );
        let id = rev.id();
        self.trees.write().await.insert(tree.id(), Arc::new(tree));
        self.revisions.write().await.insert(id, Arc::new(rev));
        *self.head.write().await = Some(id);
        Ok(id)
    }

    /// Number of revisions held (published and local)
    pub async fn revision_count(&self) -> usize {
        self.revisions.read().await.len()
    }

    async fn insert(&self, revision: Revision, tree: Tree) -> Result<RevisionId> {
        let tree_id = tree.id();
        if tree_id != revision.tree_id {
            return Err(StoreError::TreeMismatch(tree_id));
        }
        let id = revision.id();
        self.trees.write().await.entry(tree_id).or_insert_with(|| Arc::new(tree));
        self.revisions.write().await.insert(id, Arc::new(revision));
        Ok(id)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RevisionStore for MemoryStore {
    async fn revision(&self, id: RevisionId) -> Result<Arc<Revision>> {
        self.revisions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::RevisionNotFound(id))
    }

    async fn tree(&self, id: ObjectId) -> Result<Arc<Tree>> {
        self.trees
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::TreeNotFound(id))
    }

    async fn merged_head(&self) -> Result<RevisionId> {
        self.head.read().await.ok_or(StoreError::Uninitialized)
    }

    async fn put_revision(&self, revision: Revision, tree: Tree) -> Result<RevisionId> {
        self.insert(revision, tree).await
    }

    async fn publish(&self, revision: Revision, tree: Tree) -> Result<PublishOutcome> {
        // Hold the head lock across the check and the swap
        let mut head = self.head.write().await;
        let current = head.ok_or(StoreError::Uninitialized)?;
        if revision.first_parent() != Some(current) {
            return Ok(PublishOutcome::Raced { head: current });
        }
        let id = self.insert(revision, tree).await?;
        *head = Some(id);
        Ok(PublishOutcome::Published(id))
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn put_block(&self, data: Bytes) -> Result<ObjectId> {
        let id = ObjectId::from_data(&data);
        self.blocks.write().await.insert(id, data);
        Ok(id)
    }

    async fn get_block(&self, id: ObjectId) -> Result<Bytes> {
        self.blocks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::BlockNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(parent: RevisionId, seq: u64, branch: &str, message: &str) -> (Revision, Tree) {
        let tree = Tree::new();
        let rev = Revision::new(
            vec![parent],
            seq,
            BranchId::new(branch),
            0,
            message.to_string(),
            tree.id(),
            vec![],
        );
        (rev, tree)
    }

    #[tokio::test]
    async fn test_store_initialize() {
        let store = MemoryStore::new();
        let root = store.initialize().await.unwrap();
        assert_eq!(store.merged_head().await.unwrap(), root);
        assert_eq!(store.initialize().await.unwrap(), root);
        assert_eq!(store.uuid().len(), 36);
    }

    #[tokio::test]
    async fn test_publish_detects_race() {
        let store = MemoryStore::new();
        let root = store.initialize().await.unwrap();

        let (r1, t1) = child(root, 1, "alice", "one");
        let PublishOutcome::Published(id1) = store.publish(r1, t1).await.unwrap() else {
            panic!("first publish should succeed");
        };

        let (stale, t) = child(root, 1, "bob", "stale");
        let outcome = store.publish(stale, t).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Raced { head: id1 });
        assert_eq!(store.merged_head().await.unwrap(), id1);
    }

    #[tokio::test]
    async fn test_common_ancestor_and_revisions_since() {
        let store = MemoryStore::new();
        let root = store.initialize().await.unwrap();

        let (m1, t) = child(root, 1, "alice", "m1");
        let m1 = store.put_revision(m1, t).await.unwrap();
        let (m2, t) = child(m1, 2, "alice", "m2");
        let m2 = store.put_revision(m2, t).await.unwrap();
        let (u2, t) = child(m1, 2, "bob", "u2");
        let u2 = store.put_revision(u2, t).await.unwrap();

        assert_eq!(store.common_ancestor(m2, u2).await.unwrap(), Some(m1));
        let since = store.revisions_since(m2, root).await.unwrap();
        let messages: Vec<_> = since.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["m1", "m2"]);
        assert!(store.revisions_since(u2, u2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_histories_have_no_ancestor() {
        let a = MemoryStore::new();
        let root = a.initialize().await.unwrap();
        let tree = Tree::new();
        let orphan = Revision::new(vec![], 0, BranchId::new("x"), 1, "orphan".into(), tree.id(), vec![]);
        let orphan = a.put_revision(orphan, tree).await.unwrap();
        assert_eq!(a.common_ancestor(root, orphan).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocks_are_content_addressed() {
        let store = MemoryStore::new();
        let id = store.put_block(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(id, ObjectId::from_data(b"hello"));
        assert_eq!(store.get_block(id).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(matches!(
            store.get_block(ObjectId::new([9u8; 32])).await,
            Err(StoreError::BlockNotFound(_))
        ));
    }
}
