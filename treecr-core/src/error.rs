//! Error types for conflict resolution, the local journal and sessions
//!
//! Conflicts are never errors: every combination of concurrent ops resolves
//! automatically. The variants here are fatal precondition violations, races
//! that outlived their retry budget, and cancellation.

use crate::object::{NodeId, RevisionId, TreeError};
use crate::store::StoreError;

/// Result type for conflict resolution
pub type Result<T> = std::result::Result<T, CrError>;

/// Fatal conflict-resolution errors; no partial merge is ever published
#[derive(Debug, thiserror::Error)]
pub enum CrError {
    #[error("Branches {merged} and {unmerged} share no common ancestor")]
    Divergence {
        merged: RevisionId,
        unmerged: RevisionId,
    },

    #[error("Corrupt op chain: {0}")]
    CorruptChain(String),

    #[error("Failed to apply merge actions: {0}")]
    Apply(String),

    #[error("Merged head kept moving; gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Conflict resolution cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CrError {
    pub(crate) fn missing_node(node: NodeId, context: &str) -> Self {
        CrError::CorruptChain(format!("node {} missing from {}", node, context))
    }

    pub(crate) fn apply(err: TreeError, context: &str) -> Self {
        CrError::Apply(format!("{}: {}", context, err))
    }

    /// Store lookups that miss during resolution point at broken metadata
    pub(crate) fn from_lookup(err: StoreError) -> Self {
        match err {
            StoreError::RevisionNotFound(_) | StoreError::TreeNotFound(_) | StoreError::NotAncestor { .. } => {
                CrError::CorruptChain(err.to_string())
            }
            other => CrError::Store(other),
        }
    }
}

/// Errors from path-based mutations in the local journal
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    Exists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Errors surfaced by a participant session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Cr(#[from] CrError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Journal is based on {base}, but the local head is {head}")]
    StaleJournal { base: RevisionId, head: RevisionId },
}
