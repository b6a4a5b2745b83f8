//! TreeCR Core Library
//!
//! Automatic conflict resolution for a revisioned, multi-writer file tree:
//! - Object model (node identities, trees, ops, revisions)
//! - Revision and block store interfaces with an in-memory implementation
//! - Conflict resolution pipeline (walk, chain, resolve, break cycles, commit)
//! - Conflict naming policy
//! - Local journal for staging path-based changes
//! - Participant sessions with explicit sync state and cancellation

pub mod object;
pub mod ops;
pub mod revision;
pub mod store;
pub mod error;
pub mod config;
pub mod naming;
pub mod cr;
pub mod journal;
pub mod session;

pub use object::{BranchId, EntryKind, Node, NodeAttrs, NodeId, ObjectId, RevisionId, Tree, TreeError};
pub use ops::{Attr, Op, OpOrder};
pub use revision::Revision;
pub use store::{BlockStore, MemoryStore, PublishOutcome, RevisionStore, StoreError};
pub use error::{CrError, JournalError, SessionError};
pub use config::{CrConfig, SymlinkStyle};
pub use naming::{ConflictNamer, NamingContext, SuffixNamer};
pub use cr::{
    CancelHandle, CancelToken, MergeOutcome, MergeReport, MergeResult, PublishedMerge, Resolution,
    ResolutionRecord, Resolver,
};
pub use journal::Journal;
pub use session::{CommitOutcome, Session, SyncOutcome};
