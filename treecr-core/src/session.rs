//! Participant sessions
//!
//! A [`Session`] is one participant's view of the shared history: the merged
//! revision it last synchronized with (`base`) and the tip of its own
//! unpublished revisions (`local_head`). Local work is staged through a
//! [`Journal`] and committed as an unmerged revision; [`Session::sync`] folds
//! it into the merged branch through conflict resolution.
//!
//! All state is owned by the session. Nothing is process-global, so any
//! number of participants can share one store inside a single process.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CrConfig;
use crate::cr::{CancelHandle, MergeReport, Resolver};
use crate::error::SessionError;
use crate::journal::{self, Journal};
use crate::naming::ConflictNamer;
use crate::object::{BranchId, EntryKind, RevisionId, Tree};
use crate::revision::Revision;
use crate::store::{BlockStore, RevisionStore};

pub type Result<T> = std::result::Result<T, SessionError>;

/// What a [`Session::sync`] did
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// No local changes; the session moved to the merged head
    FastForward { head: RevisionId },
    /// Local changes were already part of the merged history
    UpToDate { head: RevisionId },
    /// Local changes merged and published
    Merged {
        head: RevisionId,
        attempts: u32,
        report: MergeReport,
    },
}

impl SyncOutcome {
    pub fn head(&self) -> RevisionId {
        match self {
            SyncOutcome::FastForward { head }
            | SyncOutcome::UpToDate { head }
            | SyncOutcome::Merged { head, .. } => *head,
        }
    }

    pub fn report(&self) -> Option<&MergeReport> {
        match self {
            SyncOutcome::Merged { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Result of [`Session::commit_local`]
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The staged local revision
    pub revision: RevisionId,
    /// Set when updates are enabled and the commit was synchronized
    pub sync: Option<SyncOutcome>,
}

pub struct Session<S: RevisionStore + BlockStore + 'static> {
    id: Uuid,
    branch: BranchId,
    store: Arc<S>,
    resolver: Resolver<S>,
    /// Merged head this session last synchronized with
    base: RevisionId,
    /// Tip of the local chain; equals `base` when nothing is pending
    local_head: RevisionId,
    updates_enabled: bool,
    cancel: CancelHandle,
}

impl<S: RevisionStore + BlockStore + 'static> Session<S> {
    /// Join the store at its current merged head
    pub async fn start(store: Arc<S>, branch: impl Into<String>, config: CrConfig) -> Result<Self> {
        let head = store.merged_head().await?;
        let session = Self {
            id: Uuid::new_v4(),
            branch: BranchId::new(branch),
            resolver: Resolver::new(store.clone(), config),
            store,
            base: head,
            local_head: head,
            updates_enabled: true,
            cancel: CancelHandle::new(),
        };
        info!(session = %session.id, branch = %session.branch, head = %head.short(), "session started");
        Ok(session)
    }

    /// Replace the conflict naming policy used by this session's merges
    pub fn with_namer(mut self, namer: Arc<dyn ConflictNamer>) -> Self {
        self.resolver = self.resolver.with_namer(namer);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn branch(&self) -> &BranchId {
        &self.branch
    }

    pub fn base(&self) -> RevisionId {
        self.base
    }

    pub fn local_head(&self) -> RevisionId {
        self.local_head
    }

    pub fn has_local_changes(&self) -> bool {
        self.local_head != self.base
    }

    pub fn updates_enabled(&self) -> bool {
        self.updates_enabled
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Handle that cancels this session's in-flight and future episodes
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        warn!(session = %self.id, "cancelling conflict resolution");
        self.cancel.cancel();
    }

    /// Stop synchronizing after local commits; cancels any running episode
    pub fn disable_updates(&mut self) {
        debug!(session = %self.id, "updates disabled");
        self.updates_enabled = false;
        self.cancel.cancel();
    }

    /// Resume synchronizing and catch up with the merged branch
    pub async fn enable_updates(&mut self) -> Result<SyncOutcome> {
        debug!(session = %self.id, "updates enabled");
        self.updates_enabled = true;
        self.cancel.reset();
        self.sync().await
    }

    /// Working copy of the local head tree
    pub async fn journal(&self) -> Result<Journal> {
        let rev = self.store.revision(self.local_head).await?;
        let tree = self.store.tree(rev.tree_id).await?;
        Ok(Journal::new(
            self.branch.clone(),
            self.local_head,
            rev.seq + 1,
            (*tree).clone(),
            chrono::Utc::now().timestamp(),
        ))
    }

    /// Stage a journal as one unmerged revision
    pub async fn commit_local(&mut self, journal: Journal, message: &str) -> Result<CommitOutcome> {
        if journal.base() != self.local_head {
            return Err(SessionError::StaleJournal {
                base: journal.base(),
                head: self.local_head,
            });
        }
        if journal.is_empty() {
            return Ok(CommitOutcome {
                revision: self.local_head,
                sync: None,
            });
        }

        let seq = journal.seq();
        let parts = journal.into_parts();
        for block in parts.blocks {
            self.store.put_block(block).await?;
        }
        let op_count = parts.ops.len();
        let revision = Revision::new(
            vec![self.local_head],
            seq,
            self.branch.clone(),
            chrono::Utc::now().timestamp(),
            message.to_string(),
            parts.tree.id(),
            parts.ops,
        );
        let id = self.store.put_revision(revision, parts.tree).await?;
        self.local_head = id;
        info!(session = %self.id, revision = %id.short(), ops = op_count, "committed local revision");

        let sync = if self.updates_enabled {
            Some(self.sync().await?)
        } else {
            None
        };
        Ok(CommitOutcome { revision: id, sync })
    }

    /// Bring the session up to the merged head, merging local changes first
    pub async fn sync(&mut self) -> Result<SyncOutcome> {
        let token = self.cancel.token();
        token.check()?;

        if !self.has_local_changes() {
            let head = self.store.merged_head().await?;
            if head != self.base {
                debug!(session = %self.id, from = %self.base.short(), to = %head.short(), "fast-forward");
            }
            self.base = head;
            self.local_head = head;
            return Ok(SyncOutcome::FastForward { head });
        }

        let published = self.resolver.resolve_and_publish(self.local_head, &token).await?;
        self.base = published.head;
        self.local_head = published.head;
        Ok(match published.merge {
            Some(merge) => {
                info!(
                    session = %self.id,
                    head = %published.head.short(),
                    attempts = published.attempts,
                    conflicts = merge.report.count(crate::cr::Resolution::ConflictCopy),
                    "local changes merged"
                );
                SyncOutcome::Merged {
                    head: published.head,
                    attempts: published.attempts,
                    report: merge.report,
                }
            }
            None => SyncOutcome::UpToDate { head: published.head },
        })
    }

    /// Tree at the local head
    pub async fn snapshot(&self) -> Result<Arc<Tree>> {
        let rev = self.store.revision(self.local_head).await?;
        Ok(self.store.tree(rev.tree_id).await?)
    }

    /// File bytes at `path` in the local head, following symlinks
    pub async fn read(&self, path: &str) -> Result<Bytes> {
        let tree = self.snapshot().await?;
        let content = journal::content_at(&tree, path)?;
        Ok(self.store.get_block(content).await?)
    }

    /// Directory listing at `path` in the local head, following symlinks
    pub async fn list(&self, path: &str) -> Result<BTreeMap<String, EntryKind>> {
        let tree = self.snapshot().await?;
        Ok(journal::list_dir(&tree, path)?)
    }

    /// Leave the store; unsynchronized local revisions stay staged but unpublished
    pub fn end(self) {
        self.cancel.cancel();
        if self.has_local_changes() {
            warn!(
                session = %self.id,
                local_head = %self.local_head.short(),
                "session ended with unpublished local revisions"
            );
        } else {
            info!(session = %self.id, "session ended");
        }
    }
}
