//! Conflict resolution pipeline
//!
//! ```text
//! walker ─▶ chains ─▶ policy ─▶ cycles ─▶ commit ─▶ publish
//! ```
//!
//! [`Resolver::resolve`] runs one episode against a fixed pair of heads and
//! returns the merge revision without publishing it. [`Resolver::resolve_and_publish`]
//! adds the optimistic retry loop: when another participant moves the merged
//! head first, the episode is thrown away and rerun against the new head.

pub mod action;
pub mod cancel;
pub mod chains;
pub mod commit;
pub mod cycles;
pub mod policy;
pub mod walker;

use std::sync::Arc;
use tracing::{info, warn};

pub use crate::error::{CrError, Result};
pub use action::{Action, MergeReport, Placement, Plan, Resolution, ResolutionRecord};
pub use cancel::{CancelHandle, CancelToken};
pub use chains::{ChainSummary, OpChains, Side};

use crate::config::CrConfig;
use crate::naming::{ConflictNamer, NamingContext, SuffixNamer};
use crate::object::{RevisionId, Tree};
use crate::revision::Revision;
use crate::store::{PublishOutcome, RevisionStore};

/// Merge revision ready to publish
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub revision: Revision,
    pub tree: Tree,
    pub report: MergeReport,
}

impl MergeResult {
    pub fn revision_id(&self) -> RevisionId {
        self.revision.id()
    }
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// The unmerged head is already part of the merged history
    UpToDate { head: RevisionId },
    Merged(Box<MergeResult>),
}

/// Result of [`Resolver::resolve_and_publish`]
#[derive(Debug, Clone)]
pub struct PublishedMerge {
    /// Merged head after the episode
    pub head: RevisionId,
    pub attempts: u32,
    /// None when there was nothing to merge
    pub merge: Option<MergeResult>,
}

pub struct Resolver<S: ?Sized> {
    store: Arc<S>,
    config: CrConfig,
    namer: Arc<dyn ConflictNamer>,
}

impl<S: RevisionStore + ?Sized> Resolver<S> {
    pub fn new(store: Arc<S>, config: CrConfig) -> Self {
        let namer = Arc::new(SuffixNamer::new(config.conflict_tag.clone()));
        Self { store, config, namer }
    }

    /// Replace the conflict naming policy
    pub fn with_namer(mut self, namer: Arc<dyn ConflictNamer>) -> Self {
        self.namer = namer;
        self
    }

    pub fn config(&self) -> &CrConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run one episode: merge `unmerged_head` onto `merged_head`
    pub async fn resolve(
        &self,
        merged_head: RevisionId,
        unmerged_head: RevisionId,
        cancel: &CancelToken,
    ) -> Result<MergeOutcome> {
        let walk = walker::walk(self.store.as_ref(), merged_head, unmerged_head).await?;
        cancel.check()?;
        if walk.is_up_to_date() {
            info!(head = %merged_head.short(), "unmerged branch already merged");
            return Ok(MergeOutcome::UpToDate { head: merged_head });
        }

        let (merged_ops, unmerged_ops) = walk.op_count();
        info!(
            ancestor = %walk.ancestor.short(),
            merged_head = %merged_head.short(),
            unmerged_head = %unmerged_head.short(),
            merged_ops,
            unmerged_ops,
            "starting conflict resolution"
        );

        let snapshots = walker::load_snapshots(self.store.as_ref(), &walk).await?;
        cancel.check()?;

        let chains = OpChains::build(&walk.merged, &walk.unmerged);
        chains.validate(&snapshots.ancestor)?;
        let mut plan = policy::plan(&chains, &snapshots.merged, &snapshots.unmerged, unmerged_head)?;
        cycles::break_cycles(&mut plan, &snapshots.merged, unmerged_head)?;

        let unmerged_tip = walk
            .unmerged
            .last()
            .ok_or_else(|| CrError::CorruptChain("empty unmerged chain".to_string()))?;
        let naming = NamingContext::new(unmerged_tip.branch.clone(), unmerged_head);
        let built = commit::build(&snapshots.merged, &mut plan, self.namer.as_ref(), &naming, &self.config)?;
        cancel.check()?;

        let merged_tip = self
            .store
            .revision(merged_head)
            .await
            .map_err(CrError::from_lookup)?;
        let revision = Revision::new(
            vec![merged_head, unmerged_head],
            merged_tip.seq + 1,
            unmerged_tip.branch.clone(),
            merged_tip.timestamp.max(unmerged_tip.timestamp),
            format!(
                "Merge {} ({}) into {}",
                unmerged_tip.branch,
                unmerged_head.short(),
                merged_head.short()
            ),
            built.tree.id(),
            built.ops,
        );

        let mut report = plan.report;
        report.ancestor = Some(walk.ancestor);
        report.merged_head = Some(merged_head);
        report.unmerged_head = Some(unmerged_head);
        report.merged_ops = merged_ops;
        report.unmerged_ops = unmerged_ops;

        info!(
            revision = %revision.id().short(),
            ops = revision.ops.len(),
            records = report.records.len(),
            "conflict resolution finished"
        );
        Ok(MergeOutcome::Merged(Box::new(MergeResult {
            revision,
            tree: built.tree,
            report,
        })))
    }

    /// Resolve against the current merged head and publish, retrying while
    /// other participants win the race
    pub async fn resolve_and_publish(&self, unmerged_head: RevisionId, cancel: &CancelToken) -> Result<PublishedMerge> {
        let max_attempts = self.config.max_publish_retries.max(1);
        for attempt in 1..=max_attempts {
            cancel.check()?;
            let merged_head = self.store.merged_head().await?;
            let result = match self.resolve(merged_head, unmerged_head, cancel).await? {
                MergeOutcome::UpToDate { head } => {
                    return Ok(PublishedMerge {
                        head,
                        attempts: attempt,
                        merge: None,
                    });
                }
                MergeOutcome::Merged(result) => *result,
            };

            cancel.check()?;
            match self.store.publish(result.revision.clone(), result.tree.clone()).await? {
                PublishOutcome::Published(id) => {
                    info!(revision = %id.short(), attempt, "published merge revision");
                    return Ok(PublishedMerge {
                        head: id,
                        attempts: attempt,
                        merge: Some(result),
                    });
                }
                PublishOutcome::Raced { head } => {
                    warn!(
                        attempt,
                        max_attempts,
                        head = %head.short(),
                        "merged head moved during resolution; retrying"
                    );
                }
            }
        }
        Err(CrError::RetriesExhausted {
            attempts: max_attempts,
        })
    }
}
