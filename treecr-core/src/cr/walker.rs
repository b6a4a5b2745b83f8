//! Chain walker: locate the divergence point of the two branches and load
//! the revisions each side made since.

use std::sync::Arc;
use tracing::debug;

use crate::object::{RevisionId, Tree};
use crate::revision::Revision;
use crate::store::RevisionStore;

use super::{CrError, Result};

/// Both sides of a divergence, oldest revision first
#[derive(Debug, Clone)]
pub struct ChainWalk {
    pub ancestor: RevisionId,
    pub merged_head: RevisionId,
    pub unmerged_head: RevisionId,
    pub merged: Vec<Arc<Revision>>,
    pub unmerged: Vec<Arc<Revision>>,
}

impl ChainWalk {
    /// Nothing to reconcile: the unmerged head is already part of the merged history
    pub fn is_up_to_date(&self) -> bool {
        self.unmerged.is_empty()
    }

    pub fn op_count(&self) -> (usize, usize) {
        let count = |revs: &[Arc<Revision>]| revs.iter().map(|r| r.ops.len()).sum();
        (count(&self.merged), count(&self.unmerged))
    }
}

/// Snapshots the resolver reads from
#[derive(Debug, Clone)]
pub struct Snapshots {
    pub ancestor: Arc<Tree>,
    pub merged: Arc<Tree>,
    pub unmerged: Arc<Tree>,
}

pub async fn walk<S: RevisionStore + ?Sized>(
    store: &S,
    merged_head: RevisionId,
    unmerged_head: RevisionId,
) -> Result<ChainWalk> {
    let ancestor = store
        .common_ancestor(merged_head, unmerged_head)
        .await
        .map_err(CrError::from_lookup)?
        .ok_or(CrError::Divergence {
            merged: merged_head,
            unmerged: unmerged_head,
        })?;

    let merged = store
        .revisions_since(merged_head, ancestor)
        .await
        .map_err(CrError::from_lookup)?;
    let unmerged = store
        .revisions_since(unmerged_head, ancestor)
        .await
        .map_err(CrError::from_lookup)?;
    check_sequence(&merged, "merged")?;
    check_sequence(&unmerged, "unmerged")?;

    debug!(
        ancestor = %ancestor.short(),
        merged = merged.len(),
        unmerged = unmerged.len(),
        "walked branch chains"
    );
    Ok(ChainWalk {
        ancestor,
        merged_head,
        unmerged_head,
        merged,
        unmerged,
    })
}

pub async fn load_snapshots<S: RevisionStore + ?Sized>(store: &S, walk: &ChainWalk) -> Result<Snapshots> {
    let tree_of = |id: RevisionId| async move {
        let rev = store.revision(id).await.map_err(CrError::from_lookup)?;
        store.tree(rev.tree_id).await.map_err(CrError::from_lookup)
    };
    Ok(Snapshots {
        ancestor: tree_of(walk.ancestor).await?,
        merged: tree_of(walk.merged_head).await?,
        unmerged: tree_of(walk.unmerged_head).await?,
    })
}

/// Op order relies on strictly increasing sequence numbers along a chain
fn check_sequence(revs: &[Arc<Revision>], side: &str) -> Result<()> {
    for pair in revs.windows(2) {
        if pair[1].seq <= pair[0].seq {
            return Err(CrError::CorruptChain(format!(
                "{} chain sequence goes from {} to {}",
                side, pair[0].seq, pair[1].seq
            )));
        }
    }
    Ok(())
}
