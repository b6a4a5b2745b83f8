//! Randomized merge properties
//!
//! Two participants start from the same tree, apply random path operations
//! independently, and one of them resolves. Invalid operations (moving a
//! directory into itself, removing a missing file, ...) are rejected by the
//! journal and simply skipped.
//!
//! A three-participant variant lets a second offline participant merge on
//! top of the first one's merge revision.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use treecr_core::{
    CancelToken, CrConfig, Journal, MemoryStore, MergeOutcome, NodeId, ObjectId, Op, Resolver, RevisionId,
    RevisionStore, Session, SyncOutcome, Tree,
};

const PATHS: [&str; 11] = ["a", "b", "a/c", "d", "a/f", "a/g", "b/f", "b/h", "a/c/f", "top", "d/e"];

#[derive(Debug, Clone)]
enum Step {
    Write(usize, u8),
    Remove(usize),
    Rmdir(usize),
    Mkdir(usize),
    Rename(usize, usize),
    SetExec(usize, bool),
    SetMtime(usize, i64),
}

fn step() -> impl Strategy<Value = Step> {
    let path = 0..PATHS.len();
    prop_oneof![
        3 => (path.clone(), 0u8..4).prop_map(|(p, v)| Step::Write(p, v)),
        2 => path.clone().prop_map(Step::Remove),
        1 => path.clone().prop_map(Step::Rmdir),
        1 => path.clone().prop_map(Step::Mkdir),
        3 => (path.clone(), path.clone()).prop_map(|(from, to)| Step::Rename(from, to)),
        1 => (path.clone(), any::<bool>()).prop_map(|(p, e)| Step::SetExec(p, e)),
        1 => (path, 0i64..3).prop_map(|(p, t)| Step::SetMtime(p, t)),
    ]
}

fn apply_steps(journal: &mut Journal, steps: &[Step]) {
    for step in steps {
        // Rejected steps leave the journal untouched
        let _ = match *step {
            Step::Write(p, v) => journal.write(PATHS[p], format!("v{}", v)).map(|_| ()),
            Step::Remove(p) => journal.remove(PATHS[p]),
            Step::Rmdir(p) => journal.rmdir(PATHS[p]),
            Step::Mkdir(p) => journal.mkdir(PATHS[p]).map(|_| ()),
            Step::Rename(from, to) => journal.rename(PATHS[from], PATHS[to]),
            Step::SetExec(p, e) => journal.set_executable(PATHS[p], e),
            Step::SetMtime(p, t) => journal.set_mtime(PATHS[p], t),
        };
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn start(store: &Arc<MemoryStore>, name: &str) -> Session<MemoryStore> {
    Session::start(store.clone(), name, CrConfig::default()).await.unwrap()
}

async fn setup(alice: &mut Session<MemoryStore>) {
    let mut setup = alice.journal().await.unwrap();
    for path in ["a/f", "a/g", "a/c/f", "b/h"] {
        setup.write(path, "base").unwrap();
    }
    setup.mkdir("d/e").unwrap();
    alice.commit_local(setup, "setup").await.unwrap();
}

/// Commit `steps` on `session`; the local revision, if any step stuck
async fn commit_steps(session: &mut Session<MemoryStore>, steps: &[Step], message: &str) -> Option<RevisionId> {
    let mut journal = session.journal().await.unwrap();
    apply_steps(&mut journal, steps);
    if journal.is_empty() {
        return None;
    }
    Some(session.commit_local(journal, message).await.unwrap().revision)
}

fn file_contents(tree: &Tree) -> HashSet<ObjectId> {
    tree.reachable()
        .iter()
        .filter_map(|id| tree.get(id))
        .filter_map(|node| node.attrs.content)
        .collect()
}

/// Content a participant wrote in `local` and still had when it synced must
/// be somewhere in `merged`
async fn assert_content_kept(store: &MemoryStore, who: &str, local: RevisionId, merged: &Tree) {
    let rev = store.revision(local).await.unwrap();
    let live = file_contents(&store.tree(rev.tree_id).await.unwrap());
    let kept = file_contents(merged);
    for op in &rev.ops {
        let written = match op {
            Op::Write { content, .. } => Some(*content),
            Op::Create { attrs, .. } => attrs.content,
            _ => None,
        };
        if let Some(content) = written.filter(|c| live.contains(c)) {
            assert!(kept.contains(&content), "{}'s content {} was lost", who, content.short());
        }
    }
}

async fn check_merge(merged_steps: Vec<Step>, unmerged_steps: Vec<Step>) {
    let store = Arc::new(MemoryStore::new());
    store.initialize().await.unwrap();
    let mut alice = start(&store, "alice").await;
    let mut bob = start(&store, "bob").await;

    setup(&mut alice).await;
    bob.sync().await.unwrap();
    bob.disable_updates();

    let alice_local = commit_steps(&mut alice, &merged_steps, "merged").await;
    let bob_local = commit_steps(&mut bob, &unmerged_steps, "unmerged").await;

    let merged_head = store.merged_head().await.unwrap();
    let unmerged_head = bob.local_head();
    let resolver = Resolver::new(store.clone(), CrConfig::default());

    // Determinism: two runs over the same heads agree byte for byte
    let first = resolver.resolve(merged_head, unmerged_head, &CancelToken::none()).await.unwrap();
    let second = resolver.resolve(merged_head, unmerged_head, &CancelToken::none()).await.unwrap();
    let expected = match (&first, &second) {
        (MergeOutcome::Merged(a), MergeOutcome::Merged(b)) => {
            assert_eq!(a.tree.id(), b.tree.id());
            assert_eq!(a.revision_id(), b.revision_id());
            Some(a.revision_id())
        }
        (MergeOutcome::UpToDate { .. }, MergeOutcome::UpToDate { .. }) => None,
        _ => panic!("runs disagree on whether there is anything to merge"),
    };

    let outcome = bob.enable_updates().await.unwrap();
    if let (Some(expected), SyncOutcome::Merged { head, report, .. }) = (expected, &outcome) {
        assert_eq!(*head, expected);

        // Accounting: every node an unmerged op targeted is explained
        let local = store.revision(unmerged_head).await.unwrap();
        let targets: HashSet<NodeId> = local.ops.iter().map(|op| op.target()).collect();
        for node in targets {
            assert!(report.for_node(&node).next().is_some(), "no resolution for {}", node);
        }
    }

    // Acyclicity
    let tree = bob.snapshot().await.unwrap();
    tree.check_well_formed().unwrap();

    // No data loss: written content that was still live on either side survives
    if let Some(local) = alice_local {
        assert_content_kept(&store, "alice", local, &tree).await;
    }
    if let Some(local) = bob_local {
        assert_content_kept(&store, "bob", local, &tree).await;
    }

    // Convergence: the published merge already contains the unmerged branch
    let head = store.merged_head().await.unwrap();
    let again = resolver.resolve(head, unmerged_head, &CancelToken::none()).await.unwrap();
    assert!(matches!(again, MergeOutcome::UpToDate { .. }));

    alice.sync().await.unwrap();
    assert_eq!(alice.snapshot().await.unwrap().id(), tree.id());
}

/// Bob and carol both work offline against the same base; bob merges first,
/// so carol's merge sees bob's merge revision in the merged chain
async fn check_three_way(merged_steps: Vec<Step>, bob_steps: Vec<Step>, carol_steps: Vec<Step>) {
    let store = Arc::new(MemoryStore::new());
    store.initialize().await.unwrap();
    let mut alice = start(&store, "alice").await;
    let mut bob = start(&store, "bob").await;
    let mut carol = start(&store, "carol").await;

    setup(&mut alice).await;
    for session in [&mut bob, &mut carol] {
        session.sync().await.unwrap();
        session.disable_updates();
    }

    let alice_local = commit_steps(&mut alice, &merged_steps, "merged").await;
    let bob_local = commit_steps(&mut bob, &bob_steps, "bob").await;
    let carol_local = commit_steps(&mut carol, &carol_steps, "carol").await;

    bob.enable_updates().await.unwrap();
    carol.enable_updates().await.unwrap();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    let tree = carol.snapshot().await.unwrap();
    tree.check_well_formed().unwrap();
    assert_eq!(alice.snapshot().await.unwrap().id(), tree.id());
    assert_eq!(bob.snapshot().await.unwrap().id(), tree.id());

    for (who, local) in [("alice", alice_local), ("bob", bob_local), ("carol", carol_local)] {
        if let Some(local) = local {
            assert_content_kept(&store, who, local, &tree).await;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_merge_is_deterministic_acyclic_and_convergent(
        merged in prop::collection::vec(step(), 0..8),
        unmerged in prop::collection::vec(step(), 1..8),
    ) {
        runtime().block_on(check_merge(merged, unmerged));
    }

    #[test]
    fn prop_three_participants_keep_everyones_content(
        merged in prop::collection::vec(step(), 0..6),
        bob in prop::collection::vec(step(), 1..6),
        carol in prop::collection::vec(step(), 1..6),
    ) {
        runtime().block_on(check_three_way(merged, bob, carol));
    }
}
