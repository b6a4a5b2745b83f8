//! Scenario files
//!
//! A scenario describes one divergence between two participants: `setup`
//! runs as alice and is shared, then bob stops syncing while alice applies
//! `merged` and bob applies `unmerged` offline. Resuming bob's updates runs
//! conflict resolution.
//!
//! ```json
//! {
//!   "setup":    [{ "op": "write", "path": "a/b", "data": "hello" }],
//!   "merged":   [{ "op": "write", "path": "a/b", "data": "world" }],
//!   "unmerged": [{ "op": "rename", "from": "a/b", "to": "a/c" }]
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use treecr_core::{
    CrConfig, EntryKind, Journal, MemoryStore, MergeReport, Resolution, RevisionId, Session, SyncOutcome, Tree,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Mkdir { path: String },
    Write { path: String, data: String },
    Rm { path: String },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Setex {
        path: String,
        #[serde(default = "default_executable")]
        executable: bool,
    },
    Setmtime { path: String, mtime: i64 },
    Symlink { path: String, target: String },
}

fn default_executable() -> bool {
    true
}

impl Step {
    fn apply(&self, journal: &mut Journal) -> Result<()> {
        match self {
            Step::Mkdir { path } => {
                journal.mkdir(path)?;
            }
            Step::Write { path, data } => {
                journal.write(path, data.clone())?;
            }
            Step::Rm { path } => journal.remove(path)?,
            Step::Rmdir { path } => journal.rmdir(path)?,
            Step::Rename { from, to } => journal.rename(from, to)?,
            Step::Setex { path, executable } => journal.set_executable(path, *executable)?,
            Step::Setmtime { path, mtime } => journal.set_mtime(path, *mtime)?,
            Step::Symlink { path, target } => {
                journal.symlink(path, target)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub setup: Vec<Step>,
    #[serde(default)]
    pub merged: Vec<Step>,
    #[serde(default)]
    pub unmerged: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("Failed to read scenario {:?}", path))?;
        serde_json::from_str(&data).with_context(|| format!("Failed to parse scenario {:?}", path))
    }
}

/// Final state after replaying a scenario
#[derive(Debug, Clone)]
pub struct Replay {
    pub head: RevisionId,
    pub tree: Arc<Tree>,
    /// None when bob had nothing to merge
    pub report: Option<MergeReport>,
}

async fn run_steps(session: &mut Session<MemoryStore>, steps: &[Step], label: &str) -> Result<()> {
    let mut journal = session.journal().await?;
    for (i, step) in steps.iter().enumerate() {
        step.apply(&mut journal)
            .with_context(|| format!("{} step {} failed: {:?}", label, i + 1, step))?;
    }
    session.commit_local(journal, label).await?;
    Ok(())
}

pub async fn replay(scenario: &Scenario, config: CrConfig) -> Result<Replay> {
    let store = Arc::new(MemoryStore::new());
    store.initialize().await?;
    let mut alice = Session::start(store.clone(), "alice", config.clone()).await?;
    let mut bob = Session::start(store.clone(), "bob", config).await?;

    run_steps(&mut alice, &scenario.setup, "setup").await?;
    bob.sync().await?;
    bob.disable_updates();

    run_steps(&mut alice, &scenario.merged, "merged").await?;
    run_steps(&mut bob, &scenario.unmerged, "unmerged").await?;
    let outcome = bob.enable_updates().await?;
    alice.sync().await?;

    let tree = bob.snapshot().await?;
    if alice.snapshot().await?.id() != tree.id() {
        bail!("participants did not converge on the same tree");
    }
    let head = outcome.head();
    info!(head = %head.short(), nodes = tree.len(), "scenario replayed");

    let report = match outcome {
        SyncOutcome::Merged { report, .. } => Some(report),
        _ => None,
    };
    alice.end();
    bob.end();
    Ok(Replay { head, tree, report })
}

/// One line per entry, depth first, directories suffixed with `/`
pub fn render_tree(tree: &Tree) -> Vec<String> {
    let mut lines = Vec::new();
    render_dir(tree, &tree.root(), "", &mut lines);
    lines
}

fn render_dir(tree: &Tree, dir: &treecr_core::NodeId, prefix: &str, lines: &mut Vec<String>) {
    let Some(entries) = tree.entries(dir) else {
        return;
    };
    for (name, child) in entries {
        let Some(node) = tree.get(child) else {
            continue;
        };
        let path = format!("{}{}", prefix, name);
        match node.kind() {
            EntryKind::Dir => {
                lines.push(format!("{}/", path));
                render_dir(tree, child, &format!("{}/", path), lines);
            }
            EntryKind::Sym => {
                let target = node.attrs.target.as_deref().unwrap_or("");
                lines.push(format!("{} -> {}", path, target));
            }
            kind => lines.push(format!("{} ({}, {} bytes)", path, kind, node.attrs.size)),
        }
    }
}

/// Report line for display, node named by its merged path when it has one
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub node: String,
    pub path: Option<String>,
    pub resolution: Resolution,
    pub detail: String,
}

pub fn summarize(report: &MergeReport, tree: &Tree) -> Vec<RecordSummary> {
    let index = tree.parent_index();
    report
        .records
        .iter()
        .map(|r| RecordSummary {
            node: r.node.short(),
            path: tree.path_with(&index, &r.node).map(|p| p.join("/")),
            resolution: r.resolution,
            detail: r.detail.clone(),
        })
        .collect()
}
