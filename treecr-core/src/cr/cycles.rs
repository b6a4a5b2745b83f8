//! Rename cycle breaking
//!
//! Independent renames on the two branches can ask for a directory to become
//! its own ancestor (merged moves `b` under `a` while unmerged moves `a` under
//! `b`). Before anything is applied, the containment graph the plan would
//! produce is checked; each cycle is broken at its latest unmerged move, which
//! becomes a symlink to wherever the node really lives. The node itself stays
//! at its merged location.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::object::{Location, NodeId, RevisionId, Tree};

use super::action::{Action, Plan, Resolution};
use super::{CrError, Result};

/// Rewrite moves that would close a cycle into symlinks; returns how many.
/// Link ids are scoped to `episode`, the unmerged head being merged.
pub fn break_cycles(plan: &mut Plan, merged: &Tree, episode: RevisionId) -> Result<usize> {
    let m_index = merged.parent_index();
    let limit = plan.actions.len();
    let mut broken = 0;

    loop {
        let parents = proposed_parents(plan, &m_index);
        let Some(cycle) = find_cycle(&parents) else {
            if broken > 0 {
                info!(broken, "rename cycles broken with symlinks");
            }
            return Ok(broken);
        };
        if broken >= limit {
            return Err(CrError::Apply(format!("could not break cycle through {}", cycle[0])));
        }

        let idx = plan
            .actions
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match a {
                Action::Place { node, order, .. } if a.is_move() && cycle.contains(node) => Some((*order, *node, i)),
                _ => None,
            })
            .max()
            .map(|(_, _, i)| i)
            .ok_or_else(|| CrError::Apply(format!("cycle through {} contains no move", cycle[0])))?;

        let Action::Place {
            node,
            parent,
            name,
            order,
            ..
        } = plan.actions[idx].clone()
        else {
            return Err(CrError::Apply("cycle breaking point is not a placement".to_string()));
        };

        debug!(node = %node, parent = %parent, name = %name, "breaking rename cycle");
        let link = NodeId::derive(&[b"symlink", node.as_bytes(), parent.as_bytes(), episode.as_bytes()]);
        plan.actions[idx] = Action::Symlink {
            parent,
            name: name.clone(),
            link,
            target: node,
            order,
        };
        plan.record(
            node,
            Resolution::CycleBroken,
            format!("move to '{}' would close a cycle; symlink placed instead", name),
        );

        // The node stays where the merged tree has it, so its merged
        // ancestors must survive
        let mut cur = node;
        while let Some((ancestor, _)) = m_index.get(&cur) {
            if let Some(i) = plan.removal_of(ancestor) {
                plan.actions.remove(i);
                plan.record(*ancestor, Resolution::KeptNonEmpty, format!("still holds {}", node));
            }
            cur = *ancestor;
        }
        broken += 1;
    }
}

/// Child -> parent after applying every placement and removal in the plan
fn proposed_parents(plan: &Plan, m_index: &HashMap<NodeId, Location>) -> BTreeMap<NodeId, NodeId> {
    let mut parents: BTreeMap<NodeId, NodeId> = m_index
        .iter()
        .map(|(child, (parent, _))| (*child, *parent))
        .collect();
    for action in &plan.actions {
        match action {
            Action::Place { node, parent, .. } => {
                parents.insert(*node, *parent);
            }
            Action::Remove { node, .. } => {
                parents.remove(node);
            }
            _ => {}
        }
    }
    parents
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// First cycle found walking parent pointers from each node in id order
fn find_cycle(parents: &BTreeMap<NodeId, NodeId>) -> Option<Vec<NodeId>> {
    let mut state: HashMap<NodeId, Visit> = HashMap::new();
    for start in parents.keys() {
        if state.contains_key(start) {
            continue;
        }
        let mut path = Vec::new();
        let mut cur = *start;
        loop {
            match state.get(&cur) {
                Some(Visit::Done) => break,
                Some(Visit::InProgress) => {
                    let pos = path.iter().position(|n| *n == cur).unwrap_or(0);
                    return Some(path[pos..].to_vec());
                }
                None => {
                    state.insert(cur, Visit::InProgress);
                    path.push(cur);
                    match parents.get(&cur) {
                        Some(parent) => cur = *parent,
                        None => break,
                    }
                }
            }
        }
        for node in path {
            state.insert(node, Visit::Done);
        }
    }
    None
}
