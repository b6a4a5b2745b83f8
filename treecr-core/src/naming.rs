//! Conflict-copy naming
//!
//! Losing entries are kept under a new name derived from the original name,
//! the branch that produced them and the revision being merged. Names are a
//! pure function of those inputs plus a salt, so every participant picks the
//! same name for the same conflict.

use std::collections::BTreeMap;

use crate::object::{BranchId, NodeId, RevisionId};

/// Inputs shared by every name picked during one merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingContext {
    /// Branch whose entry loses the name
    pub branch: BranchId,
    /// Head revision of that branch
    pub revision: RevisionId,
}

impl NamingContext {
    pub fn new(branch: BranchId, revision: RevisionId) -> Self {
        Self { branch, revision }
    }
}

pub trait ConflictNamer: Send + Sync {
    /// Candidate name for `salt`; salt 0 is the first choice
    fn candidate(&self, name: &str, ctx: &NamingContext, salt: u32) -> String;

    /// First candidate that no sibling already uses
    fn conflict_name(&self, name: &str, siblings: &BTreeMap<String, NodeId>, ctx: &NamingContext) -> String {
        let mut salt = 0;
        loop {
            let candidate = self.candidate(name, ctx, salt);
            if !siblings.contains_key(&candidate) {
                return candidate;
            }
            salt += 1;
        }
    }
}

/// `notes.txt` -> `notes.conflict-bob-1a2b3c4d.txt`, then `...-1a2b3c4d-1.txt`
#[derive(Debug, Clone)]
pub struct SuffixNamer {
    tag: String,
}

impl SuffixNamer {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Default for SuffixNamer {
    fn default() -> Self {
        Self::new("conflict")
    }
}

impl ConflictNamer for SuffixNamer {
    fn candidate(&self, name: &str, ctx: &NamingContext, salt: u32) -> String {
        let (stem, ext) = split_extension(name);
        let mut out = format!("{}.{}-{}-{}", stem, self.tag, ctx.branch, ctx.revision.short());
        if salt > 0 {
            out.push_str(&format!("-{}", salt));
        }
        out.push_str(ext);
        out
    }
}

/// Split off the last extension; dotfiles keep their leading dot in the stem
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectId;

    fn ctx() -> NamingContext {
        NamingContext::new(BranchId::new("bob"), ObjectId::new([0xab; 32]))
    }

    #[test]
    fn test_candidate_keeps_extension() {
        let namer = SuffixNamer::default();
        assert_eq!(namer.candidate("notes.txt", &ctx(), 0), "notes.conflict-bob-abababab.txt");
        assert_eq!(namer.candidate("b", &ctx(), 0), "b.conflict-bob-abababab");
        assert_eq!(namer.candidate(".bashrc", &ctx(), 2), ".bashrc.conflict-bob-abababab-2");
    }

    #[test]
    fn test_conflict_name_bumps_salt() {
        let namer = SuffixNamer::new("clash");
        let mut siblings = BTreeMap::new();
        siblings.insert("b".to_string(), NodeId::derive(&[b"b"]));
        siblings.insert("b.clash-bob-abababab".to_string(), NodeId::derive(&[b"c"]));
        assert_eq!(namer.conflict_name("b", &siblings, &ctx()), "b.clash-bob-abababab-1");
    }
}
