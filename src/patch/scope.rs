//! Scope Guard: the file allow-list sandbox.
//!
//! A path may be touched only if it is on the task allow-list or on an
//! explicit approval for the current attempt.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{ParsedPatch, normalize_path};
use crate::domain::ScopeApproval;

/// Per-path scope decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub path: String,
    pub allowed: bool,
    /// Allowed only because of an approved expansion
    pub via_expansion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDecision {
    pub entries: Vec<ScopeEntry>,
}

impl ScopeDecision {
    pub fn is_allowed(&self) -> bool {
        self.entries.iter().all(|e| e.allowed)
    }

    pub fn denied(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| !e.allowed)
            .map(|e| e.path.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeGuard {
    allowed: BTreeSet<String>,
    expansion: BTreeSet<String>,
}

impl ScopeGuard {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed.into_iter().map(|p| normalize_path(p.as_ref())).collect(),
            expansion: BTreeSet::new(),
        }
    }

    /// Widen scope with an operator approval.
    pub fn with_expansion(mut self, approval: &ScopeApproval) -> Self {
        for path in &approval.paths {
            let path = normalize_path(path);
            if !self.allowed.contains(&path) {
                self.expansion.insert(path);
            }
        }
        self
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.allowed.contains(&path) || self.expansion.contains(&path)
    }

    /// Effective allow-list: task files plus any expansion, sorted.
    pub fn allowed_paths(&self) -> Vec<String> {
        self.allowed.union(&self.expansion).cloned().collect()
    }

    pub fn check_paths<S: AsRef<str>>(&self, paths: &[S]) -> ScopeDecision {
        let entries = paths
            .iter()
            .map(|p| {
                let path = normalize_path(p.as_ref());
                let base = self.allowed.contains(&path);
                let expanded = !base && self.expansion.contains(&path);
                ScopeEntry {
                    path,
                    allowed: base || expanded,
                    via_expansion: expanded,
                }
            })
            .collect();
        ScopeDecision { entries }
    }

    /// Decide every path the patch touches, both sides of a rename included.
    pub fn check(&self, patch: &ParsedPatch) -> ScopeDecision {
        self.check_paths(&patch.touched_paths())
    }
}
