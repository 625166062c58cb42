//! Operator-approved scope expansions.
//!
//! An approval widens the allow-list for exactly one attempt. Approvals are
//! only ever read from an operator-supplied file, never inferred from tool
//! output.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DevloopError, Result};
use crate::patch::normalize_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeApproval {
    /// Attempt number (1-based) this approval applies to
    pub attempt: u32,
    pub paths: Vec<String>,
    pub approved_by: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ApprovalFile {
    List(Vec<ScopeApproval>),
    Wrapped { approvals: Vec<ScopeApproval> },
}

/// All approvals supplied for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalSet {
    approvals: Vec<ScopeApproval>,
}

impl ApprovalSet {
    pub fn new(approvals: Vec<ScopeApproval>) -> Result<Self> {
        let mut normalized = Vec::with_capacity(approvals.len());
        for mut approval in approvals {
            if approval.attempt == 0 {
                return Err(DevloopError::Config("scope approval attempt numbers start at 1".to_string()));
            }
            if approval.approved_by.trim().is_empty() {
                return Err(DevloopError::Config(format!(
                    "scope approval for attempt {} has no approver",
                    approval.attempt
                )));
            }
            approval.paths = approval
                .paths
                .iter()
                .map(|p| normalize_path(p))
                .filter(|p| !p.is_empty())
                .collect();
            if approval.paths.is_empty() {
                return Err(DevloopError::Config(format!(
                    "scope approval for attempt {} lists no paths",
                    approval.attempt
                )));
            }
            normalized.push(approval);
        }
        Ok(Self { approvals: normalized })
    }

    /// Load approvals from a YAML or JSON file: either a bare list or
    /// `{approvals: [...]}`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let approvals = match serde_yaml::from_str::<ApprovalFile>(content)? {
            ApprovalFile::List(list) => list,
            ApprovalFile::Wrapped { approvals } => approvals,
        };
        Self::new(approvals)
    }

    pub fn for_attempt(&self, attempt: u32) -> Vec<&ScopeApproval> {
        self.approvals.iter().filter(|a| a.attempt == attempt).collect()
    }

    pub fn all(&self) -> &[ScopeApproval] {
        &self.approvals
    }

    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty()
    }
}
