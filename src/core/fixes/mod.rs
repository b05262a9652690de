//! Fix planning and application
//!
//! `FixPlanner` turns an issue into a [`Fix`] using static templates,
//! optionally replaced by an LLM suggestion. `FixApplier` writes fixes with
//! a backup taken first and rolls back when verification fails.

mod applier;
mod planner;
mod templates;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::issues::{Issue, IssueKind};

pub use applier::{list_backups, BackupEntry, FixApplier, ParseVerifier, Verifier};
pub use planner::FixPlanner;
pub use templates::{Draft, FixTemplates};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixAction {
    /// Add a compatibility shim next to the changed code
    Wrapper,
    /// Rewrite existing text in place
    Replace,
    /// Put back what was removed
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub find: String,
    pub replace: String,
}

/// Textual change to a single file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Patch {
    Append(String),
    Replace(Vec<Replacement>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixSource {
    Template,
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub id: String,
    pub issue_ref: String,
    pub issue_kind: IssueKind,
    pub action: FixAction,
    pub patch: Patch,
    /// Relative to the project root
    pub target_path: PathBuf,
    pub confidence: f32,
    pub source: FixSource,
}

impl Fix {
    pub fn new(
        issue: &Issue,
        action: FixAction,
        patch: Patch,
        target_path: PathBuf,
        confidence: f32,
        source: FixSource,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(issue.id.as_bytes());
        hasher.update(format!("{:?}", action).as_bytes());
        hasher.update(target_path.to_string_lossy().as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        Self {
            id: format!("fix-{}", &hash[..12]),
            issue_ref: issue.id.clone(),
            issue_kind: issue.kind,
            action,
            patch,
            target_path,
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }

    /// One-line description for logs and lessons
    pub fn summary(&self) -> String {
        let what = match self.action {
            FixAction::Wrapper => "added a compatibility wrapper to",
            FixAction::Replace => "rewrote stale text in",
            FixAction::Restore => "restored the removed declaration in",
        };
        format!("{} {}", what, self.target_path.display())
    }
}

/// Outcome of a successful apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFix {
    pub fix: Fix,
    /// Absent when the patch was already present and nothing was written
    pub backup_path: Option<PathBuf>,
    pub changed: bool,
    pub applied_at: DateTime<Utc>,
    /// Content of the target after the write
    #[serde(skip)]
    pub content: String,
}
