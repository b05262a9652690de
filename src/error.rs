use std::path::PathBuf;

use thiserror::Error;

/// Main error type for Docsmith operations
#[derive(Error, Debug)]
pub enum DocsmithError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Lesson store error: {0}")]
    Store(String),

    #[error("LLM backend error: {0}")]
    Llm(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Review queue has no fix with id {0}")]
    UnknownFix(String),
}

pub type Result<T> = std::result::Result<T, DocsmithError>;

/// A file could not be parsed. The previous parse of the node is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {reason}")]
pub struct ParseError {
    pub path: PathBuf,
    pub reason: String,
}

impl ParseError {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A single detection rule failed; the other rules still run.
#[derive(Error, Debug, Clone)]
#[error("rule `{rule}` failed: {reason}")]
pub struct DetectionError {
    pub rule: &'static str,
    pub reason: String,
}

/// Fix planning could not reach or use the suggestion backend.
#[derive(Error, Debug, Clone)]
pub enum PlanningError {
    #[error("suggestion backend timed out after {0}s")]
    Timeout(u64),

    #[error("suggestion backend failed: {0}")]
    Backend(String),
}

/// Why a fix could not be applied.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error("verification failed for {path}: {reason}")]
    VerificationFailed { path: PathBuf, reason: String },

    #[error("write failed for {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("fix confidence {confidence:.2} is below the auto-apply threshold {threshold:.2}")]
    BelowThreshold { confidence: f32, threshold: f32 },

    #[error("ROLLBACK FAILED for {path} (backup at {backup}): {reason}")]
    RollbackFailed {
        path: PathBuf,
        backup: PathBuf,
        reason: String,
    },
}
