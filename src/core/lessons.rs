//! Durable lessons learned from resolved and abandoned issues
//!
//! Lessons are written once and never mutated. The store only needs `put`
//! and `scan`, so any key-value or document store can back it; the default
//! is an append-only JSON Lines file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::fixes::Fix;
use super::issues::{technology_of, Issue, IssueKind, Severity};
use crate::config::SimilarityWeights;
use crate::error::{DocsmithError, Result};

/// How an issue ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Applied,
    RolledBack,
    QueuedForReview,
    /// No strategy could produce a fix
    NoFix,
    /// The write itself failed
    Failed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub issue_kind: IssueKind,
    pub severity: Severity,
    pub path: PathBuf,
    pub technology: String,
    pub category: String,
    pub root_cause: String,
    pub solution_summary: String,
    pub prevention_strategies: Vec<String>,
    pub tags: Vec<String>,
    pub outcome: Outcome,
    pub confidence: f32,
}

/// A lesson with its similarity to the issue at hand
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLesson {
    pub lesson: Lesson,
    pub score: f32,
}

#[async_trait]
pub trait LessonStore: Send + Sync {
    /// Store a lesson under `id`; an existing id is an error
    async fn put(&self, id: &str, lesson: &Lesson) -> Result<()>;

    async fn scan(&self) -> Result<Vec<Lesson>>;
}

/// Append-only JSON Lines file
pub struct JsonlLessonStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLessonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LessonStore for JsonlLessonStore {
    async fn put(&self, id: &str, lesson: &Lesson) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if self.scan().await?.iter().any(|l| l.id == id) {
            return Err(DocsmithError::Store(format!("lesson {} already recorded", id)));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_string(lesson)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Lesson>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut lessons = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Lesson>(line) {
                Ok(lesson) => lessons.push(lesson),
                Err(e) => warn!(
                    "⚠️ Skipping unreadable lesson at {}:{}: {}",
                    self.path.display(),
                    index + 1,
                    e
                ),
            }
        }
        Ok(lessons)
    }
}

/// In-process store for tests and hosts without persistence
#[derive(Default)]
pub struct MemoryLessonStore {
    lessons: RwLock<Vec<Lesson>>,
}

impl MemoryLessonStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LessonStore for MemoryLessonStore {
    async fn put(&self, id: &str, lesson: &Lesson) -> Result<()> {
        let mut lessons = self.lessons.write().await;
        if lessons.iter().any(|l| l.id == id) {
            return Err(DocsmithError::Store(format!("lesson {} already recorded", id)));
        }
        lessons.push(lesson.clone());
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Lesson>> {
        Ok(self.lessons.read().await.clone())
    }
}

/// Records lessons and answers similarity queries over the store
pub struct LessonBook {
    store: Arc<dyn LessonStore>,
    weights: SimilarityWeights,
    threshold: f32,
}

impl LessonBook {
    pub fn new(store: Arc<dyn LessonStore>, weights: SimilarityWeights, threshold: f32) -> Self {
        Self {
            store,
            weights,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn record(&self, issue: &Issue, fix: Option<&Fix>, outcome: Outcome) -> Result<Lesson> {
        let timestamp = Utc::now();
        let technology = technology_of(&issue.path).to_string();
        let category = category_of(&issue.path);

        let mut hasher = Sha256::new();
        hasher.update(issue.id.as_bytes());
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(format!("{:?}", outcome).as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let solution_summary = match (fix, outcome) {
            (Some(fix), Outcome::Applied) => format!("Applied: {}", fix.summary()),
            (Some(fix), Outcome::RolledBack) => {
                format!("Rolled back after failed verification: {}", fix.summary())
            }
            (Some(fix), Outcome::QueuedForReview) => format!(
                "Queued for review at confidence {:.2}: {}",
                fix.confidence,
                fix.summary()
            ),
            (Some(fix), Outcome::Failed) => format!("Write failed: {}", fix.summary()),
            (Some(fix), Outcome::Rejected) => format!("Rejected by reviewer: {}", fix.summary()),
            (_, Outcome::NoFix) | (None, _) => "No automatic fix available".to_string(),
        };

        let lesson = Lesson {
            id: format!("lesson-{}", &hash[..16]),
            timestamp,
            issue_kind: issue.kind,
            severity: issue.severity,
            path: issue.path.clone(),
            tags: vec![issue.kind.to_string(), technology.clone(), category.clone()],
            technology,
            category,
            root_cause: issue.message.clone(),
            solution_summary,
            prevention_strategies: prevention_strategies(issue.kind),
            outcome,
            confidence: fix.map_or(0.0, |f| f.confidence),
        };

        self.store.put(&lesson.id, &lesson).await?;
        debug!("Recorded {} for {}", lesson.id, issue.id);
        Ok(lesson)
    }

    /// Lessons scoring at least `threshold`, best first, newest first on ties
    pub async fn find_similar(&self, issue: &Issue, threshold: f32) -> Result<Vec<ScoredLesson>> {
        let technology = technology_of(&issue.path);
        let category = category_of(&issue.path);

        let mut scored: Vec<ScoredLesson> = self
            .store
            .scan()
            .await?
            .into_iter()
            .map(|lesson| {
                let score = similarity(&self.weights, issue, technology, &category, &lesson);
                ScoredLesson { lesson, score }
            })
            .filter(|s| s.score >= threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.lesson.timestamp.cmp(&a.lesson.timestamp))
        });
        Ok(scored)
    }

    /// `find_similar` at the configured threshold
    pub async fn similar(&self, issue: &Issue) -> Result<Vec<ScoredLesson>> {
        self.find_similar(issue, self.threshold).await
    }

    /// Prevention strategies from lessons about the same technology and category
    pub async fn warnings_for(&self, path: &Path) -> Result<Vec<String>> {
        let technology = technology_of(path);
        let category = category_of(path);

        let mut lessons: Vec<Lesson> = self
            .store
            .scan()
            .await?
            .into_iter()
            .filter(|l| l.technology == technology && l.category == category)
            .collect();
        lessons.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut seen = HashSet::new();
        Ok(lessons
            .into_iter()
            .flat_map(|l| l.prevention_strategies)
            .filter(|s| seen.insert(s.clone()))
            .collect())
    }

    /// All lessons, optionally of one kind, oldest first
    pub async fn list(&self, kind: Option<IssueKind>) -> Result<Vec<Lesson>> {
        Ok(self
            .store
            .scan()
            .await?
            .into_iter()
            .filter(|l| kind.map_or(true, |k| l.issue_kind == k))
            .collect())
    }
}

fn similarity(
    weights: &SimilarityWeights,
    issue: &Issue,
    technology: &str,
    category: &str,
    lesson: &Lesson,
) -> f32 {
    let mut score = 0.0;
    if lesson.issue_kind == issue.kind {
        score += weights.kind;
    }
    if lesson.severity == issue.severity {
        score += weights.severity;
    }
    if lesson.technology == technology {
        score += weights.technology;
    }
    if lesson.category == category {
        score += weights.category;
    }
    score
}

/// Top-level directory of a path, `root` for files at the top
fn category_of(path: &Path) -> String {
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(first), Some(_)) => first.as_os_str().to_string_lossy().to_string(),
        _ => "root".to_string(),
    }
}

fn prevention_strategies(kind: IssueKind) -> Vec<String> {
    let strategies: &[&str] = match kind {
        IssueKind::BreakingChange => &[
            "Search for usages before removing an export",
            "Deprecate exports for a release before deleting them",
        ],
        IssueKind::ApiContractViolation => &[
            "Add new parameters as optional",
            "Keep the old signature behind a wrapper until callers migrate",
        ],
        IssueKind::OutdatedDoc => &[
            "Update documentation examples in the same change as the code",
            "Import documented symbols in examples so drift is detected",
        ],
        IssueKind::TypeError => &["Run the type checker before committing"],
        IssueKind::TestFailure => &["Run the affected tests before committing"],
    };
    strategies.iter().map(|s| s.to_string()).collect()
}
