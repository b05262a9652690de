//! The change pipeline: one run per file event, from parse to lesson.
//!
//! Runs for different files may overlap. Runs for the same file never do:
//! an event arriving while its file is in flight marks the run for a rerun
//! against the latest content instead of queueing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::differ::ChangeDetector;
use super::events::{EventSink, FileEvent, PipelineEvent, PipelineState, TracingSink};
use super::fixes::{AppliedFix, Fix, FixApplier, FixPlanner, ParseVerifier};
use super::graph::{NodeKind, ProjectGraph};
use super::impact::ImpactAnalyzer;
use super::issues::{Issue, IssueDetector};
use super::lessons::{JsonlLessonStore, Lesson, LessonBook, Outcome};
use super::llm::create_backend;
use super::parser::SourceParser;
use super::scheduler::{CancelToken, SweepControl};
use super::validator::{DocValidator, ValidationResult};
use crate::config::Config;
use crate::error::{ApplyError, DocsmithError, ParseError, Result};

/// The injected parts of a pipeline
pub struct Collaborators {
    pub parser: Arc<SourceParser>,
    pub planner: FixPlanner,
    pub applier: FixApplier,
    pub lessons: LessonBook,
    pub sink: Arc<dyn EventSink>,
}

/// A fix waiting for a human decision
#[derive(Debug, Clone)]
pub struct PendingFix {
    pub issue: Issue,
    pub fix: Fix,
    pub queued_at: DateTime<Utc>,
}

/// How one issue was handled
#[derive(Debug, Clone)]
pub enum Resolution {
    Applied(AppliedFix),
    Queued(Fix),
    RolledBack(Fix),
    Failed(Fix),
    NoFix,
}

impl Resolution {
    fn outcome(&self) -> Outcome {
        match self {
            Resolution::Applied(_) => Outcome::Applied,
            Resolution::Queued(_) => Outcome::QueuedForReview,
            Resolution::RolledBack(_) => Outcome::RolledBack,
            Resolution::Failed(_) => Outcome::Failed,
            Resolution::NoFix => Outcome::NoFix,
        }
    }

    fn fix(&self) -> Option<&Fix> {
        match self {
            Resolution::Applied(applied) => Some(&applied.fix),
            Resolution::Queued(fix) | Resolution::RolledBack(fix) | Resolution::Failed(fix) => Some(fix),
            Resolution::NoFix => None,
        }
    }
}

/// What happened while handling one file event
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub path: PathBuf,
    pub issues: Vec<Issue>,
    pub resolutions: Vec<Resolution>,
    pub parse_error: Option<ParseError>,
    /// Content hash matched the graph; nothing was diffed
    pub unchanged: bool,
    /// Folded into a run already in flight for this path
    pub coalesced: bool,
    pub removed: bool,
    pub runs: usize,
}

impl RunSummary {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn applied(&self) -> impl Iterator<Item = &AppliedFix> {
        self.resolutions.iter().filter_map(|r| match r {
            Resolution::Applied(applied) => Some(applied),
            _ => None,
        })
    }

    pub fn queued(&self) -> impl Iterator<Item = &Fix> {
        self.resolutions.iter().filter_map(|r| match r {
            Resolution::Queued(fix) => Some(fix),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub checked: usize,
    pub issues: Vec<Issue>,
    pub resolutions: Vec<Resolution>,
    pub cancelled: bool,
}

pub struct Pipeline {
    root: PathBuf,
    ignore_dirs: Vec<String>,
    skip_unchanged: bool,
    auto_apply: bool,
    parser: Arc<SourceParser>,
    graph: Arc<RwLock<ProjectGraph>>,
    changes: ChangeDetector,
    impact: ImpactAnalyzer,
    detector: IssueDetector,
    validator: DocValidator,
    planner: FixPlanner,
    applier: FixApplier,
    lessons: LessonBook,
    sink: Arc<dyn EventSink>,
    /// Paths with a run in flight, and whether another run was requested
    in_flight: Mutex<HashMap<PathBuf, bool>>,
    review: Mutex<Vec<PendingFix>>,
    sweep: SweepControl,
}

impl Pipeline {
    pub fn new(config: &Config, graph: ProjectGraph, parts: Collaborators) -> Self {
        Self {
            root: graph.root().to_path_buf(),
            ignore_dirs: config.project.ignore_dirs.clone(),
            skip_unchanged: config.pipeline.skip_unchanged,
            auto_apply: config.fixes.auto_apply,
            parser: parts.parser,
            graph: Arc::new(RwLock::new(graph)),
            changes: ChangeDetector::new(),
            impact: ImpactAnalyzer::new(),
            detector: IssueDetector::new(),
            validator: DocValidator::new(),
            planner: parts.planner,
            applier: parts.applier.with_sink(parts.sink.clone()),
            lessons: parts.lessons,
            sink: parts.sink,
            in_flight: Mutex::new(HashMap::new()),
            review: Mutex::new(Vec::new()),
            sweep: SweepControl::new(),
        }
    }

    /// Scan the project and wire the default collaborators from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let root = std::fs::canonicalize(&config.project.root).map_err(|e| {
            DocsmithError::Config(format!(
                "project root {} is not accessible: {}",
                config.project.root.display(),
                e
            ))
        })?;
        let mut config = config.clone();
        config.project.root = root.clone();

        let parser = Arc::new(SourceParser::new(&config.parsing, &config.project));
        let graph = ProjectGraph::scan(&root, &parser, &config)?;

        let backend = match create_backend(&config.llm) {
            Ok(Some(backend)) => {
                info!("✅ LLM suggestions enabled: {} ({})", backend.provider_name(), backend.model_name());
                Some(backend)
            }
            Ok(None) => {
                debug!("LLM suggestions disabled");
                None
            }
            Err(e) => {
                warn!("⚠️ Failed to initialize LLM backend: {}", e);
                warn!("Continuing with template fixes only");
                None
            }
        };
        let planner = FixPlanner::new(backend, Duration::from_secs(config.llm.timeout_secs))?;

        let verifier = Arc::new(ParseVerifier::new(
            parser.clone(),
            &root,
            config.fixes.verify_command.clone(),
            Duration::from_secs(config.fixes.verify_timeout_secs),
        ));
        let applier = FixApplier::new(
            &root,
            config.backup_dir(),
            config.pipeline.confidence_threshold,
            verifier,
        );

        let lessons = LessonBook::new(
            Arc::new(JsonlLessonStore::new(config.lesson_store_path())),
            config.lessons.weights,
            config.lessons.similarity_threshold,
        );

        Ok(Self::new(
            &config,
            graph,
            Collaborators {
                parser,
                planner,
                applier,
                lessons,
                sink: Arc::new(TracingSink),
            },
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn graph(&self) -> Arc<RwLock<ProjectGraph>> {
        self.graph.clone()
    }

    pub fn lessons(&self) -> &LessonBook {
        &self.lessons
    }

    pub fn sweep_control(&self) -> SweepControl {
        self.sweep.clone()
    }

    /// Prevention strategies worth showing before editing `path`
    pub async fn warnings_for(&self, path: &Path) -> Result<Vec<String>> {
        self.lessons.warnings_for(&self.relative(path)).await
    }

    /// Handle one watcher event
    pub async fn handle(&self, event: FileEvent) -> Result<RunSummary> {
        let path = self.relative(event.path());
        if self.is_ignored(&path) {
            return Ok(RunSummary::new(&path));
        }

        // Fresh edits take priority over a background sweep
        self.sweep.interrupt();

        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(rerun) = in_flight.get_mut(&path) {
                debug!("Coalescing event for {} into the run in flight", path.display());
                *rerun = true;
                let mut summary = RunSummary::new(&path);
                summary.coalesced = true;
                return Ok(summary);
            }
            in_flight.insert(path.clone(), false);
        }

        let mut summary = RunSummary::new(&path);
        let mut removal = matches!(event, FileEvent::Removed(_));
        let result = loop {
            summary.runs += 1;
            let run = if removal {
                self.remove(&path, &mut summary).await
            } else {
                self.run_once(&path, &mut summary).await
            };

            let mut in_flight = self.in_flight.lock().await;
            if run.is_ok() && in_flight.get(&path).copied().unwrap_or(false) {
                in_flight.insert(path.clone(), false);
                // The rerun looks at whatever is on disk now
                removal = false;
                continue;
            }
            in_flight.remove(&path);
            break run;
        };

        self.transition(&path, PipelineState::Idle);
        result.map(|_| summary)
    }

    async fn run_once(&self, path: &Path, summary: &mut RunSummary) -> Result<()> {
        if !self.parser.handles(path) {
            return Ok(());
        }

        self.transition(path, PipelineState::Parsing);
        let content = match tokio::fs::read_to_string(self.root.join(path)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.remove(path, summary).await;
            }
            Err(e) => return Err(e.into()),
        };

        let previous = {
            let graph = self.graph.read().await;
            graph
                .get(path)
                .map(|n| (n.content_hash.clone(), n.symbols().to_vec()))
        };

        if self.skip_unchanged {
            if let Some((hash, _)) = &previous {
                if !self.changes.has_content_changed(hash, &content) {
                    debug!("{} unchanged, skipping", path.display());
                    summary.unchanged = true;
                    return Ok(());
                }
            }
        }

        let parsed = match self.parser.parse(path, &content) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.sink.emit(PipelineEvent::ParseFailed(e.clone()));
                summary.parse_error = Some(e);
                return Ok(());
            }
        };
        summary.parse_error = None;
        summary.unchanged = false;

        self.transition(path, PipelineState::Diffing);
        let old_symbols = previous.map(|(_, symbols)| symbols).unwrap_or_default();
        let changes = self.changes.diff(path, &old_symbols, parsed.symbols());

        // Upsert and analyse under one lock so readers never see a half-applied change
        let issues = {
            let mut graph = self.graph.write().await;
            graph.upsert(parsed);
            let graph = graph.downgrade();

            self.transition(path, PipelineState::ImpactAnalysis);
            let report = self.impact.analyze(&graph, path, &changes);
            debug!(
                "{}: {} direct, {} indirect, {} critical",
                path.display(),
                report.direct.len(),
                report.indirect.len(),
                report.critical.len()
            );

            self.transition(path, PipelineState::IssueDetection);
            let mut issues = self.detector.detect(&changes, &report, &graph);
            if graph.get(path).map_or(false, |n| n.kind == NodeKind::DocFile) {
                issues.extend(self.validator.validate_file(&graph, path));
            }
            issues
        };

        self.resolve_all(issues, summary).await
    }

    async fn remove(&self, path: &Path, summary: &mut RunSummary) -> Result<()> {
        let issues = {
            let mut graph = self.graph.write().await;
            let Some(old_symbols) = graph.get(path).map(|n| n.symbols().to_vec()) else {
                return Ok(());
            };

            self.transition(path, PipelineState::Diffing);
            let changes = self.changes.diff(path, &old_symbols, &[]);
            self.transition(path, PipelineState::ImpactAnalysis);
            let report = self.impact.analyze(&graph, path, &changes);
            self.transition(path, PipelineState::IssueDetection);
            let issues = self.detector.detect(&changes, &report, &graph);

            graph.remove(path);
            issues
        };

        summary.removed = true;
        self.sink.emit(PipelineEvent::NodeRemoved(path.to_path_buf()));
        self.resolve_all(issues, summary).await
    }

    async fn resolve_all(&self, issues: Vec<Issue>, summary: &mut RunSummary) -> Result<()> {
        for issue in issues {
            self.sink.emit(PipelineEvent::IssueDetected(issue.clone()));
            let resolution = self.resolve(&issue).await;
            summary.issues.push(issue);
            summary.resolutions.push(resolution?);
        }
        Ok(())
    }

    /// Plan, gate, apply or queue, then record a lesson
    async fn resolve(&self, issue: &Issue) -> Result<Resolution> {
        self.transition(&issue.path, PipelineState::FixPlanning);

        let prior: Vec<String> = match self.lessons.similar(issue).await {
            Ok(similar) => {
                let mut seen = HashSet::new();
                similar
                    .into_iter()
                    .flat_map(|s| s.lesson.prevention_strategies)
                    .filter(|s| seen.insert(s.clone()))
                    .collect()
            }
            Err(e) => {
                warn!("⚠️ Lesson lookup failed: {}", e);
                vec![]
            }
        };

        let Some(fix) = self.planner.plan(issue, &prior).await else {
            debug!("No fix strategy for {}", issue.id);
            self.record(issue, &Resolution::NoFix).await;
            return Ok(Resolution::NoFix);
        };

        if !self.auto_apply || fix.confidence < self.applier.threshold() {
            let resolution = self.enqueue(issue, fix).await;
            self.record(issue, &resolution).await;
            return Ok(resolution);
        }

        self.transition(&fix.target_path, PipelineState::Applying);
        let applied = self.applier.apply(&fix).await;
        self.settle(issue, fix, applied).await
    }

    /// Turn an apply result into a resolution, a lesson and events
    async fn settle(
        &self,
        issue: &Issue,
        fix: Fix,
        applied: std::result::Result<AppliedFix, ApplyError>,
    ) -> Result<Resolution> {
        let resolution = match applied {
            Ok(applied) => {
                self.refresh(&applied).await;
                self.sink.emit(PipelineEvent::FixApplied(applied.clone()));
                Resolution::Applied(applied)
            }
            Err(ApplyError::BelowThreshold { .. }) => self.enqueue(issue, fix).await,
            Err(ApplyError::VerificationFailed { reason, .. }) => {
                self.transition(&fix.target_path, PipelineState::RolledBack);
                self.sink.emit(PipelineEvent::FixRolledBack {
                    fix: fix.clone(),
                    reason,
                });
                Resolution::RolledBack(fix)
            }
            Err(ApplyError::WriteFailed { reason, .. }) => {
                self.sink.emit(PipelineEvent::FixFailed {
                    fix: fix.clone(),
                    reason,
                });
                Resolution::Failed(fix)
            }
            Err(e @ ApplyError::RollbackFailed { .. }) => {
                self.sink.emit(PipelineEvent::FixFailed {
                    fix: fix.clone(),
                    reason: e.to_string(),
                });
                self.record(issue, &Resolution::Failed(fix)).await;
                return Err(e.into());
            }
        };

        self.record(issue, &resolution).await;
        Ok(resolution)
    }

    async fn enqueue(&self, issue: &Issue, fix: Fix) -> Resolution {
        self.transition(&fix.target_path, PipelineState::QueuedForReview);
        self.sink.emit(PipelineEvent::FixQueued {
            issue: issue.clone(),
            fix: fix.clone(),
        });
        self.review.lock().await.push(PendingFix {
            issue: issue.clone(),
            fix: fix.clone(),
            queued_at: Utc::now(),
        });
        Resolution::Queued(fix)
    }

    async fn record(&self, issue: &Issue, resolution: &Resolution) {
        match self.lessons.record(issue, resolution.fix(), resolution.outcome()).await {
            Ok(lesson) => self.sink.emit(PipelineEvent::LessonRecorded(lesson)),
            Err(e) => warn!("⚠️ Failed to record lesson for {}: {}", issue.id, e),
        }
    }

    /// Re-parse a file a fix just wrote so its next watcher event is a no-op
    async fn refresh(&self, applied: &AppliedFix) {
        if !applied.changed {
            return;
        }
        let path = &applied.fix.target_path;
        match self.parser.parse(path, &applied.content) {
            Ok(parsed) => self.graph.write().await.upsert(parsed),
            Err(e) => warn!("⚠️ Could not re-parse {} after fix: {}", path.display(), e),
        }
    }

    /// Fixes waiting for review, oldest first
    pub async fn pending(&self) -> Vec<PendingFix> {
        self.review.lock().await.clone()
    }

    /// Apply a queued fix regardless of its confidence
    pub async fn approve(&self, fix_id: &str) -> Result<Resolution> {
        let pending = self.take_pending(fix_id).await?;
        info!("👍 Approved {}", fix_id);

        self.transition(&pending.fix.target_path, PipelineState::Applying);
        let applied = self.applier.apply_approved(&pending.fix).await;
        let resolution = self.settle(&pending.issue, pending.fix, applied).await;
        self.transition(&pending.issue.path, PipelineState::Idle);
        resolution
    }

    /// Drop a queued fix and record the issue as abandoned
    pub async fn reject(&self, fix_id: &str) -> Result<Lesson> {
        let pending = self.take_pending(fix_id).await?;
        info!("👎 Rejected {}", fix_id);

        let lesson = self
            .lessons
            .record(&pending.issue, Some(&pending.fix), Outcome::Rejected)
            .await?;
        self.sink.emit(PipelineEvent::LessonRecorded(lesson.clone()));
        Ok(lesson)
    }

    async fn take_pending(&self, fix_id: &str) -> Result<PendingFix> {
        let mut review = self.review.lock().await;
        let index = review
            .iter()
            .position(|p| p.fix.id == fix_id)
            .ok_or_else(|| DocsmithError::UnknownFix(fix_id.to_string()))?;
        Ok(review.remove(index))
    }

    /// Resolve an issue found outside the detector, e.g. by a test runner
    pub async fn report_issue(&self, issue: Issue) -> Result<Resolution> {
        self.sink.emit(PipelineEvent::IssueDetected(issue.clone()));
        let resolution = self.resolve(&issue).await;
        self.transition(&issue.path, PipelineState::Idle);
        resolution
    }

    /// Read-only consistency check of every document
    pub async fn validate(&self) -> ValidationResult {
        let graph = self.graph.read().await;
        self.validator.validate_all(&graph)
    }

    /// Check every document and resolve what is found, stopping early when
    /// `cancel` trips
    pub async fn sweep(&self, cancel: &CancelToken) -> Result<SweepReport> {
        let docs: Vec<PathBuf> = {
            let graph = self.graph.read().await;
            graph
                .nodes()
                .filter(|n| n.kind == NodeKind::DocFile)
                .map(|n| n.path.clone())
                .collect()
        };

        let mut report = SweepReport::default();
        for doc in docs {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if self.in_flight.lock().await.contains_key(&doc) {
                continue;
            }

            report.checked += 1;
            let issues = {
                let graph = self.graph.read().await;
                self.validator.validate_file(&graph, &doc)
            };

            for issue in issues {
                if self.is_pending(&issue).await {
                    continue;
                }
                self.sink.emit(PipelineEvent::IssueDetected(issue.clone()));
                let resolution = self.resolve(&issue).await?;
                report.issues.push(issue);
                report.resolutions.push(resolution);
            }
        }

        self.sink.emit(PipelineEvent::SweepFinished {
            checked: report.checked,
            issues: report.issues.len(),
            cancelled: report.cancelled,
        });
        Ok(report)
    }

    /// Whether the same problem is already waiting for review
    async fn is_pending(&self, issue: &Issue) -> bool {
        self.review.lock().await.iter().any(|p| {
            p.issue.kind == issue.kind && p.issue.path == issue.path && p.issue.message == issue.message
        })
    }

    fn transition(&self, path: &Path, state: PipelineState) {
        self.sink.emit(PipelineEvent::StateChanged {
            path: path.to_path_buf(),
            state,
        });
    }

    fn relative(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        super::graph::normalize(relative).unwrap_or_else(|| relative.to_path_buf())
    }

    fn is_ignored(&self, path: &Path) -> bool {
        path.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            self.ignore_dirs.iter().any(|d| name == d.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::ChannelSink;
    use crate::core::fixes::Verifier;
    use crate::core::issues::{IssueKind, Severity};
    use crate::core::parser::content_hash;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use crate::core::lessons::MemoryLessonStore;
    use tempfile::TempDir;

    type Events = tokio::sync::mpsc::UnboundedReceiver<PipelineEvent>;

    fn pipeline(dir: &Path, auto_apply: bool) -> (Pipeline, Events) {
        pipeline_with(dir, auto_apply, None)
    }

    fn pipeline_with(
        dir: &Path,
        auto_apply: bool,
        verifier: Option<Arc<dyn Verifier>>,
    ) -> (Pipeline, Events) {
        let mut config = Config::default();
        config.project.root = dir.to_path_buf();
        config.fixes.auto_apply = auto_apply;

        let parser = Arc::new(SourceParser::new(&config.parsing, &config.project));
        let graph = ProjectGraph::scan(dir, &parser, &config).unwrap();
        let verifier = verifier.unwrap_or_else(|| {
            let parser = parser.clone();
            Arc::new(ParseVerifier::new(parser, dir, None, Duration::from_secs(5))) as Arc<dyn Verifier>
        });
        let (sink, events) = ChannelSink::new();

        let parts = Collaborators {
            parser,
            planner: FixPlanner::offline().unwrap(),
            applier: FixApplier::new(dir, config.backup_dir(), 0.7, verifier),
            lessons: LessonBook::new(
                Arc::new(MemoryLessonStore::new()),
                config.lessons.weights,
                config.lessons.similarity_threshold,
            ),
            sink: Arc::new(sink),
        };
        (Pipeline::new(&config, graph, parts), events)
    }

    fn write(dir: &Path, path: &str, content: &str) {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_content_short_circuits() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export function add(a, b) { return a + b; }\n");
        let (pipeline, _events) = pipeline(dir.path(), true);

        let summary = pipeline
            .handle(FileEvent::Changed(dir.path().join("util.js")))
            .await
            .unwrap();
        assert!(summary.unchanged);
        assert!(summary.issues.is_empty());
    }

    #[tokio::test]
    async fn test_parse_error_keeps_previous_symbols() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export function add(a, b) { return a + b; }\n");
        let (pipeline, mut events) = pipeline(dir.path(), true);

        write(dir.path(), "util.js", "export function add(a, b {\n");
        let summary = pipeline.handle(FileEvent::Changed(PathBuf::from("util.js"))).await.unwrap();

        assert!(summary.parse_error.is_some());
        let graph = pipeline.graph();
        let graph = graph.read().await;
        assert!(graph.get(Path::new("util.js")).unwrap().symbol("add").is_some());
        drop(graph);

        let mut saw_parse_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_parse_failure |= matches!(event, PipelineEvent::ParseFailed(_));
        }
        assert!(saw_parse_failure);
    }

    #[tokio::test]
    async fn test_event_for_busy_path_is_coalesced() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export const a = 1;\n");
        let (pipeline, _events) = pipeline(dir.path(), true);

        pipeline.in_flight.lock().await.insert(PathBuf::from("util.js"), false);
        let summary = pipeline.handle(FileEvent::Changed(PathBuf::from("util.js"))).await.unwrap();

        assert!(summary.coalesced);
        assert_eq!(summary.runs, 0);
        assert_eq!(pipeline.in_flight.lock().await.get(Path::new("util.js")), Some(&true));
    }

    /// Parks the first verification until released
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
        opened: AtomicBool,
    }

    #[async_trait]
    impl Verifier for Gate {
        async fn verify(&self, _path: &Path, _content: &str) -> std::result::Result<(), String> {
            if !self.opened.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_event_during_run_triggers_rerun_on_latest_content() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export function add(a, b) { return a + b; }\n");
        write(dir.path(), "main.js", "import { add } from './util.js';\nadd(1, 2);\n");
        let gate = Arc::new(Gate::default());
        let (pipeline, _events) = pipeline_with(dir.path(), true, Some(gate.clone() as Arc<dyn Verifier>));
        let pipeline = Arc::new(pipeline);

        // Dropping `add` plans a restore, which parks in verification
        write(dir.path(), "util.js", "export function sub(a, b) { return a - b; }\n");
        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.handle(FileEvent::Changed(PathBuf::from("util.js"))).await }
        });
        gate.entered.notified().await;

        let latest = "export function sub(a, b) { return a - b; }\nexport function add(a, b) { return a + b; }\nexport const VERSION = 2;\n";
        write(dir.path(), "util.js", latest);
        let second = pipeline.handle(FileEvent::Changed(PathBuf::from("util.js"))).await.unwrap();
        assert!(second.coalesced);
        assert_eq!(second.runs, 0);

        gate.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.runs, 2);
        assert!(!first.coalesced);
        assert_eq!(first.applied().count(), 1);

        let graph = pipeline.graph();
        let graph = graph.read().await;
        let node = graph.get(Path::new("util.js")).unwrap();
        assert_eq!(node.content_hash, content_hash(latest));
        assert!(node.symbol("VERSION").is_some());
        drop(graph);
        assert!(pipeline.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_ignored_directories_are_not_processed() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _events) = pipeline(dir.path(), true);
        write(dir.path(), ".docsmith/backups/x/util.js", "export const a = 1;\n");

        let summary = pipeline
            .handle(FileEvent::Added(PathBuf::from(".docsmith/backups/x/util.js")))
            .await
            .unwrap();
        assert_eq!(summary.runs, 0);
        assert!(pipeline.graph().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_review_queue_approve_and_reject() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export function add(a, b) { return a + b; }\n");
        write(dir.path(), "main.js", "import { add } from './util.js';\nadd(1, 2);\n");
        let (pipeline, _events) = pipeline(dir.path(), false);

        write(dir.path(), "util.js", "export function sub(a, b) { return a - b; }\n");
        let summary = pipeline.handle(FileEvent::Changed(PathBuf::from("util.js"))).await.unwrap();
        assert_eq!(summary.queued().count(), 1);
        assert_eq!(summary.issues[0].kind, IssueKind::BreakingChange);

        let pending = pipeline.pending().await;
        let fix_id = pending[0].fix.id.clone();
        let resolution = pipeline.approve(&fix_id).await.unwrap();
        assert!(matches!(resolution, Resolution::Applied(_)));
        let restored = std::fs::read_to_string(dir.path().join("util.js")).unwrap();
        assert!(restored.contains("export function add(a, b)"));

        assert!(matches!(pipeline.approve(&fix_id).await, Err(DocsmithError::UnknownFix(_))));

        let issue = Issue::new(IssueKind::ApiContractViolation, Severity::High, "util.js", "manual");
        let resolution = pipeline.report_issue(issue).await.unwrap();
        assert!(matches!(resolution, Resolution::NoFix));
        assert!(pipeline.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_reject_records_lesson() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export function add(a, b) { return a + b; }\n");
        write(dir.path(), "main.js", "import { add } from './util.js';\nadd(1, 2);\n");
        let (pipeline, _events) = pipeline(dir.path(), false);

        write(dir.path(), "util.js", "export const nothing = 0;\n");
        pipeline.handle(FileEvent::Changed(PathBuf::from("util.js"))).await.unwrap();

        let fix_id = pipeline.pending().await[0].fix.id.clone();
        let lesson = pipeline.reject(&fix_id).await.unwrap();
        assert_eq!(lesson.outcome, Outcome::Rejected);
        assert!(!std::fs::read_to_string(dir.path().join("util.js")).unwrap().contains("add"));
    }

    #[tokio::test]
    async fn test_applied_fix_passes_through_verification() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export function add(a, b) { return a + b; }\n");
        write(dir.path(), "main.js", "import { add } from './util.js';\nadd(1, 2);\n");
        let (pipeline, mut events) = pipeline(dir.path(), true);

        write(dir.path(), "util.js", "export const nothing = 0;\n");
        let summary = pipeline.handle(FileEvent::Changed(PathBuf::from("util.js"))).await.unwrap();
        assert_eq!(summary.applied().count(), 1);

        let mut states = Vec::new();
        let mut applied = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::StateChanged { state, .. } => states.push(state),
                PipelineEvent::FixApplied(_) => applied = true,
                _ => {}
            }
        }
        let applying = states.iter().position(|s| *s == PipelineState::Applying).unwrap();
        let verifying = states.iter().position(|s| *s == PipelineState::Verifying).unwrap();
        assert!(applying < verifying);
        assert_eq!(states.last(), Some(&PipelineState::Idle));
        assert!(applied);
    }

    #[tokio::test]
    async fn test_removed_file_scrubs_graph() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "util.js", "export function add(a, b) { return a + b; }\n");
        write(dir.path(), "main.js", "import { add } from './util.js';\nadd(1, 2);\n");
        let (pipeline, _events) = pipeline(dir.path(), false);

        std::fs::remove_file(dir.path().join("util.js")).unwrap();
        let summary = pipeline.handle(FileEvent::Removed(PathBuf::from("util.js"))).await.unwrap();

        assert!(summary.removed);
        assert_eq!(summary.issues[0].kind, IssueKind::BreakingChange);
        assert_eq!(summary.issues[0].path, PathBuf::from("main.js"));
        let graph = pipeline.graph();
        let graph = graph.read().await;
        assert!(!graph.contains(Path::new("util.js")));
        assert!(graph.get(Path::new("main.js")).unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_sweep_stops_early() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.md", "# A\n");
        write(dir.path(), "b.md", "# B\n");
        let (pipeline, _events) = pipeline(dir.path(), true);

        let token = pipeline.sweep_control().token();
        pipeline.sweep_control().interrupt();
        let report = pipeline.sweep(&token).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.checked, 0);

        let report = pipeline.sweep(&CancelToken::never()).await.unwrap();
        assert_eq!(report.checked, 2);
        assert!(report.issues.is_empty());
    }
}
