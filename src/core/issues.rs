//! Rule-based issue detection over a change set and its impact report.
//!
//! Rules run in a fixed order and independently of each other: a failing
//! rule is logged and skipped, the remaining rules still contribute.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::differ::ChangeSet;
use super::graph::{NodeKind, ProjectGraph};
use super::impact::ImpactReport;
use super::parser::{contains_word, DocReferences, ReferenceKind, Symbol, STALE_MARKER};
use crate::error::DetectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    BreakingChange,
    OutdatedDoc,
    TypeError,
    TestFailure,
    ApiContractViolation,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssueKind::BreakingChange => "breaking-change",
            IssueKind::OutdatedDoc => "outdated-doc",
            IssueKind::TypeError => "type-error",
            IssueKind::TestFailure => "test-failure",
            IssueKind::ApiContractViolation => "api-contract-violation",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for IssueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breaking-change" => Ok(IssueKind::BreakingChange),
            "outdated-doc" => Ok(IssueKind::OutdatedDoc),
            "type-error" => Ok(IssueKind::TypeError),
            "test-failure" => Ok(IssueKind::TestFailure),
            "api-contract-violation" => Ok(IssueKind::ApiContractViolation),
            other => Err(format!("unknown issue kind `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
}

/// Where in the affected file the problem shows up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// 1-indexed, 0 when unknown
    pub line: usize,
    /// The offending line as written
    pub snippet: String,
}

/// The symbol an issue is about, before and after the change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSubject {
    pub name: String,
    pub previous: Option<Symbol>,
    pub current: Option<Symbol>,
}

/// A detected inconsistency between code and its dependents or documentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub kind: IssueKind,
    pub severity: Severity,
    /// File where the problem is visible
    pub path: PathBuf,
    pub message: String,
    pub evidence: Vec<Evidence>,
    /// File whose change caused the issue
    pub origin: PathBuf,
    pub subject: Option<IssueSubject>,
    pub detected_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(
        kind: IssueKind,
        severity: Severity,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let message = message.into();
        let detected_at = Utc::now();

        let mut hasher = Sha256::new();
        hasher.update(kind.to_string().as_bytes());
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(message.as_bytes());
        hasher.update(detected_at.to_rfc3339().as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        Self {
            id: format!("issue-{}", &hash[..12]),
            kind,
            severity,
            origin: path.clone(),
            path,
            message,
            evidence: Vec::new(),
            subject: None,
            detected_at,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_subject(mut self, subject: IssueSubject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<Evidence>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn subject_name(&self) -> Option<&str> {
        self.subject.as_ref().map(|s| s.name.as_str())
    }
}

/// Everything a rule may look at
pub struct DetectionContext<'a> {
    pub changes: &'a ChangeSet,
    pub impact: &'a ImpactReport,
    pub graph: &'a ProjectGraph,
}

pub trait DetectionRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Result<Vec<Issue>, DetectionError>;
}

/// Runs the rule set in order
pub struct IssueDetector {
    rules: Vec<Box<dyn DetectionRule>>,
}

impl IssueDetector {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(BreakingChangeRule),
                Box::new(OutdatedDocRule),
                Box::new(ApiContractRule),
            ],
        }
    }

    pub fn with_rules(rules: Vec<Box<dyn DetectionRule>>) -> Self {
        Self { rules }
    }

    pub fn detect(&self, changes: &ChangeSet, impact: &ImpactReport, graph: &ProjectGraph) -> Vec<Issue> {
        let ctx = DetectionContext {
            changes,
            impact,
            graph,
        };

        let mut issues = Vec::new();
        for rule in &self.rules {
            match rule.evaluate(&ctx) {
                Ok(found) => issues.extend(found),
                Err(e) => warn!("⚠️ Skipping detection rule: {}", e),
            }
        }
        issues
    }
}

impl Default for IssueDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// A removed symbol still imported or used by a direct dependent
pub struct BreakingChangeRule;

impl DetectionRule for BreakingChangeRule {
    fn name(&self) -> &'static str {
        "breaking-change"
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Result<Vec<Issue>, DetectionError> {
        let mut issues = Vec::new();
        let origin = &ctx.changes.path;

        for removed in &ctx.changes.removed_symbols {
            for dependent in &ctx.impact.direct {
                let Some(source) = ctx.graph.get(dependent).and_then(|n| n.source()) else {
                    continue;
                };
                if !ctx.graph.refers_to(dependent, origin, &removed.name) {
                    continue;
                }

                let evidence = source
                    .calls
                    .iter()
                    .filter(|c| c.name == removed.name)
                    .map(|c| Evidence {
                        line: c.line,
                        snippet: format!("{}({} args)", c.name, c.arity),
                    })
                    .collect();

                issues.push(
                    Issue::new(
                        IssueKind::BreakingChange,
                        Severity::Critical,
                        dependent.clone(),
                        format!(
                            "`{}` was removed from {} but is still used in {}",
                            removed.name,
                            origin.display(),
                            dependent.display()
                        ),
                    )
                    .with_origin(origin.clone())
                    .with_evidence(evidence)
                    .with_subject(IssueSubject {
                        name: removed.name.clone(),
                        previous: Some(removed.clone()),
                        current: None,
                    }),
                );
            }
        }

        Ok(issues)
    }
}

/// Documentation that shows a removed symbol or a call with a stale arity.
///
/// Docs inside the impact set are checked for every removed symbol; docs
/// outside it only for removed exports, since a private helper's name in
/// unrelated prose is more likely a coincidence.
pub struct OutdatedDocRule;

impl DetectionRule for OutdatedDocRule {
    fn name(&self) -> &'static str {
        "outdated-doc"
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Result<Vec<Issue>, DetectionError> {
        let mut issues = Vec::new();
        let origin = &ctx.changes.path;

        for node in ctx.graph.nodes().filter(|n| n.kind == NodeKind::DocFile) {
            let Some(doc) = node.doc() else {
                continue;
            };
            let in_impact = ctx.impact.affects(&node.path);
            let severity = if in_impact {
                Severity::High
            } else {
                Severity::Medium
            };

            for removed in &ctx.changes.removed_symbols {
                if !in_impact && !removed.is_exported() {
                    continue;
                }
                let evidence = mention_evidence(doc, &removed.name);
                if evidence.is_empty() {
                    continue;
                }
                issues.push(
                    Issue::new(
                        IssueKind::OutdatedDoc,
                        severity,
                        node.path.clone(),
                        format!(
                            "{} still shows `{}`, which was removed from {}",
                            node.path.display(),
                            removed.name,
                            origin.display()
                        ),
                    )
                    .with_origin(origin.clone())
                    .with_evidence(evidence)
                    .with_subject(IssueSubject {
                        name: removed.name.clone(),
                        previous: Some(removed.clone()),
                        current: None,
                    }),
                );
            }

            for modified in &ctx.changes.modified_symbols {
                if !modified.new.callable || !modified.arity_changed() {
                    continue;
                }
                if !in_impact && !modified.new.is_exported() {
                    continue;
                }
                let evidence: Vec<Evidence> = doc
                    .calls
                    .iter()
                    .filter(|c| c.name == modified.new.name && c.arity != modified.new.arity)
                    .map(|c| Evidence {
                        line: c.line,
                        snippet: code_line(doc, c.line).unwrap_or_default(),
                    })
                    .collect();
                if evidence.is_empty() {
                    continue;
                }
                issues.push(
                    Issue::new(
                        IssueKind::OutdatedDoc,
                        severity,
                        node.path.clone(),
                        format!(
                            "{} calls `{}` with {} argument(s) but it now takes {}",
                            node.path.display(),
                            modified.new.name,
                            modified.old.arity,
                            modified.new.arity
                        ),
                    )
                    .with_origin(origin.clone())
                    .with_evidence(evidence)
                    .with_subject(IssueSubject {
                        name: modified.new.name.clone(),
                        previous: Some(modified.old.clone()),
                        current: Some(modified.new.clone()),
                    }),
                );
            }
        }

        Ok(issues)
    }
}

/// An exported function whose parameter count changed
pub struct ApiContractRule;

impl DetectionRule for ApiContractRule {
    fn name(&self) -> &'static str {
        "api-contract-violation"
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Result<Vec<Issue>, DetectionError> {
        let origin = &ctx.changes.path;

        let issues = ctx
            .changes
            .modified_symbols
            .iter()
            .filter(|m| m.new.is_exported() && m.new.callable && m.arity_changed())
            .map(|m| {
                let callers = ctx
                    .impact
                    .critical
                    .iter()
                    .find(|c| c.symbol_name == m.new.name)
                    .map_or(0, |c| c.affected_paths.len());
                let severity = if callers > 0 {
                    Severity::Critical
                } else {
                    Severity::High
                };

                Issue::new(
                    IssueKind::ApiContractViolation,
                    severity,
                    origin.clone(),
                    format!(
                        "exported `{}` changed from {} to {} parameter(s); {} direct dependent(s) use it",
                        m.new.name, m.old.arity, m.new.arity, callers
                    ),
                )
                .with_evidence(vec![Evidence {
                    line: m.new.span.start_line,
                    snippet: m.new.declaration.lines().next().unwrap_or_default().to_string(),
                }])
                .with_subject(IssueSubject {
                    name: m.new.name.clone(),
                    previous: Some(m.old.clone()),
                    current: Some(m.new.clone()),
                })
            })
            .collect();

        Ok(issues)
    }
}

/// Lines of a document's code that mention `name`
pub(crate) fn mention_evidence(doc: &DocReferences, name: &str) -> Vec<Evidence> {
    let mut evidence = Vec::new();

    for reference in doc.mentioning(name) {
        match reference.kind {
            ReferenceKind::CodeBlock => {
                for (offset, line) in reference.content.lines().enumerate() {
                    if contains_word(line, name) && !line.contains(STALE_MARKER) {
                        evidence.push(Evidence {
                            line: reference.position + offset + 1,
                            snippet: line.to_string(),
                        });
                    }
                }
            }
            ReferenceKind::InlineCode => evidence.push(Evidence {
                line: reference.position,
                snippet: format!("`{}`", reference.content),
            }),
            // Import lines are already covered by their code block
            _ => {}
        }
    }

    evidence.sort_by_key(|e| e.line);
    evidence.dedup();
    evidence
}

/// The code-block line at a 1-indexed document line
pub(crate) fn code_line(doc: &DocReferences, line: usize) -> Option<String> {
    doc.of_kind(ReferenceKind::CodeBlock).find_map(|block| {
        let offset = line.checked_sub(block.position + 1)?;
        block.content.lines().nth(offset).map(|l| l.to_string())
    })
}

/// Language family of a path, used for templates and lesson tags
pub fn technology_of(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx") => "javascript",
        Some("py") => "python",
        Some("md" | "markdown") => "markdown",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParsingConfig, ProjectConfig};
    use crate::core::differ::ChangeDetector;
    use crate::core::impact::ImpactAnalyzer;
    use crate::core::parser::SourceParser;

    struct Fixture {
        parser: SourceParser,
        graph: ProjectGraph,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let parser = SourceParser::new(&ParsingConfig::default(), &ProjectConfig::default());
            let mut graph =
                ProjectGraph::new("/project", ParsingConfig::default().resolve_extensions);
            for (path, content) in files {
                graph.upsert(parser.parse(Path::new(path), content).unwrap());
            }
            Self { parser, graph }
        }

        fn change(&self, path: &str, content: &str) -> Vec<Issue> {
            let new = self.parser.parse(Path::new(path), content).unwrap();
            let old = self.graph.get(Path::new(path)).unwrap();
            let changes = ChangeDetector::new().diff(path, old.symbols(), new.symbols());
            let impact = ImpactAnalyzer::new().analyze(&self.graph, Path::new(path), &changes);
            IssueDetector::new().detect(&changes, &impact, &self.graph)
        }
    }

    #[test]
    fn test_removed_symbol_used_by_dependent() {
        let fixture = Fixture::new(&[
            ("util.js", "export function add(a, b) { return a + b; }\nexport function sub(a, b) { return a - b; }"),
            ("main.js", "import { add } from './util.js';\nconsole.log(add(1, 2));"),
        ]);

        let issues = fixture.change("util.js", "export function sub(a, b) { return a - b; }");

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::BreakingChange);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues[0].path, PathBuf::from("main.js"));
        assert_eq!(issues[0].origin, PathBuf::from("util.js"));
        assert_eq!(issues[0].evidence[0].line, 2);
    }

    #[test]
    fn test_member_calls_and_parameters_do_not_break() {
        let fixture = Fixture::new(&[
            (
                "util.js",
                "export function log(m) {}\nexport function add(a, b) { return a + b; }\nexport function sub(a, b) { return a - b; }",
            ),
            (
                "main.js",
                "import { sub } from './util.js';\nconsole.log(sub(3, 1));\nfunction f(add) { return add; }",
            ),
        ]);

        let issues = fixture.change("util.js", "export function sub(a, b) { return a - b; }");

        assert!(issues.iter().all(|i| i.kind != IssueKind::BreakingChange));
    }

    #[test]
    fn test_namespace_member_call_still_breaks() {
        let fixture = Fixture::new(&[
            ("util.js", "export function add(a, b) { return a + b; }\nexport function sub(a, b) { return a - b; }"),
            ("main.js", "import * as util from './util.js';\nutil.add(1, 2);"),
        ]);

        let issues = fixture.change("util.js", "export function sub(a, b) { return a - b; }");

        let breaking: Vec<_> = issues
            .iter()
            .filter(|i| i.kind == IssueKind::BreakingChange)
            .collect();
        assert_eq!(breaking.len(), 1);
        assert_eq!(breaking[0].path, PathBuf::from("main.js"));
        assert_eq!(breaking[0].evidence[0].line, 2);
    }

    #[test]
    fn test_arity_change_is_contract_violation() {
        let fixture = Fixture::new(&[
            ("util.js", "export function add(a, b) { return a + b; }"),
            ("main.js", "import { add } from './util.js';\nadd(1, 2);"),
        ]);

        let issues = fixture.change("util.js", "export function add(a, b, c) { return a + b + c; }");

        let contract: Vec<_> = issues
            .iter()
            .filter(|i| i.kind == IssueKind::ApiContractViolation)
            .collect();
        assert_eq!(contract.len(), 1);
        assert_eq!(contract[0].path, PathBuf::from("util.js"));
        assert_eq!(contract[0].severity, Severity::Critical);
    }

    #[test]
    fn test_internal_helper_arity_change_is_silent() {
        let fixture = Fixture::new(&[("util.js", "function helper(a) {}\nexport const x = helper(1);")]);
        let issues = fixture.change("util.js", "function helper(a, b) {}\nexport const x = helper(1, 2);");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_docs_with_removed_symbol_and_stale_calls() {
        let fixture = Fixture::new(&[
            ("util.js", "export function add(a, b) { return a + b; }\nexport function scale(x, k) { return x * k; }"),
            ("docs/guide.md", "# Guide\n\n```js\nimport {add} from '../util.js'\nadd(1, 2)\n```\n"),
            ("docs/notes.md", "Use `scale(x, k)` for vectors.\n\n```js\nscale(v, 2)\n```\n"),
        ]);

        let issues = fixture.change("util.js", "export function scale(x) { return x; }");

        let guide: Vec<_> = issues
            .iter()
            .filter(|i| i.path == Path::new("docs/guide.md"))
            .collect();
        assert_eq!(guide.len(), 1);
        assert_eq!(guide[0].kind, IssueKind::OutdatedDoc);
        assert_eq!(guide[0].severity, Severity::High);
        assert_eq!(guide[0].evidence.len(), 2);
        assert_eq!(guide[0].evidence[1].snippet, "add(1, 2)");

        let notes: Vec<_> = issues
            .iter()
            .filter(|i| i.path == Path::new("docs/notes.md"))
            .collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Medium);
        assert_eq!(notes[0].evidence[0].snippet, "scale(v, 2)");
        assert_eq!(notes[0].evidence[0].line, 4);
    }

    struct FailingRule;

    impl DetectionRule for FailingRule {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn evaluate(&self, _ctx: &DetectionContext<'_>) -> Result<Vec<Issue>, DetectionError> {
            Err(DetectionError {
                rule: self.name(),
                reason: "no type checker available".to_string(),
            })
        }
    }

    #[test]
    fn test_failing_rule_does_not_block_others() {
        let fixture = Fixture::new(&[
            ("util.js", "export function add(a, b) { return a + b; }"),
            ("main.js", "import { add } from './util.js';\nadd(1, 2);"),
        ]);
        let new = fixture.parser.parse(Path::new("util.js"), "").unwrap();
        let changes = ChangeDetector::new().diff(
            "util.js",
            fixture.graph.get(Path::new("util.js")).unwrap().symbols(),
            new.symbols(),
        );
        let impact = ImpactAnalyzer::new().analyze(&fixture.graph, Path::new("util.js"), &changes);

        let detector = IssueDetector::with_rules(vec![Box::new(FailingRule), Box::new(BreakingChangeRule)]);
        let issues = detector.detect(&changes, &impact, &fixture.graph);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::BreakingChange);
    }

    #[test]
    fn test_issue_kind_round_trips_through_display() {
        for kind in [IssueKind::BreakingChange, IssueKind::TestFailure, IssueKind::ApiContractViolation] {
            assert_eq!(kind.to_string().parse::<IssueKind>().unwrap(), kind);
        }
    }
}
