use std::path::{Path, PathBuf};

use tracing::debug;

use super::graph::{NodeKind, ProjectGraph};
use super::issues::{code_line, Evidence, Issue, IssueKind, IssueSubject, Severity};
use super::parser::{ReferenceKind, Symbol};

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub checked: usize,
    pub issues: Vec<Issue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Checks documentation against the live export tables and signatures
pub struct DocValidator;

impl DocValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_all(&self, graph: &ProjectGraph) -> ValidationResult {
        let docs: Vec<PathBuf> = graph
            .nodes()
            .filter(|n| n.kind == NodeKind::DocFile)
            .map(|n| n.path.clone())
            .collect();

        let mut result = ValidationResult::default();
        for doc in docs {
            result.checked += 1;
            result.issues.extend(self.validate_file(graph, &doc));
        }
        result
    }

    /// Import mentions naming a missing export, and calls with an arity the
    /// callee no longer accepts
    pub fn validate_file(&self, graph: &ProjectGraph, doc_path: &Path) -> Vec<Issue> {
        let Some(node) = graph.get(doc_path) else {
            return vec![];
        };
        let Some(doc) = node.doc() else {
            return vec![];
        };

        let mut issues = Vec::new();

        for mention in doc.of_kind(ReferenceKind::ImportMention) {
            let python = matches!(mention.language.as_deref(), Some("py") | Some("python"));
            let Some(target_path) = graph.resolve(doc_path, &mention.content, python) else {
                continue;
            };
            let Some(target) = graph.get(&target_path) else {
                continue;
            };
            if target.source().is_none() {
                continue;
            }

            for name in &mention.names {
                if name == "*" || name == "default" || target.symbol(name).is_some() {
                    continue;
                }
                debug!("{} imports missing `{}` from {}", doc_path.display(), name, target_path.display());
                issues.push(
                    Issue::new(
                        IssueKind::OutdatedDoc,
                        Severity::High,
                        doc_path,
                        format!(
                            "{} imports `{}` from {}, which no longer defines it",
                            doc_path.display(),
                            name,
                            target_path.display()
                        ),
                    )
                    .with_origin(target_path.clone())
                    .with_evidence(vec![Evidence {
                        line: mention.position,
                        snippet: code_line(doc, mention.position).unwrap_or_default(),
                    }])
                    .with_subject(IssueSubject {
                        name: name.clone(),
                        previous: None,
                        current: None,
                    }),
                );
            }
        }

        for call in &doc.calls {
            let callee = node.dependencies.iter().find_map(|dep| {
                graph
                    .get(dep)
                    .and_then(|n| n.symbol(&call.name))
                    .filter(|s| s.callable)
                    .map(|s| (dep, s))
            });
            let Some((defined_in, symbol)) = callee else {
                continue;
            };
            if accepts(symbol, call.arity) {
                continue;
            }

            issues.push(
                Issue::new(
                    IssueKind::OutdatedDoc,
                    Severity::High,
                    doc_path,
                    format!(
                        "{} calls `{}` with {} argument(s) but {} defines it with {}",
                        doc_path.display(),
                        call.name,
                        call.arity,
                        defined_in.display(),
                        symbol.arity
                    ),
                )
                .with_origin(defined_in.clone())
                .with_evidence(vec![Evidence {
                    line: call.line,
                    snippet: code_line(doc, call.line).unwrap_or_default(),
                }])
                .with_subject(IssueSubject {
                    name: call.name.clone(),
                    previous: None,
                    current: Some(symbol.clone()),
                }),
            );
        }

        issues
    }
}

impl Default for DocValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Defaulted parameters are optional; a rest parameter takes any count above the required ones
fn accepts(symbol: &Symbol, arity: usize) -> bool {
    let variadic = symbol
        .params
        .iter()
        .any(|p| p.starts_with("...") || p.starts_with('*'));
    let required = symbol
        .params
        .iter()
        .filter(|p| !p.contains('=') && !p.starts_with("...") && !p.starts_with('*'))
        .count();

    arity >= required && (variadic || arity <= symbol.arity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParsingConfig, ProjectConfig};
    use crate::core::parser::SourceParser;

    fn graph_of(files: &[(&str, &str)]) -> ProjectGraph {
        let parser = SourceParser::new(&ParsingConfig::default(), &ProjectConfig::default());
        let mut graph = ProjectGraph::new("/project", ParsingConfig::default().resolve_extensions);
        for (path, content) in files {
            graph.upsert(parser.parse(Path::new(path), content).unwrap());
        }
        graph
    }

    #[test]
    fn test_missing_import_and_wrong_arity() {
        let graph = graph_of(&[
            ("util.js", "export function add(a, b, c) { return a + b + c; }"),
            ("README.md", "```js\nimport { add, sub } from './util.js'\nadd(1, 2)\n```\n"),
        ]);

        let result = DocValidator::new().validate_all(&graph);
        assert_eq!(result.checked, 1);
        assert_eq!(result.issues.len(), 2);

        assert_eq!(result.issues[0].subject_name(), Some("sub"));
        assert_eq!(result.issues[0].evidence[0].line, 2);
        assert_eq!(result.issues[0].evidence[0].snippet, "import { add, sub } from './util.js'");

        assert_eq!(result.issues[1].subject_name(), Some("add"));
        assert_eq!(result.issues[1].origin, PathBuf::from("util.js"));
        assert_eq!(result.issues[1].evidence[0].snippet, "add(1, 2)");
    }

    #[test]
    fn test_consistent_doc_is_valid() {
        let graph = graph_of(&[
            ("pkg/solver.py", "def solve(equation, variable):\n    return equation\n"),
            (
                "pkg/README.md",
                "```python\nfrom .solver import solve\nsolve('x + 1', 'x')\n```\n",
            ),
        ]);

        assert!(DocValidator::new().validate_all(&graph).is_valid());
    }

    #[test]
    fn test_accepts_optional_and_rest_parameters() {
        let graph = graph_of(&[(
            "util.js",
            "export function fmt(value, digits = 2) {}\nexport function log(level, ...parts) {}",
        )]);
        let node = graph.get(Path::new("util.js")).unwrap();
        let fmt = node.symbol("fmt").unwrap();
        let log = node.symbol("log").unwrap();

        assert!(accepts(fmt, 1));
        assert!(accepts(fmt, 2));
        assert!(!accepts(fmt, 3));
        assert!(!accepts(log, 0));
        assert!(accepts(log, 5));
    }
}
