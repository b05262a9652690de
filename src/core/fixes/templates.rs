use std::path::PathBuf;

use tera::{Context, Tera};

use super::{FixAction, Patch, Replacement};
use crate::core::issues::{technology_of, Issue, IssueKind};
use crate::core::parser::{Symbol, STALE_MARKER};
use crate::error::Result;

const RESTORE_JS: &str = "\n// Restored by docsmith: `{{ name }}` is still in use\n{{ declaration }}\n";

const RESTORE_PY: &str = "\n\n# Restored by docsmith: `{{ name }}` is still in use\n{{ declaration }}\n";

const WRAPPER_JS: &str = "\n// Compatibility wrapper for callers of the {{ old_arity }}-argument `{{ name }}`
{{ export }}{% if is_async %}async {% endif %}function {{ wrapper }}({{ params }}) {
  return {{ name }}({{ args }});
}
";

const WRAPPER_PY: &str = "\n\n# Compatibility wrapper for callers of the {{ old_arity }}-argument `{{ name }}`
{% if is_async %}async {% endif %}def {{ wrapper }}({{ params }}):
    return {% if is_async %}await {% endif %}{{ name }}({{ args }})
";

const ANNOTATE_CODE: &str = "{{ line }} {{ comment }} {{ marker }}, {{ note }}";

const ANNOTATE_INLINE: &str = "{{ line }} <!-- {{ marker }}, {{ note }} -->";

/// A template's proposal before a backend gets a say
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub action: FixAction,
    pub patch: Patch,
    pub target_path: PathBuf,
    pub confidence: f32,
}

impl Draft {
    /// The text a backend would be asked to improve on
    pub fn text(&self) -> String {
        match &self.patch {
            Patch::Append(text) => text.trim().to_string(),
            Patch::Replace(replacements) => replacements
                .iter()
                .map(|r| r.replace.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Static fix strategies per issue kind
pub struct FixTemplates {
    tera: Tera,
}

impl FixTemplates {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_templates(vec![
            ("restore.js", RESTORE_JS),
            ("restore.py", RESTORE_PY),
            ("wrapper.js", WRAPPER_JS),
            ("wrapper.py", WRAPPER_PY),
            ("annotate.code", ANNOTATE_CODE),
            ("annotate.inline", ANNOTATE_INLINE),
        ])?;
        Ok(Self { tera })
    }

    /// `Ok(None)` when the issue kind has no static strategy or the issue
    /// lacks what the strategy needs
    pub fn draft(&self, issue: &Issue) -> Result<Option<Draft>> {
        match issue.kind {
            IssueKind::BreakingChange => self.restore(issue),
            IssueKind::ApiContractViolation => self.wrapper(issue),
            IssueKind::OutdatedDoc => self.annotate(issue),
            IssueKind::TypeError | IssueKind::TestFailure => Ok(None),
        }
    }

    fn restore(&self, issue: &Issue) -> Result<Option<Draft>> {
        let Some(previous) = issue.subject.as_ref().and_then(|s| s.previous.as_ref()) else {
            return Ok(None);
        };
        let template = match technology_of(&issue.origin) {
            "javascript" => "restore.js",
            "python" => "restore.py",
            _ => return Ok(None),
        };

        let mut context = Context::new();
        context.insert("name", &previous.name);
        context.insert("declaration", previous.declaration.trim_end());

        Ok(Some(Draft {
            action: FixAction::Restore,
            patch: Patch::Append(self.tera.render(template, &context)?),
            target_path: issue.origin.clone(),
            confidence: 0.75,
        }))
    }

    fn wrapper(&self, issue: &Issue) -> Result<Option<Draft>> {
        let Some(subject) = issue.subject.as_ref() else {
            return Ok(None);
        };
        let (Some(previous), Some(current)) = (&subject.previous, &subject.current) else {
            return Ok(None);
        };
        if !current.callable {
            return Ok(None);
        }

        let technology = technology_of(&issue.origin);
        let (template, wrapper, export, missing) = match technology {
            "javascript" => {
                let export = if previous.declaration.trim_start().starts_with("export") {
                    "export "
                } else {
                    ""
                };
                ("wrapper.js", format!("{}Legacy", previous.name), export, "undefined")
            }
            "python" => ("wrapper.py", format!("{}_legacy", previous.name), "", "None"),
            _ => return Ok(None),
        };

        let mut context = Context::new();
        context.insert("name", &current.name);
        context.insert("wrapper", &wrapper);
        context.insert("export", export);
        context.insert("is_async", &current.is_async);
        context.insert("old_arity", &previous.arity);
        context.insert("params", &previous.params.join(", "));
        context.insert("args", &forwarded_args(previous, current, missing).join(", "));

        Ok(Some(Draft {
            action: FixAction::Wrapper,
            patch: Patch::Append(self.tera.render(template, &context)?),
            target_path: issue.origin.clone(),
            confidence: 0.6,
        }))
    }

    fn annotate(&self, issue: &Issue) -> Result<Option<Draft>> {
        let Some(subject) = issue.subject.as_ref() else {
            return Ok(None);
        };
        let note = match &subject.current {
            Some(current) => format!("`{}` now takes {} argument(s)", subject.name, current.arity),
            None => format!("`{}` no longer exists in {}", subject.name, issue.origin.display()),
        };
        let comment = if technology_of(&issue.origin) == "python" {
            "#"
        } else {
            "//"
        };

        let mut replacements: Vec<Replacement> = Vec::new();
        for evidence in &issue.evidence {
            let line = evidence.snippet.trim_end();
            if line.trim().is_empty()
                || line.contains(STALE_MARKER)
                || replacements.iter().any(|r| r.find == line)
            {
                continue;
            }

            let template = if line.starts_with('`') && line.ends_with('`') {
                "annotate.inline"
            } else {
                "annotate.code"
            };
            let mut context = Context::new();
            context.insert("line", line);
            context.insert("comment", comment);
            context.insert("marker", STALE_MARKER);
            context.insert("note", &note);

            replacements.push(Replacement {
                find: line.to_string(),
                replace: self.tera.render(template, &context)?,
            });
        }

        if replacements.is_empty() {
            return Ok(None);
        }

        Ok(Some(Draft {
            action: FixAction::Replace,
            patch: Patch::Replace(replacements),
            target_path: issue.path.clone(),
            confidence: 0.7,
        }))
    }
}

/// Old parameters forwarded to the new signature, padded or truncated to its arity
fn forwarded_args(previous: &Symbol, current: &Symbol, missing: &str) -> Vec<String> {
    let mut args: Vec<String> = previous
        .params
        .iter()
        .map(|p| {
            let name = p.split('=').next().unwrap_or(p).trim();
            let name = name.split(':').next().unwrap_or(name).trim();
            name.to_string()
        })
        .take(current.arity)
        .collect();
    while args.len() < current.arity {
        args.push(missing.to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::issues::{Evidence, IssueSubject, Severity};
    use crate::core::parser::{SourceSpan, SymbolKind};

    fn symbol(name: &str, params: &[&str], declaration: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            kind: SymbolKind::Export,
            params: params.iter().map(|p| p.to_string()).collect(),
            arity: params.len(),
            is_async: false,
            callable: true,
            span: SourceSpan {
                start_line: 1,
                end_line: 1,
                start_byte: 0,
                end_byte: declaration.len(),
            },
            declaration: declaration.to_string(),
        }
    }

    #[test]
    fn test_restore_appends_previous_declaration() {
        let add = symbol("add", &["a", "b"], "export function add(a, b) { return a + b; }");
        let issue = Issue::new(IssueKind::BreakingChange, Severity::Critical, "main.js", "removed")
            .with_origin("util.js")
            .with_subject(IssueSubject {
                name: "add".to_string(),
                previous: Some(add),
                current: None,
            });

        let draft = FixTemplates::new().unwrap().draft(&issue).unwrap().unwrap();
        assert_eq!(draft.action, FixAction::Restore);
        assert_eq!(draft.target_path, PathBuf::from("util.js"));
        assert_eq!(draft.confidence, 0.75);
        assert!(matches!(draft.patch, Patch::Append(_)));
        assert_eq!(
            draft.text(),
            "// Restored by docsmith: `add` is still in use\nexport function add(a, b) { return a + b; }"
        );
    }

    #[test]
    fn test_wrapper_forwards_old_arguments() {
        let old = symbol("add", &["a", "b"], "export function add(a, b) {}");
        let new = symbol("add", &["a", "b", "c"], "export function add(a, b, c) {}");
        let issue = Issue::new(IssueKind::ApiContractViolation, Severity::High, "util.js", "arity")
            .with_subject(IssueSubject {
                name: "add".to_string(),
                previous: Some(old),
                current: Some(new),
            });

        let draft = FixTemplates::new().unwrap().draft(&issue).unwrap().unwrap();
        assert_eq!(draft.confidence, 0.6);
        let text = draft.text();
        assert!(text.contains("export function addLegacy(a, b) {"));
        assert!(text.contains("return add(a, b, undefined);"));
    }

    #[test]
    fn test_python_wrapper() {
        let old = symbol("solve", &["equation", "variable"], "def solve(equation, variable):\n    pass");
        let new = symbol("solve", &["equation"], "def solve(equation):\n    pass");
        let issue = Issue::new(IssueKind::ApiContractViolation, Severity::High, "solver.py", "arity")
            .with_subject(IssueSubject {
                name: "solve".to_string(),
                previous: Some(old),
                current: Some(new),
            });

        let text = FixTemplates::new().unwrap().draft(&issue).unwrap().unwrap().text();
        assert!(text.contains("def solve_legacy(equation, variable):"));
        assert!(text.contains("    return solve(equation)"));
    }

    #[test]
    fn test_annotate_code_and_inline_lines() {
        let issue = Issue::new(IssueKind::OutdatedDoc, Severity::High, "README.md", "stale")
            .with_origin("util.js")
            .with_subject(IssueSubject {
                name: "add".to_string(),
                previous: None,
                current: None,
            })
            .with_evidence(vec![
                Evidence {
                    line: 3,
                    snippet: "`add`".to_string(),
                },
                Evidence {
                    line: 6,
                    snippet: "add(1, 2)".to_string(),
                },
            ]);

        let draft = FixTemplates::new().unwrap().draft(&issue).unwrap().unwrap();
        assert_eq!(draft.target_path, PathBuf::from("README.md"));
        let Patch::Replace(replacements) = draft.patch else {
            panic!("expected a replace patch");
        };
        assert_eq!(
            replacements[0].replace,
            "`add` <!-- docsmith: stale, `add` no longer exists in util.js -->"
        );
        assert_eq!(
            replacements[1].replace,
            "add(1, 2) // docsmith: stale, `add` no longer exists in util.js"
        );
    }

    #[test]
    fn test_no_strategy_for_test_failures() {
        let issue = Issue::new(IssueKind::TestFailure, Severity::High, "tests/add.test.js", "failed");
        assert!(FixTemplates::new().unwrap().draft(&issue).unwrap().is_none());
    }
}
