use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::templates::{Draft, FixTemplates};
use super::{Fix, FixAction, FixSource, Patch, Replacement};
use crate::core::issues::{technology_of, Issue};
use crate::core::llm::{Suggestion, SuggestionBackend, SuggestionContext};
use crate::error::{PlanningError, Result};

/// Ceiling for fixes no static strategy backs
const UNBACKED_CONFIDENCE_CAP: f32 = 0.5;

pub struct FixPlanner {
    templates: FixTemplates,
    backend: Option<Arc<dyn SuggestionBackend>>,
    timeout: Duration,
}

impl FixPlanner {
    pub fn new(backend: Option<Arc<dyn SuggestionBackend>>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            templates: FixTemplates::new()?,
            backend,
            timeout,
        })
    }

    /// Templates only
    pub fn offline() -> Result<Self> {
        Self::new(None, Duration::from_secs(0))
    }

    /// Draft a fix for `issue`, or `None` when no strategy applies.
    ///
    /// A backend suggestion wins over the template; a backend that errors or
    /// times out leaves the template draft in place.
    pub async fn plan(&self, issue: &Issue, prior_lessons: &[String]) -> Option<Fix> {
        let draft = match self.templates.draft(issue) {
            Ok(draft) => draft,
            Err(e) => {
                warn!("⚠️ Template failed for {}: {}", issue.id, e);
                None
            }
        };

        if let Some(backend) = &self.backend {
            match self.ask(backend.as_ref(), issue, draft.as_ref(), prior_lessons).await {
                Ok(Some(suggestion)) => {
                    debug!(
                        "{} suggested a fix for {} (confidence {:.2})",
                        backend.provider_name(),
                        issue.id,
                        suggestion.confidence
                    );
                    return Some(from_suggestion(issue, draft, suggestion, backend.provider_name()));
                }
                Ok(None) => debug!("{} had no suggestion for {}", backend.provider_name(), issue.id),
                Err(e) => warn!("⚠️ {}; falling back to templates", e),
            }
        }

        draft.map(|d| Fix::new(issue, d.action, d.patch, d.target_path, d.confidence, FixSource::Template))
    }

    async fn ask(
        &self,
        backend: &dyn SuggestionBackend,
        issue: &Issue,
        draft: Option<&Draft>,
        prior_lessons: &[String],
    ) -> std::result::Result<Option<Suggestion>, PlanningError> {
        let target = draft.map_or(&issue.path, |d| &d.target_path);
        let context = SuggestionContext {
            issue: issue.clone(),
            technology: technology_of(target).to_string(),
            template_draft: draft.map(|d| d.text()),
            prior_lessons: prior_lessons.to_vec(),
        };

        match tokio::time::timeout(self.timeout, backend.suggest(&context)).await {
            Ok(Ok(suggestion)) => Ok(suggestion),
            Ok(Err(e)) => Err(PlanningError::Backend(e.to_string())),
            Err(_) => Err(PlanningError::Timeout(self.timeout.as_secs())),
        }
    }
}

fn from_suggestion(issue: &Issue, draft: Option<Draft>, suggestion: Suggestion, provider: &str) -> Fix {
    let source = FixSource::Backend(provider.to_string());

    match draft {
        Some(draft) => {
            let patch = match draft.patch {
                Patch::Append(_) => Patch::Append(format!("\n{}\n", suggestion.text.trim_end())),
                Patch::Replace(mut replacements) => {
                    // The backend rewrites the first anchor; later anchors keep the template text
                    if let Some(first) = replacements.first_mut() {
                        first.replace = suggestion.text.clone();
                    }
                    Patch::Replace(replacements)
                }
            };
            Fix::new(issue, draft.action, patch, draft.target_path, suggestion.confidence, source)
        }
        None => {
            let anchor = issue
                .evidence
                .iter()
                .map(|e| e.snippet.trim_end())
                .find(|s| !s.trim().is_empty());
            let patch = match anchor {
                Some(find) => Patch::Replace(vec![Replacement {
                    find: find.to_string(),
                    replace: suggestion.text.clone(),
                }]),
                None => Patch::Append(format!("\n{}\n", suggestion.text.trim_end())),
            };
            Fix::new(
                issue,
                FixAction::Replace,
                patch,
                issue.path.clone(),
                suggestion.confidence.min(UNBACKED_CONFIDENCE_CAP),
                source,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::issues::{Evidence, IssueKind, IssueSubject, Severity};
    use crate::core::parser::{SourceSpan, Symbol, SymbolKind};
    use crate::error::DocsmithError;
    use std::path::PathBuf;

    struct FixedBackend(Option<Suggestion>);

    #[async_trait::async_trait]
    impl SuggestionBackend for FixedBackend {
        async fn suggest(&self, _context: &SuggestionContext) -> Result<Option<Suggestion>> {
            Ok(self.0.clone())
        }

        fn provider_name(&self) -> &str {
            "fixed"
        }

        fn model_name(&self) -> &str {
            "fixed-1"
        }
    }

    struct SlowBackend;

    #[async_trait::async_trait]
    impl SuggestionBackend for SlowBackend {
        async fn suggest(&self, _context: &SuggestionContext) -> Result<Option<Suggestion>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(DocsmithError::Llm("unreachable".to_string()))
        }

        fn provider_name(&self) -> &str {
            "slow"
        }

        fn model_name(&self) -> &str {
            "slow-1"
        }
    }

    fn breaking_change() -> Issue {
        let add = Symbol {
            name: "add".to_string(),
            kind: SymbolKind::Export,
            params: vec!["a".to_string(), "b".to_string()],
            arity: 2,
            is_async: false,
            callable: true,
            span: SourceSpan {
                start_line: 1,
                end_line: 1,
                start_byte: 0,
                end_byte: 40,
            },
            declaration: "export function add(a, b) { return a + b; }".to_string(),
        };
        Issue::new(IssueKind::BreakingChange, Severity::Critical, "main.js", "`add` was removed")
            .with_origin("util.js")
            .with_subject(IssueSubject {
                name: "add".to_string(),
                previous: Some(add),
                current: None,
            })
    }

    #[tokio::test]
    async fn test_template_fix_without_backend() {
        let fix = FixPlanner::offline()
            .unwrap()
            .plan(&breaking_change(), &[])
            .await
            .unwrap();

        assert_eq!(fix.action, FixAction::Restore);
        assert_eq!(fix.source, FixSource::Template);
        assert_eq!(fix.target_path, PathBuf::from("util.js"));
        assert!(fix.id.starts_with("fix-"));
    }

    #[tokio::test]
    async fn test_backend_suggestion_replaces_template_text() {
        let backend: Arc<dyn SuggestionBackend> = Arc::new(FixedBackend(Some(Suggestion {
            text: "export const add = (a, b) => a + b;".to_string(),
            confidence: 0.9,
        })));
        let planner = FixPlanner::new(Some(backend), Duration::from_secs(1)).unwrap();

        let fix = planner.plan(&breaking_change(), &[]).await.unwrap();
        assert_eq!(fix.source, FixSource::Backend("fixed".to_string()));
        assert_eq!(fix.confidence, 0.9);
        assert_eq!(fix.patch, Patch::Append("\nexport const add = (a, b) => a + b;\n".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_template() {
        let slow: Arc<dyn SuggestionBackend> = Arc::new(SlowBackend);
        let planner = FixPlanner::new(Some(slow), Duration::from_millis(50)).unwrap();
        let fix = planner.plan(&breaking_change(), &[]).await.unwrap();
        assert_eq!(fix.source, FixSource::Template);
        assert_eq!(fix.confidence, 0.75);
    }

    #[tokio::test]
    async fn test_no_strategy_means_no_fix() {
        let issue = Issue::new(IssueKind::TypeError, Severity::High, "main.js", "type mismatch");
        assert!(FixPlanner::offline().unwrap().plan(&issue, &[]).await.is_none());

        let silent: Arc<dyn SuggestionBackend> = Arc::new(FixedBackend(None));
        let planner = FixPlanner::new(Some(silent), Duration::from_secs(1)).unwrap();
        assert!(planner.plan(&issue, &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_unbacked_suggestion_is_capped() {
        let issue = Issue::new(IssueKind::TestFailure, Severity::High, "test/add.test.js", "expected 3")
            .with_evidence(vec![Evidence {
                line: 4,
                snippet: "expect(add(1, 2)).toBe(4);".to_string(),
            }]);
        let backend: Arc<dyn SuggestionBackend> = Arc::new(FixedBackend(Some(Suggestion {
            text: "expect(add(1, 2)).toBe(3);".to_string(),
            confidence: 0.95,
        })));
        let planner = FixPlanner::new(Some(backend), Duration::from_secs(1)).unwrap();

        let fix = planner.plan(&issue, &[]).await.unwrap();
        assert_eq!(fix.confidence, 0.5);
        assert_eq!(fix.target_path, PathBuf::from("test/add.test.js"));
        assert!(matches!(fix.patch, Patch::Replace(ref r) if r[0].find == "expect(add(1, 2)).toBe(4);"));
    }
}
