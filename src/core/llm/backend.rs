use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::issues::Issue;
use crate::error::Result;

/// What a backend sees when asked for a fix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionContext {
    pub issue: Issue,

    /// Technology of the file the fix will be written to
    pub technology: String,

    /// The static template's draft, if one exists
    pub template_draft: Option<String>,

    /// Prevention strategies from similar past lessons
    pub prior_lessons: Vec<String>,
}

impl SuggestionContext {
    pub fn prompt(&self) -> String {
        let issue = &self.issue;
        let mut prompt = String::new();

        prompt.push_str(&format!(
            "A {} change caused a {} issue ({:?}).\n",
            self.technology, issue.kind, issue.severity
        ));
        prompt.push_str(&format!("File: {}\n", issue.path.display()));
        prompt.push_str(&format!("Changed file: {}\n", issue.origin.display()));
        prompt.push_str(&format!("Problem: {}\n", issue.message));

        if let Some(subject) = &issue.subject {
            if let Some(previous) = &subject.previous {
                prompt.push_str(&format!("Previous declaration:\n{}\n", previous.declaration));
            }
            if let Some(current) = &subject.current {
                prompt.push_str(&format!("Current declaration:\n{}\n", current.declaration));
            }
        }

        if !issue.evidence.is_empty() {
            prompt.push_str("Evidence:\n");
            for evidence in &issue.evidence {
                prompt.push_str(&format!("  line {}: {}\n", evidence.line, evidence.snippet));
            }
        }

        if let Some(draft) = &self.template_draft {
            prompt.push_str(&format!("\nA template proposes:\n{}\n", draft));
        }

        if !self.prior_lessons.is_empty() {
            prompt.push_str("\nLessons from similar issues:\n");
            for lesson in &self.prior_lessons {
                prompt.push_str(&format!("- {}\n", lesson));
            }
        }

        prompt.push_str(
            "\nReply with a first line `confidence: <0.0-1.0>` followed by only the text to write. \
             Reply `none` if no safe fix exists.",
        );

        prompt
    }
}

/// A backend's proposed text and how sure it is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    pub confidence: f32,
}

/// Anything that can propose fix text: a model API, an MCP tool, a test double
#[async_trait::async_trait]
pub trait SuggestionBackend: Send + Sync {
    /// `Ok(None)` when the backend has nothing to offer
    async fn suggest(&self, context: &SuggestionContext) -> Result<Option<Suggestion>>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

static CONFIDENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*confidence:\s*([0-9]*\.?[0-9]+)\s*$").expect("Invalid confidence regex")
});

/// Split a raw model reply into confidence and text
pub fn parse_suggestion(raw: &str) -> Option<Suggestion> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }

    let mut lines = trimmed.lines();
    let first = lines.next().unwrap_or_default();
    let (confidence, text) = match CONFIDENCE_REGEX.captures(first) {
        Some(caps) => {
            let confidence = caps[1].parse::<f32>().unwrap_or(0.5).clamp(0.0, 1.0);
            (confidence, lines.collect::<Vec<_>>().join("\n"))
        }
        None => (0.5, trimmed.to_string()),
    };

    let text = strip_fence(text.trim());
    if text.is_empty() || text.eq_ignore_ascii_case("none") {
        return None;
    }

    Some(Suggestion { text, confidence })
}

/// Models like to wrap code in a fence even when told not to
fn strip_fence(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() >= 2 && lines[0].starts_with("```") && lines[lines.len() - 1].trim() == "```" {
        lines[1..lines.len() - 1].join("\n")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::issues::{IssueKind, Severity};

    #[test]
    fn test_parse_suggestion_with_confidence() {
        let suggestion =
            parse_suggestion("confidence: 0.85\n```js\nexport function add(a, b) {}\n```").unwrap();
        assert_eq!(suggestion.confidence, 0.85);
        assert_eq!(suggestion.text, "export function add(a, b) {}");
    }

    #[test]
    fn test_parse_suggestion_without_confidence() {
        let suggestion = parse_suggestion("return a + b;").unwrap();
        assert_eq!(suggestion.confidence, 0.5);
        assert!(parse_suggestion("  none ").is_none());
        assert!(parse_suggestion("confidence: 0.9\nnone").is_none());
    }

    #[test]
    fn test_shared_confidence_pattern_across_replies() {
        let replies = [
            ("Confidence: 1.7\nfix a", 1.0),
            ("  CONFIDENCE: .25  \nfix b", 0.25),
            ("confidence: high\nfix c", 0.5),
        ];
        for (raw, expected) in replies {
            assert_eq!(parse_suggestion(raw).unwrap().confidence, expected, "{}", raw);
        }
        assert_eq!(parse_suggestion("confidence: 0.9\nfix d").unwrap().text, "fix d");
    }

    #[test]
    fn test_prompt_mentions_issue_and_draft() {
        let issue = Issue::new(IssueKind::BreakingChange, Severity::Critical, "main.js", "`add` was removed")
            .with_origin("util.js");
        let context = SuggestionContext {
            issue,
            technology: "javascript".to_string(),
            template_draft: Some("export function add(a, b) {}".to_string()),
            prior_lessons: vec!["Deprecate before removing exports".to_string()],
        };

        let prompt = context.prompt();
        assert!(prompt.contains("Changed file: util.js"));
        assert!(prompt.contains("breaking-change"));
        assert!(prompt.contains("A template proposes"));
        assert!(prompt.contains("- Deprecate before removing exports"));
    }
}
