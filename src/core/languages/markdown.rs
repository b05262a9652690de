use std::path::Path;

use regex::Regex;

use super::module_to_specifier;
use crate::core::parser::{
    CallSite, DocReference, DocReferences, Heading, ReferenceKind, STALE_MARKER,
};
use crate::error::ParseError;

/// Fence languages whose bodies are scanned for imports and calls
const CODE_LANGUAGES: &[&str] = &[
    "js", "javascript", "jsx", "mjs", "ts", "typescript", "tsx", "py", "python",
];

/// Words that look like calls in code but are not
const NOT_CALLS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "function", "def", "class", "elif",
    "print", "typeof", "await", "async", "with", "super", "import", "require",
];

/// Extracts code references from Markdown documents
pub struct MarkdownParser {
    heading_regex: Regex,
    inline_code_regex: Regex,
    endpoint_regex: Regex,
    js_import_regex: Regex,
    js_require_regex: Regex,
    py_from_regex: Regex,
    py_import_regex: Regex,
    call_regex: Regex,
}

struct OpenFence {
    marker: String,
    language: Option<String>,
    start_line: usize,
    lines: Vec<String>,
}

impl MarkdownParser {
    pub fn new() -> Self {
        Self {
            heading_regex: Regex::new(r"^\s{0,3}(#{1,6})\s+(.+?)\s*#*\s*$")
                .expect("Invalid heading regex"),
            inline_code_regex: Regex::new(r"`([^`\n]+)`").expect("Invalid inline code regex"),
            endpoint_regex: Regex::new(r"\b(GET|POST|PUT|PATCH|DELETE)\s+(/[\w/{}:.\-]*)")
                .expect("Invalid endpoint regex"),
            js_import_regex: Regex::new(
                r#"^\s*import\s+(?:(.+?)\s+from\s+)?['"]([^'"]+)['"]"#,
            )
            .expect("Invalid import regex"),
            js_require_regex: Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#)
                .expect("Invalid require regex"),
            py_from_regex: Regex::new(r"^\s*from\s+(\.*[\w.]*)\s+import\s+(.+?)\s*$")
                .expect("Invalid from-import regex"),
            py_import_regex: Regex::new(r"^\s*import\s+([\w.]+)\s*(?:as\s+\w+)?\s*$")
                .expect("Invalid python import regex"),
            call_regex: Regex::new(r"([A-Za-z_$][\w$]*)\s*\(([^()]*)\)")
                .expect("Invalid call regex"),
        }
    }

    /// Collect headings, code blocks, inline code, endpoint and import mentions
    pub fn parse(&self, content: &str, file_path: &Path) -> Result<DocReferences, ParseError> {
        let mut doc = DocReferences::default();
        let mut fence: Option<OpenFence> = None;

        for (index, line) in content.lines().enumerate() {
            let line_number = index + 1;
            let trimmed = line.trim_start();

            if let Some(open) = fence.as_mut() {
                if is_closing_fence(trimmed, &open.marker) {
                    if let Some(closed) = fence.take() {
                        self.close_fence(closed, &mut doc);
                    }
                } else {
                    open.lines.push(line.to_string());
                }
                continue;
            }

            if let Some(marker) = opening_fence(trimmed) {
                let info = trimmed[marker.len()..].trim();
                let language = info
                    .split_whitespace()
                    .next()
                    .map(|l| l.to_lowercase());
                fence = Some(OpenFence {
                    marker,
                    language,
                    start_line: line_number,
                    lines: Vec::new(),
                });
                continue;
            }

            if let Some(caps) = self.heading_regex.captures(line) {
                doc.headings.push(Heading {
                    level: caps[1].len(),
                    text: caps[2].to_string(),
                    line: line_number,
                });
            }

            if line.contains(STALE_MARKER) {
                continue;
            }

            for caps in self.inline_code_regex.captures_iter(line) {
                doc.references.push(DocReference {
                    kind: ReferenceKind::InlineCode,
                    content: caps[1].to_string(),
                    position: line_number,
                    language: None,
                    names: vec![],
                });
            }

            for caps in self.endpoint_regex.captures_iter(line) {
                doc.references.push(DocReference {
                    kind: ReferenceKind::EndpointMention,
                    content: format!("{} {}", &caps[1], caps[2].trim_end_matches('.')),
                    position: line_number,
                    language: None,
                    names: vec![],
                });
            }
        }

        if let Some(open) = fence {
            return Err(ParseError::new(
                file_path,
                format!("unterminated code fence opened at line {}", open.start_line),
            ));
        }

        Ok(doc)
    }

    fn close_fence(&self, fence: OpenFence, doc: &mut DocReferences) {
        let body = fence.lines.join("\n");
        let scan = fence
            .language
            .as_deref()
            .map_or(true, |l| CODE_LANGUAGES.contains(&l));

        doc.references.push(DocReference {
            kind: ReferenceKind::CodeBlock,
            content: body,
            position: fence.start_line,
            language: fence.language.clone(),
            names: vec![],
        });

        if !scan {
            return;
        }

        for (offset, line) in fence.lines.iter().enumerate() {
            // The fence itself is on start_line
            let line_number = fence.start_line + offset + 1;
            if line.contains(STALE_MARKER) {
                continue;
            }

            if let Some((specifier, names)) = self.import_in_line(line) {
                doc.references.push(DocReference {
                    kind: ReferenceKind::ImportMention,
                    content: specifier,
                    position: line_number,
                    language: fence.language.clone(),
                    names,
                });
            }

            for caps in self.call_regex.captures_iter(line) {
                let whole = caps.get(0).map_or(0, |m| m.start());
                let name = &caps[1];
                if NOT_CALLS.contains(&name) || is_definition(&line[..whole]) {
                    continue;
                }
                let arity = caps[2].split(',').filter(|a| !a.trim().is_empty()).count();
                doc.calls.push(CallSite {
                    name: name.to_string(),
                    arity,
                    line: line_number,
                    member: false,
                });
            }
        }
    }

    /// Import statement written on one line of a code block
    fn import_in_line(&self, line: &str) -> Option<(String, Vec<String>)> {
        if let Some(caps) = self.js_import_regex.captures(line) {
            let names = caps
                .get(1)
                .map(|clause| parse_js_clause(clause.as_str()))
                .unwrap_or_default();
            return Some((caps[2].to_string(), names));
        }
        if let Some(caps) = self.js_require_regex.captures(line) {
            return Some((caps[1].to_string(), vec!["*".to_string()]));
        }
        if let Some(caps) = self.py_from_regex.captures(line) {
            let (specifier, _) = module_to_specifier(&caps[1]);
            let names = caps[2]
                .trim_matches(|c| c == '(' || c == ')')
                .split(',')
                .filter_map(|n| n.split_whitespace().next())
                .map(|n| n.to_string())
                .collect();
            return Some((specifier, names));
        }
        if let Some(caps) = self.py_import_regex.captures(line) {
            let (specifier, _) = module_to_specifier(&caps[1]);
            return Some((specifier, vec!["*".to_string()]));
        }
        None
    }
}

impl Default for MarkdownParser {
    fn default() -> Self {
        Self::new()
    }
}

fn opening_fence(trimmed: &str) -> Option<String> {
    for fence_char in ['`', '~'] {
        let run = trimmed.chars().take_while(|c| *c == fence_char).count();
        if run >= 3 {
            return Some(fence_char.to_string().repeat(run));
        }
    }
    None
}

fn is_closing_fence(trimmed: &str, marker: &str) -> bool {
    let trimmed = trimmed.trim_end();
    let Some(fence_char) = marker.chars().next() else {
        return false;
    };
    trimmed.len() >= marker.len() && trimmed.chars().all(|c| c == fence_char)
}

/// Whether the text before a call-like match makes it a declaration
fn is_definition(prefix: &str) -> bool {
    let prefix = prefix.trim_end();
    ["function", "def", "class", "async function"]
        .iter()
        .any(|kw| prefix.ends_with(kw))
}

/// Names bound by an ES import clause: `add`, `{ add, sub as s }`, `* as ns`
fn parse_js_clause(clause: &str) -> Vec<String> {
    let mut names = Vec::new();
    let clause = clause.trim();

    let (default_part, braces) = match (clause.find('{'), clause.rfind('}')) {
        (Some(open), Some(close)) if open < close => {
            (clause[..open].trim(), Some(&clause[open + 1..close]))
        }
        _ => (clause, None),
    };

    for part in default_part.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.starts_with('*') {
            names.push("*".to_string());
        } else {
            names.push("default".to_string());
        }
    }

    if let Some(inner) = braces {
        for specifier in inner.split(',') {
            if let Some(name) = specifier.split_whitespace().next() {
                names.push(name.to_string());
            }
        }
    }

    names
}
