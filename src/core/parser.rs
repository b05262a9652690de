use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::languages::{JavaScriptParser, LanguageParser, MarkdownParser, PythonParser};
use crate::config::{ParsingConfig, ProjectConfig};
use crate::error::ParseError;

/// Kind of a top-level symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Class,
    /// Anything visible to other modules (ES export, CommonJS export, `__all__`)
    Export,
}

/// Location of a symbol's declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    /// 1-indexed line range
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
}

/// A function, class or export extracted from a source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Parameter names as written
    pub params: Vec<String>,
    pub arity: usize,
    pub is_async: bool,
    /// Whether the symbol can be called (functions, function-valued exports)
    pub callable: bool,
    pub span: SourceSpan,
    /// Full source text of the declaration
    pub declaration: String,
}

impl Symbol {
    /// Compares everything except location and text. Two symbols with the
    /// same name and the same signature are the same symbol.
    pub fn same_signature(&self, other: &Symbol) -> bool {
        self.kind == other.kind
            && self.arity == other.arity
            && self.is_async == other.is_async
            && self.callable == other.callable
    }

    pub fn is_exported(&self) -> bool {
        self.kind == SymbolKind::Export
    }
}

/// An import statement or `require` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    /// Path-like specifier (`./util.js`, `../pkg/mod`, `react`)
    pub specifier: String,
    /// Imported names; `default` for default imports, `*` for namespaces
    pub names: Vec<String>,
    pub line: usize,
    /// Bare specifiers are project-local modules (Python) rather than packages
    pub bare_is_local: bool,
}

/// A call to a named function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub name: String,
    pub arity: usize,
    pub line: usize,
    /// Called through a receiver (`console.log(..)`, `util.add(..)`)
    #[serde(default)]
    pub member: bool,
}

/// Parsed structure of a source file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSymbols {
    pub imports: Vec<Import>,
    pub symbols: Vec<Symbol>,
    pub calls: Vec<CallSite>,
    /// Identifiers used in the file that are not declared at its top level
    pub identifiers: BTreeSet<String>,
}

impl SourceSymbols {
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Whether the file uses `name` as a free identifier. Member calls and
    /// locally bound names do not count.
    pub fn uses(&self, name: &str) -> bool {
        self.identifiers.contains(name) || self.calls.iter().any(|c| !c.member && c.name == name)
    }

    /// Whether some call reaches `name` through a receiver
    pub fn calls_member(&self, name: &str) -> bool {
        self.calls.iter().any(|c| c.member && c.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    CodeBlock,
    InlineCode,
    /// An import statement inside a fenced block; the only doc reference that creates an edge
    ImportMention,
    EndpointMention,
}

/// Something in a document that points at code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocReference {
    pub kind: ReferenceKind,
    pub content: String,
    /// 1-indexed line where the reference starts
    pub position: usize,
    /// Fence language for code blocks and import mentions
    pub language: Option<String>,
    /// Imported names for import mentions
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub level: usize,
    pub text: String,
    pub line: usize,
}

/// Parsed structure of a documentation file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocReferences {
    pub headings: Vec<Heading>,
    pub references: Vec<DocReference>,
    /// Calls written inside code blocks
    pub calls: Vec<CallSite>,
}

impl DocReferences {
    pub fn of_kind(&self, kind: ReferenceKind) -> impl Iterator<Item = &DocReference> {
        self.references.iter().filter(move |r| r.kind == kind)
    }

    /// References whose text mentions `name` as a whole word
    pub fn mentioning<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DocReference> {
        self.references.iter().filter(move |r| {
            matches!(
                r.kind,
                ReferenceKind::CodeBlock | ReferenceKind::InlineCode | ReferenceKind::ImportMention
            ) && (contains_word(&r.content, name) || r.names.iter().any(|n| n == name))
        })
    }
}

/// Result of parsing one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedContent {
    Source(SourceSymbols),
    Doc(DocReferences),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    /// File path relative to project root
    pub path: PathBuf,

    /// Language detected from the extension
    pub language: String,

    /// Content hash for change detection
    pub content_hash: String,

    pub content: ParsedContent,
}

impl ParseResult {
    pub fn symbols(&self) -> &[Symbol] {
        match &self.content {
            ParsedContent::Source(source) => &source.symbols,
            ParsedContent::Doc(_) => &[],
        }
    }
}

/// Multi-language parser. Parsing is pure: it never touches the filesystem.
pub struct SourceParser {
    config: ParsingConfig,
    doc_extensions: Vec<String>,
    language_parsers: Vec<Box<dyn LanguageParser>>,
    markdown: MarkdownParser,
}

impl SourceParser {
    pub fn new(parsing: &ParsingConfig, project: &ProjectConfig) -> Self {
        let mut language_parsers: Vec<Box<dyn LanguageParser>> = Vec::new();

        for language in &parsing.languages {
            match language.as_str() {
                "javascript" => language_parsers.push(Box::new(JavaScriptParser::new())),
                "python" => language_parsers.push(Box::new(PythonParser::new())),
                _ => {
                    tracing::warn!("Skipping unsupported language `{}`", language);
                }
            }
        }

        Self {
            config: parsing.clone(),
            doc_extensions: project.doc_extensions.clone(),
            language_parsers,
            markdown: MarkdownParser::new(),
        }
    }

    /// Whether `path` is a file this parser understands
    pub fn handles(&self, path: &Path) -> bool {
        self.language_for(path).is_some()
    }

    /// Parse a file's content into symbols (source) or references (docs)
    pub fn parse(&self, path: &Path, content: &str) -> Result<ParseResult, ParseError> {
        if content.len() > self.config.max_file_size {
            return Err(ParseError::new(
                path,
                format!(
                    "file is {} bytes, above the {} byte limit",
                    content.len(),
                    self.config.max_file_size
                ),
            ));
        }

        let language = self
            .language_for(path)
            .ok_or_else(|| ParseError::new(path, "unsupported file type"))?;

        let parsed = if language == "markdown" {
            ParsedContent::Doc(self.markdown.parse(content, path)?)
        } else {
            let parser = self
                .language_parsers
                .iter()
                .find(|p| p.language_name() == language)
                .ok_or_else(|| ParseError::new(path, "unsupported file type"))?;
            ParsedContent::Source(parser.parse(content, path)?)
        };

        Ok(ParseResult {
            path: path.to_path_buf(),
            language: language.to_string(),
            content_hash: content_hash(content),
            content: parsed,
        })
    }

    /// Detect language from file extension
    pub fn language_for(&self, path: &Path) -> Option<&str> {
        let extension = path.extension().and_then(|ext| ext.to_str())?;

        if self.doc_extensions.iter().any(|e| e == extension) {
            return Some("markdown");
        }

        self.language_parsers
            .iter()
            .find(|p| p.file_extensions().contains(&extension))
            .map(|p| p.language_name())
    }
}

/// Marks a documentation line already annotated as stale by a fix
pub const STALE_MARKER: &str = "docsmith: stale";

/// SHA-256 of content
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whole-word containment for identifier-like needles
pub fn contains_word(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.map_or(false, is_ident) && !after.map_or(false, is_ident)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> SourceParser {
        SourceParser::new(&ParsingConfig::default(), &ProjectConfig::default())
    }

    #[test]
    fn test_dispatches_by_extension() {
        let parser = parser();

        let js = parser
            .parse(Path::new("util.js"), "export function add(a, b) { return a + b; }")
            .unwrap();
        assert_eq!(js.language, "javascript");
        assert_eq!(js.symbols().len(), 1);

        let md = parser.parse(Path::new("README.md"), "# Title\n").unwrap();
        assert_eq!(md.language, "markdown");
        assert!(matches!(md.content, ParsedContent::Doc(_)));

        let err = parser.parse(Path::new("notes.txt"), "hello").unwrap_err();
        assert_eq!(err.reason, "unsupported file type");
    }

    #[test]
    fn test_rejects_oversized_files() {
        let mut config = ParsingConfig::default();
        config.max_file_size = 8;
        let parser = SourceParser::new(&config, &ProjectConfig::default());

        assert!(parser.parse(Path::new("a.js"), "const value = 1;").is_err());
    }

    #[test]
    fn test_content_hash_tracks_content() {
        assert_eq!(content_hash("a"), content_hash("a"));
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[test]
    fn test_contains_word() {
        assert!(contains_word("const x = add(1, 2);", "add"));
        assert!(!contains_word("const address = 1;", "add"));
        assert!(!contains_word("padding", "add"));
        assert!(contains_word("add", "add"));
    }
}
