//! Language-specific parsers
//!
//! Each source language gets its own module with a consistent interface for
//! turning file content into a symbol table. Markdown has its own parser
//! since documents produce references rather than symbols.

mod javascript;
mod markdown;
mod python;

pub use javascript::JavaScriptParser;
pub use markdown::MarkdownParser;
pub use python::PythonParser;

pub(crate) use python::module_to_specifier;

use std::path::Path;

use tree_sitter::Node;

use super::parser::{SourceSpan, SourceSymbols};
use crate::error::ParseError;

/// Trait that all source language parsers must implement
pub trait LanguageParser: Send + Sync {
    /// Parse source code and extract imports, symbols, calls and identifiers
    fn parse(&self, content: &str, file_path: &Path) -> Result<SourceSymbols, ParseError>;

    /// Get the file extensions this parser handles
    fn file_extensions(&self) -> &[&str];

    /// Get the language name
    fn language_name(&self) -> &str;
}

/// Extract text content of a node
pub(crate) fn node_text(node: Node, source: &str) -> String {
    source[node.byte_range()].to_string()
}

pub(crate) fn span_of(node: Node) -> SourceSpan {
    SourceSpan {
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
    }
}

/// Line (1-indexed) of the first error or missing node in the tree
pub(crate) fn first_error_line(root: Node) -> Option<usize> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
        }
        if node.has_error() {
            let mut cursor = node.walk();
            let children: Vec<Node> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
    }
    None
}

/// Number of arguments in an argument list node, ignoring comments
pub(crate) fn count_arguments(arguments: Node) -> usize {
    let mut cursor = arguments.walk();
    let count = arguments
        .named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .count();
    count
}

/// Strip the quotes from a string literal
pub(crate) fn unquote(literal: &str) -> String {
    literal
        .trim()
        .trim_start_matches(['\'', '"', '`'])
        .trim_end_matches(['\'', '"', '`'])
        .to_string()
}
