use std::collections::BTreeSet;
use std::path::Path;

use tree_sitter::{Node, Parser};

use super::{count_arguments, first_error_line, node_text, span_of, unquote, LanguageParser};
use crate::core::parser::{CallSite, Import, SourceSymbols, Symbol, SymbolKind};
use crate::error::ParseError;

/// JavaScript-specific parser using Tree-sitter
pub struct JavaScriptParser;

impl JavaScriptParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JavaScriptParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageParser for JavaScriptParser {
    fn parse(&self, content: &str, file_path: &Path) -> Result<SourceSymbols, ParseError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_javascript::language())
            .map_err(|e| {
                ParseError::new(file_path, format!("failed to set JavaScript language: {}", e))
            })?;

        let tree = parser
            .parse(content, None)
            .ok_or_else(|| ParseError::new(file_path, "failed to parse JavaScript code"))?;
        let root = tree.root_node();

        if root.has_error() {
            let line = first_error_line(root).unwrap_or(1);
            return Err(ParseError::new(
                file_path,
                format!("syntax error near line {}", line),
            ));
        }

        let mut collector = TopLevel::default();
        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            collector.visit(child, child, content, false);
        }

        let TopLevel {
            mut symbols,
            imports,
            exported,
            declared,
        } = collector;

        for symbol in symbols.iter_mut() {
            if exported.contains(&symbol.name) {
                symbol.kind = SymbolKind::Export;
            }
        }

        let mut result = SourceSymbols {
            imports,
            symbols,
            ..Default::default()
        };
        collect_uses(root, content, &mut result);

        for name in declared.iter().chain(result.symbols.iter().map(|s| &s.name)) {
            result.identifiers.remove(name);
        }

        Ok(result)
    }

    fn file_extensions(&self) -> &[&str] {
        &["js", "jsx", "mjs", "cjs"]
    }

    fn language_name(&self) -> &str {
        "javascript"
    }
}

/// Accumulates the top-level declarations of a module
#[derive(Default)]
struct TopLevel {
    symbols: Vec<Symbol>,
    imports: Vec<Import>,
    /// Names exported by clause or CommonJS assignment rather than by declaration
    exported: BTreeSet<String>,
    /// Top-level bindings that are not symbols (plain constants)
    declared: BTreeSet<String>,
}

impl TopLevel {
    /// `outer` is the statement that owns the declaration (the export statement when exported)
    fn visit(&mut self, node: Node, outer: Node, source: &str, exported: bool) {
        let kind = if exported {
            SymbolKind::Export
        } else {
            SymbolKind::Function
        };

        match node.kind() {
            "function_declaration" | "generator_function_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.push_function(node_text(name, source), node, outer, source, kind);
                }
            }
            "class_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let params = constructor_params(node, source);
                    self.symbols.push(Symbol {
                        name: node_text(name, source),
                        kind: if exported {
                            SymbolKind::Export
                        } else {
                            SymbolKind::Class
                        },
                        arity: params.len(),
                        params,
                        is_async: false,
                        callable: false,
                        span: span_of(outer),
                        declaration: node_text(outer, source),
                    });
                }
            }
            "lexical_declaration" | "variable_declaration" => {
                let mut cursor = node.walk();
                for declarator in node.named_children(&mut cursor) {
                    if declarator.kind() != "variable_declarator" {
                        continue;
                    }
                    let Some(name_node) = declarator.child_by_field_name("name") else {
                        continue;
                    };
                    if name_node.kind() != "identifier" {
                        continue;
                    }
                    let name = node_text(name_node, source);
                    match declarator.child_by_field_name("value") {
                        Some(value) if is_function_value(value) => {
                            self.push_function(name, value, outer, source, kind);
                        }
                        _ if exported => self.symbols.push(Symbol {
                            name,
                            kind: SymbolKind::Export,
                            params: vec![],
                            arity: 0,
                            is_async: false,
                            callable: false,
                            span: span_of(outer),
                            declaration: node_text(outer, source),
                        }),
                        _ => {
                            self.declared.insert(name);
                        }
                    }
                }
            }
            "export_statement" => self.visit_export(node, source),
            "import_statement" => {
                if let Some(import) = parse_import(node, source) {
                    self.imports.push(import);
                }
            }
            "expression_statement" => self.visit_commonjs(node, source),
            _ => {}
        }
    }

    fn visit_export(&mut self, node: Node, source: &str) {
        if let Some(declaration) = node.child_by_field_name("declaration") {
            self.visit(declaration, node, source, true);
            return;
        }

        if let Some(value) = node.child_by_field_name("value") {
            // export default <expression>
            if value.kind() == "identifier" {
                self.exported.insert(node_text(value, source));
            } else if is_function_value(value) {
                self.push_function("default".to_string(), value, node, source, SymbolKind::Export);
            }
            return;
        }

        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if child.kind() != "export_clause" {
                continue;
            }
            let mut clause_cursor = child.walk();
            for specifier in child.named_children(&mut clause_cursor) {
                if let Some(name) = specifier.child_by_field_name("name") {
                    self.exported.insert(unquote(&node_text(name, source)));
                }
            }
        }
    }

    /// `module.exports = { a, b }`, `module.exports = a`, `exports.a = function () {}`
    fn visit_commonjs(&mut self, statement: Node, source: &str) {
        let Some(assignment) = statement.named_child(0) else {
            return;
        };
        if assignment.kind() != "assignment_expression" {
            return;
        }
        let (Some(left), Some(right)) = (
            assignment.child_by_field_name("left"),
            assignment.child_by_field_name("right"),
        ) else {
            return;
        };
        if left.kind() != "member_expression" {
            return;
        }

        let target = node_text(left, source);
        if target == "module.exports" {
            match right.kind() {
                "identifier" => {
                    self.exported.insert(node_text(right, source));
                }
                "object" => {
                    let mut cursor = right.walk();
                    for property in right.named_children(&mut cursor) {
                        match property.kind() {
                            "shorthand_property_identifier" => {
                                self.exported.insert(node_text(property, source));
                            }
                            "pair" => self.visit_export_pair(property, statement, source),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
            return;
        }

        let Some(object) = left.child_by_field_name("object") else {
            return;
        };
        let object = node_text(object, source);
        if object != "exports" && object != "module.exports" {
            return;
        }
        let Some(property) = left.child_by_field_name("property") else {
            return;
        };
        let name = node_text(property, source);
        if is_function_value(right) {
            self.push_function(name, right, statement, source, SymbolKind::Export);
        } else if right.kind() == "identifier" {
            self.exported.insert(node_text(right, source));
        }
    }

    fn visit_export_pair(&mut self, pair: Node, statement: Node, source: &str) {
        let (Some(key), Some(value)) = (
            pair.child_by_field_name("key"),
            pair.child_by_field_name("value"),
        ) else {
            return;
        };
        if value.kind() == "identifier" {
            self.exported.insert(node_text(value, source));
        } else if is_function_value(value) {
            let name = unquote(&node_text(key, source));
            self.push_function(name, value, statement, source, SymbolKind::Export);
        }
    }

    fn push_function(
        &mut self,
        name: String,
        function: Node,
        outer: Node,
        source: &str,
        kind: SymbolKind,
    ) {
        let params = function_params(function, source);
        self.symbols.push(Symbol {
            name,
            kind,
            arity: params.len(),
            params,
            is_async: has_async_keyword(function),
            callable: true,
            span: span_of(outer),
            declaration: node_text(outer, source),
        });
    }
}

fn is_function_value(node: Node) -> bool {
    matches!(
        node.kind(),
        "arrow_function" | "function_expression" | "function" | "generator_function"
    )
}

fn has_async_keyword(node: Node) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|c| c.kind() == "async");
    found
}

/// Parameter names of a function-like node
fn function_params(function: Node, source: &str) -> Vec<String> {
    // `x => x` has a single bare parameter
    if let Some(single) = function.child_by_field_name("parameter") {
        return vec![node_text(single, source)];
    }

    let Some(parameters) = function.child_by_field_name("parameters") else {
        return vec![];
    };
    let mut cursor = parameters.walk();
    let params = parameters
        .named_children(&mut cursor)
        .filter(|p| p.kind() != "comment")
        .map(|p| node_text(p, source))
        .collect();
    params
}

fn constructor_params(class: Node, source: &str) -> Vec<String> {
    let Some(body) = class.child_by_field_name("body") else {
        return vec![];
    };
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        if member.kind() != "method_definition" {
            continue;
        }
        let is_constructor = member
            .child_by_field_name("name")
            .map_or(false, |n| node_text(n, source) == "constructor");
        if is_constructor {
            return function_params(member, source);
        }
    }
    vec![]
}

fn parse_import(node: Node, source: &str) -> Option<Import> {
    let specifier = unquote(&node_text(node.child_by_field_name("source")?, source));
    let mut names = Vec::new();

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() != "import_clause" {
            continue;
        }
        let mut clause_cursor = child.walk();
        for part in child.named_children(&mut clause_cursor) {
            match part.kind() {
                "identifier" => names.push("default".to_string()),
                "namespace_import" => names.push("*".to_string()),
                "named_imports" => {
                    let mut named_cursor = part.walk();
                    for specifier in part.named_children(&mut named_cursor) {
                        if let Some(name) = specifier.child_by_field_name("name") {
                            names.push(unquote(&node_text(name, source)));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Some(Import {
        specifier,
        names,
        line: node.start_position().row + 1,
        bare_is_local: false,
    })
}

/// Walk the whole tree for `require` imports, call sites and free identifier uses
fn collect_uses(root: Node, source: &str, result: &mut SourceSymbols) {
    let mut scopes = Vec::new();
    walk_uses(root, source, &mut scopes, result);
    result.calls.sort_by(|a, b| a.line.cmp(&b.line).then_with(|| a.name.cmp(&b.name)));
}

/// `scopes` holds the names bound by each enclosing function or block
fn walk_uses(
    node: Node,
    source: &str,
    scopes: &mut Vec<BTreeSet<String>>,
    result: &mut SourceSymbols,
) {
    match node.kind() {
        // Bindings, tracked by the top-level pass
        "import_statement" => return,
        "call_expression" => record_call(node, source, scopes, result),
        "identifier" | "shorthand_property_identifier" => {
            let name = node_text(node, source);
            if !scopes.iter().any(|scope| scope.contains(&name)) {
                result.identifiers.insert(name);
            }
        }
        _ => {}
    }

    let scope = local_bindings(node, source);
    let pushed = !scope.is_empty();
    if pushed {
        scopes.push(scope);
    }

    let mut cursor = node.walk();
    let children: Vec<Node> = node.named_children(&mut cursor).collect();
    for child in children {
        walk_uses(child, source, scopes, result);
    }

    if pushed {
        scopes.pop();
    }
}

/// Names a node binds for its own subtree: parameters of functions, and
/// declarations directly inside blocks, loop headers and catch clauses
fn local_bindings(node: Node, source: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    match node.kind() {
        "function_declaration"
        | "generator_function_declaration"
        | "function_expression"
        | "function"
        | "generator_function"
        | "arrow_function"
        | "method_definition" => {
            for field in ["parameter", "parameters"] {
                if let Some(params) = node.child_by_field_name(field) {
                    pattern_names(params, source, &mut names);
                }
            }
            // A named function expression sees its own name
            if node.kind() != "function_declaration" && node.kind() != "method_definition" {
                if let Some(name) = node.child_by_field_name("name") {
                    names.insert(node_text(name, source));
                }
            }
        }
        "statement_block" => {
            let mut cursor = node.walk();
            for statement in node.named_children(&mut cursor) {
                declared_names(statement, source, &mut names);
            }
        }
        "for_statement" => {
            if let Some(init) = node.child_by_field_name("initializer") {
                declared_names(init, source, &mut names);
            }
        }
        "for_in_statement" => {
            if node.child_by_field_name("kind").is_some() {
                if let Some(left) = node.child_by_field_name("left") {
                    pattern_names(left, source, &mut names);
                }
            }
        }
        "catch_clause" => {
            if let Some(param) = node.child_by_field_name("parameter") {
                pattern_names(param, source, &mut names);
            }
        }
        _ => {}
    }
    names
}

fn declared_names(statement: Node, source: &str, names: &mut BTreeSet<String>) {
    match statement.kind() {
        "lexical_declaration" | "variable_declaration" => {
            let mut cursor = statement.walk();
            for declarator in statement.named_children(&mut cursor) {
                if let Some(name) = declarator.child_by_field_name("name") {
                    pattern_names(name, source, names);
                }
            }
        }
        "function_declaration" | "generator_function_declaration" | "class_declaration" => {
            if let Some(name) = statement.child_by_field_name("name") {
                names.insert(node_text(name, source));
            }
        }
        _ => {}
    }
}

/// Identifiers bound by a parameter list or destructuring pattern
fn pattern_names(pattern: Node, source: &str, names: &mut BTreeSet<String>) {
    match pattern.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => {
            names.insert(node_text(pattern, source));
        }
        // Defaults may read outer names; only the left side binds
        "assignment_pattern" | "object_assignment_pattern" => {
            if let Some(left) = pattern.child_by_field_name("left") {
                pattern_names(left, source, names);
            }
        }
        "pair_pattern" => {
            if let Some(value) = pattern.child_by_field_name("value") {
                pattern_names(value, source, names);
            }
        }
        "formal_parameters" | "object_pattern" | "array_pattern" | "rest_pattern" => {
            let mut cursor = pattern.walk();
            for child in pattern.named_children(&mut cursor) {
                pattern_names(child, source, names);
            }
        }
        _ => {}
    }
}

fn record_call(
    node: Node,
    source: &str,
    scopes: &[BTreeSet<String>],
    result: &mut SourceSymbols,
) {
    let Some(function) = node.child_by_field_name("function") else {
        return;
    };
    let Some(arguments) = node.child_by_field_name("arguments") else {
        return;
    };
    if arguments.kind() != "arguments" {
        return;
    }
    let line = node.start_position().row + 1;
    let member = function.kind() == "member_expression";

    let name = match function.kind() {
        "identifier" => node_text(function, source),
        "member_expression" => match function.child_by_field_name("property") {
            Some(property) => node_text(property, source),
            None => return,
        },
        _ => return,
    };

    if name == "require" && !member {
        if let Some(first) = arguments.named_child(0) {
            if first.kind() == "string" {
                result.imports.push(Import {
                    specifier: unquote(&node_text(first, source)),
                    names: vec!["*".to_string()],
                    line,
                    bare_is_local: false,
                });
            }
        }
        return;
    }
    // Calls to a local binding do not reach the module's imports
    if !member && scopes.iter().any(|scope| scope.contains(&name)) {
        return;
    }

    result.calls.push(CallSite {
        name,
        arity: count_arguments(arguments),
        line,
        member,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> SourceSymbols {
        JavaScriptParser::new()
            .parse(source, Path::new("test.js"))
            .unwrap()
    }

    #[test]
    fn test_es_module_exports() {
        let symbols = parse(
            r#"
import { format } from './format.js';

export function add(a, b) {
  return a + b;
}

export async function load(path) {
  return fetch(path);
}

function helper(x) {
  return format(x);
}

export const twice = (x) => add(x, x);
export const VERSION = '1.0';

class Store {
  constructor(root, options) {}
}

export { Store };
"#,
        );

        let add = symbols.symbol("add").unwrap();
        assert_eq!(add.kind, SymbolKind::Export);
        assert_eq!(add.arity, 2);
        assert_eq!(add.params, vec!["a", "b"]);
        assert!(add.callable);
        assert!(add.declaration.starts_with("export function add"));

        assert!(symbols.symbol("load").unwrap().is_async);
        assert_eq!(symbols.symbol("helper").unwrap().kind, SymbolKind::Function);
        assert_eq!(symbols.symbol("twice").unwrap().arity, 1);

        let version = symbols.symbol("VERSION").unwrap();
        assert_eq!(version.kind, SymbolKind::Export);
        assert!(!version.callable);

        let store = symbols.symbol("Store").unwrap();
        assert_eq!(store.kind, SymbolKind::Export);
        assert_eq!(store.arity, 2);

        assert_eq!(symbols.imports.len(), 1);
        assert_eq!(symbols.imports[0].specifier, "./format.js");
        assert_eq!(symbols.imports[0].names, vec!["format"]);
    }

    #[test]
    fn test_commonjs_exports_and_require() {
        let symbols = parse(
            r#"
const path = require('path');
const { add } = require('./util');

function sum(values) {
  return values.reduce((acc, v) => add(acc, v), 0);
}

exports.mean = function (values) {
  return sum(values) / values.length;
};

module.exports = { sum };
"#,
        );

        assert_eq!(symbols.symbol("sum").unwrap().kind, SymbolKind::Export);
        let mean = symbols.symbol("mean").unwrap();
        assert_eq!(mean.kind, SymbolKind::Export);
        assert_eq!(mean.arity, 1);

        let specifiers: Vec<_> = symbols.imports.iter().map(|i| i.specifier.as_str()).collect();
        assert_eq!(specifiers, vec!["path", "./util"]);
    }

    #[test]
    fn test_calls_and_free_identifiers() {
        let symbols = parse(
            r#"
import { add } from './util.js';

function main() {
  console.log(add(1, 2));
}

main();
"#,
        );

        let add_call = symbols.calls.iter().find(|c| c.name == "add").unwrap();
        assert_eq!(add_call.arity, 2);
        assert_eq!(add_call.line, 5);

        assert!(symbols.uses("add"));
        assert!(symbols.identifiers.contains("console"));
        // Declared here, so not free
        assert!(!symbols.identifiers.contains("main"));
    }

    #[test]
    fn test_member_calls_and_local_bindings_are_not_free() {
        let symbols = parse(
            r#"
import { sub } from './util.js';

console.log(sub(3, 1));

function f(add, { scale = mul }) {
  const inner = () => add;
  try {
    inner();
  } catch (err) {
    report(err);
  }
  for (const item of items) {
    item.run();
  }
  return scale;
}
"#,
        );

        let log = symbols.calls.iter().find(|c| c.name == "log").unwrap();
        assert!(log.member);
        assert!(!symbols.uses("log"));
        assert!(symbols.calls_member("log"));

        for bound in ["add", "scale", "inner", "err", "item"] {
            assert!(!symbols.uses(bound), "{} is bound locally", bound);
        }
        assert!(symbols.calls.iter().all(|c| c.name != "inner"));

        // Defaults, callees and loop sources still read outer names
        assert!(symbols.uses("sub"));
        assert!(symbols.uses("mul"));
        assert!(symbols.uses("report"));
        assert!(symbols.uses("items"));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let err = JavaScriptParser::new()
            .parse("export function add(a, b {\n", Path::new("broken.js"))
            .unwrap_err();
        assert!(err.reason.contains("syntax error"));
    }
}
