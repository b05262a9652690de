use std::collections::BTreeSet;
use std::path::Path;

use tree_sitter::{Node, Parser};

use super::{count_arguments, first_error_line, node_text, span_of, unquote, LanguageParser};
use crate::core::parser::{CallSite, Import, SourceSymbols, Symbol, SymbolKind};
use crate::error::ParseError;

/// Python-specific parser using Tree-sitter
pub struct PythonParser;

impl PythonParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PythonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageParser for PythonParser {
    fn parse(&self, content: &str, file_path: &Path) -> Result<SourceSymbols, ParseError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::language())
            .map_err(|e| {
                ParseError::new(file_path, format!("failed to set Python language: {}", e))
            })?;

        let tree = parser
            .parse(content, None)
            .ok_or_else(|| ParseError::new(file_path, "failed to parse Python code"))?;
        let root = tree.root_node();

        if root.has_error() {
            let line = first_error_line(root).unwrap_or(1);
            return Err(ParseError::new(
                file_path,
                format!("syntax error near line {}", line),
            ));
        }

        let mut result = SourceSymbols::default();
        let mut exported = BTreeSet::new();
        let mut declared = BTreeSet::new();

        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            match child.kind() {
                "function_definition" | "class_definition" => {
                    if let Some(symbol) = definition_symbol(child, child, content) {
                        result.symbols.push(symbol);
                    }
                }
                "decorated_definition" => {
                    if let Some(definition) = child.child_by_field_name("definition") {
                        if let Some(symbol) = definition_symbol(definition, child, content) {
                            result.symbols.push(symbol);
                        }
                    }
                }
                "import_statement" => result.imports.extend(plain_imports(child, content)),
                "import_from_statement" => {
                    if let Some(import) = from_import(child, content) {
                        result.imports.push(import);
                    }
                }
                "expression_statement" => {
                    visit_assignment(child, content, &mut result, &mut exported, &mut declared)
                }
                _ => {}
            }
        }

        for symbol in result.symbols.iter_mut() {
            if exported.contains(&symbol.name) {
                symbol.kind = SymbolKind::Export;
            }
        }

        collect_uses(root, content, &mut result);
        for name in declared.iter() {
            result.identifiers.remove(name);
        }
        let defined: Vec<String> = result.symbols.iter().map(|s| s.name.clone()).collect();
        for name in defined {
            result.identifiers.remove(&name);
        }

        Ok(result)
    }

    fn file_extensions(&self) -> &[&str] {
        &["py"]
    }

    fn language_name(&self) -> &str {
        "python"
    }
}

/// Convert a Python module path into a path-like import specifier.
///
/// `.util` becomes `./util`, `..pkg.mod` becomes `../pkg/mod` and a bare
/// `pkg.mod` becomes `pkg/mod`. The flag is true for bare modules.
pub(crate) fn module_to_specifier(module: &str) -> (String, bool) {
    let dots = module.chars().take_while(|c| *c == '.').count();
    let rest = module[dots..].replace('.', "/");

    if dots == 0 {
        return (rest, true);
    }

    let mut prefix = if dots == 1 {
        "./".to_string()
    } else {
        "../".repeat(dots - 1)
    };
    if rest.is_empty() {
        prefix.push_str("__init__");
    } else {
        prefix.push_str(&rest);
    }
    (prefix, false)
}

/// `definition` is the def/class node, `outer` includes its decorators
fn definition_symbol(definition: Node, outer: Node, source: &str) -> Option<Symbol> {
    let name = node_text(definition.child_by_field_name("name")?, source);

    let (kind, params, callable) = if definition.kind() == "class_definition" {
        let params = init_params(definition, source);
        (SymbolKind::Class, params, false)
    } else {
        let params = definition
            .child_by_field_name("parameters")
            .map(|p| parameter_names(p, source))
            .unwrap_or_default();
        (SymbolKind::Function, params, true)
    };

    let is_async = {
        let mut cursor = definition.walk();
        let found = definition.children(&mut cursor).any(|c| c.kind() == "async");
        found
    };

    Some(Symbol {
        name,
        kind,
        arity: params.len(),
        params,
        is_async,
        callable,
        span: span_of(outer),
        declaration: node_text(outer, source),
    })
}

fn parameter_names(parameters: Node, source: &str) -> Vec<String> {
    let mut cursor = parameters.walk();
    let names = parameters
        .named_children(&mut cursor)
        .filter(|p| {
            !matches!(
                p.kind(),
                "comment" | "keyword_separator" | "positional_separator"
            )
        })
        .map(|p| parameter_name(p, source))
        .collect();
    names
}

fn parameter_name(parameter: Node, source: &str) -> String {
    if parameter.kind() == "identifier" {
        return node_text(parameter, source);
    }
    if let Some(name) = parameter.child_by_field_name("name") {
        return node_text(name, source);
    }
    let mut cursor = parameter.walk();
    let first = parameter
        .named_children(&mut cursor)
        .find(|c| c.kind() == "identifier")
        .map(|c| node_text(c, source));
    first.unwrap_or_else(|| node_text(parameter, source))
}

/// Constructor parameters of a class, without `self`
fn init_params(class: Node, source: &str) -> Vec<String> {
    let Some(body) = class.child_by_field_name("body") else {
        return vec![];
    };
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        let function = if member.kind() == "decorated_definition" {
            match member.child_by_field_name("definition") {
                Some(definition) => definition,
                None => continue,
            }
        } else {
            member
        };
        if function.kind() != "function_definition" {
            continue;
        }
        let is_init = function
            .child_by_field_name("name")
            .map_or(false, |n| node_text(n, source) == "__init__");
        if is_init {
            let mut params = function
                .child_by_field_name("parameters")
                .map(|p| parameter_names(p, source))
                .unwrap_or_default();
            if params.first().map_or(false, |p| p == "self") {
                params.remove(0);
            }
            return params;
        }
    }
    vec![]
}

/// `import a.b, c as d`
fn plain_imports(node: Node, source: &str) -> Vec<Import> {
    let line = node.start_position().row + 1;
    let mut cursor = node.walk();
    let imports = node
        .children_by_field_name("name", &mut cursor)
        .filter_map(|name| {
            let module = match name.kind() {
                "dotted_name" => node_text(name, source),
                "aliased_import" => node_text(name.child_by_field_name("name")?, source),
                _ => return None,
            };
            let (specifier, bare_is_local) = module_to_specifier(&module);
            Some(Import {
                specifier,
                names: vec!["*".to_string()],
                line,
                bare_is_local,
            })
        })
        .collect();
    imports
}

/// `from .util import add, sub as s`
fn from_import(node: Node, source: &str) -> Option<Import> {
    let module = node_text(node.child_by_field_name("module_name")?, source);
    let (specifier, bare_is_local) = module_to_specifier(&module);

    let mut names = Vec::new();
    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        match name.kind() {
            "dotted_name" => names.push(node_text(name, source)),
            "aliased_import" => {
                if let Some(original) = name.child_by_field_name("name") {
                    names.push(node_text(original, source));
                }
            }
            _ => {}
        }
    }
    let mut cursor = node.walk();
    if node
        .named_children(&mut cursor)
        .any(|c| c.kind() == "wildcard_import")
    {
        names.push("*".to_string());
    }

    Some(Import {
        specifier,
        names,
        line: node.start_position().row + 1,
        bare_is_local,
    })
}

/// Top-level assignments: `__all__`, lambdas and plain constants
fn visit_assignment(
    statement: Node,
    source: &str,
    result: &mut SourceSymbols,
    exported: &mut BTreeSet<String>,
    declared: &mut BTreeSet<String>,
) {
    let Some(assignment) = statement.named_child(0) else {
        return;
    };
    if assignment.kind() != "assignment" {
        return;
    }
    let Some(left) = assignment.child_by_field_name("left") else {
        return;
    };
    if left.kind() != "identifier" {
        return;
    }
    let name = node_text(left, source);
    let right = assignment.child_by_field_name("right");

    if name == "__all__" {
        if let Some(list) = right {
            let mut cursor = list.walk();
            for item in list.named_children(&mut cursor) {
                if item.kind() == "string" {
                    exported.insert(unquote(&node_text(item, source)));
                }
            }
        }
        return;
    }

    match right {
        Some(lambda) if lambda.kind() == "lambda" => {
            let params = lambda
                .child_by_field_name("parameters")
                .map(|p| parameter_names(p, source))
                .unwrap_or_default();
            result.symbols.push(Symbol {
                name,
                kind: SymbolKind::Function,
                arity: params.len(),
                params,
                is_async: false,
                callable: true,
                span: span_of(statement),
                declaration: node_text(statement, source),
            });
        }
        _ => {
            declared.insert(name);
        }
    }
}

/// Walk the whole tree for call sites and free identifier uses
fn collect_uses(root: Node, source: &str, result: &mut SourceSymbols) {
    let mut scopes = Vec::new();
    walk_uses(root, source, &mut scopes, result);
    result.calls.sort_by(|a, b| a.line.cmp(&b.line).then_with(|| a.name.cmp(&b.name)));
}

fn walk_uses(
    node: Node,
    source: &str,
    scopes: &mut Vec<BTreeSet<String>>,
    result: &mut SourceSymbols,
) {
    match node.kind() {
        // Bindings, tracked by the top-level pass
        "import_statement" | "import_from_statement" => return,
        "call" => {
            let function = node.child_by_field_name("function");
            let member = function.map_or(false, |f| f.kind() == "attribute");
            let name = function.and_then(|f| match f.kind() {
                "identifier" => Some(node_text(f, source)),
                "attribute" => f
                    .child_by_field_name("attribute")
                    .map(|a| node_text(a, source)),
                _ => None,
            });
            let arity = node
                .child_by_field_name("arguments")
                .map(|a| {
                    if a.kind() == "argument_list" {
                        count_arguments(a)
                    } else {
                        1
                    }
                })
                .unwrap_or(0);
            if let Some(name) = name {
                if member || !is_bound(scopes, &name) {
                    result.calls.push(CallSite {
                        name,
                        arity,
                        line: node.start_position().row + 1,
                        member,
                    });
                }
            }
        }
        "identifier" => {
            let name = node_text(node, source);
            if !is_bound(scopes, &name) {
                result.identifiers.insert(name);
            }
        }
        // `obj.attr` reads `obj` only; `f(key=v)` reads `v` only
        "attribute" => {
            if let Some(object) = node.child_by_field_name("object") {
                walk_uses(object, source, scopes, result);
            }
            return;
        }
        "keyword_argument" => {
            if let Some(value) = node.child_by_field_name("value") {
                walk_uses(value, source, scopes, result);
            }
            return;
        }
        _ => {}
    }

    let scope = match node.kind() {
        "function_definition" | "lambda" => function_locals(node, source),
        _ => BTreeSet::new(),
    };
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

fn is_bound(scopes: &[BTreeSet<String>], name: &str) -> bool {
    scopes.iter().any(|scope| scope.contains(name))
}

/// Parameters of a function or lambda plus every name its body assigns
fn function_locals(function: Node, source: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if let Some(parameters) = function.child_by_field_name("parameters") {
        let mut cursor = parameters.walk();
        for parameter in parameters.named_children(&mut cursor) {
            bound_parameter_names(parameter, source, &mut names);
        }
    }
    if function.kind() == "function_definition" {
        if let Some(body) = function.child_by_field_name("body") {
            assigned_names(body, source, &mut names);
        }
    }
    names
}

fn bound_parameter_names(parameter: Node, source: &str, names: &mut BTreeSet<String>) {
    match parameter.kind() {
        "identifier" => {
            names.insert(node_text(parameter, source));
        }
        "default_parameter" | "typed_default_parameter" => {
            if let Some(name) = parameter.child_by_field_name("name") {
                bound_parameter_names(name, source, names);
            }
        }
        "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern" | "tuple_pattern" => {
            let mut cursor = parameter.walk();
            for child in parameter.named_children(&mut cursor) {
                if child.kind() != "type" {
                    bound_parameter_names(child, source, names);
                }
            }
        }
        _ => {}
    }
}

/// Names bound in a function body, stopping at nested scopes
fn assigned_names(node: Node, source: &str, names: &mut BTreeSet<String>) {
    match node.kind() {
        "function_definition" | "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                names.insert(node_text(name, source));
            }
            return;
        }
        "lambda" => return,
        "assignment" | "augmented_assignment" | "for_statement" => {
            if let Some(left) = node.child_by_field_name("left") {
                target_names(left, source, names);
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        assigned_names(child, source, names);
    }
}

fn target_names(target: Node, source: &str, names: &mut BTreeSet<String>) {
    match target.kind() {
        "identifier" => {
            names.insert(node_text(target, source));
        }
        "pattern_list" | "tuple_pattern" | "list_pattern" | "list_splat_pattern" => {
            let mut cursor = target.walk();
            for child in target.named_children(&mut cursor) {
                target_names(child, source, names);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> SourceSymbols {
        PythonParser::new()
            .parse(source, Path::new("test.py"))
            .unwrap()
    }

    #[test]
    fn test_definitions() {
        let symbols = parse(
            r#"
from .util import add, scale as s
import numpy as np

__all__ = ["solve", "Solver"]

def solve(equation, variable="x"):
    return add(equation, variable)

async def fetch_problem(problem_id):
    pass

class Solver:
    def __init__(self, strategy, limit):
        self.strategy = strategy

square = lambda x: x * x

@cached
def _internal(x, *args, **kwargs):
    return s(x)
"#,
        );

        let solve = symbols.symbol("solve").unwrap();
        assert_eq!(solve.kind, SymbolKind::Export);
        assert_eq!(solve.params, vec!["equation", "variable"]);

        assert!(symbols.symbol("fetch_problem").unwrap().is_async);
        assert_eq!(symbols.symbol("fetch_problem").unwrap().kind, SymbolKind::Function);

        let solver = symbols.symbol("Solver").unwrap();
        assert_eq!(solver.kind, SymbolKind::Export);
        assert_eq!(solver.arity, 2);

        assert_eq!(symbols.symbol("square").unwrap().arity, 1);

        let internal = symbols.symbol("_internal").unwrap();
        assert_eq!(internal.arity, 3);
        assert!(internal.declaration.starts_with("@cached"));

        assert_eq!(symbols.imports[0].specifier, "./util");
        assert_eq!(symbols.imports[0].names, vec!["add", "scale"]);
        assert!(!symbols.imports[0].bare_is_local);
        assert_eq!(symbols.imports[1].specifier, "numpy");
        assert!(symbols.imports[1].bare_is_local);

        assert!(symbols.uses("add"));
        assert!(!symbols.identifiers.contains("solve"));
    }

    #[test]
    fn test_attribute_calls_and_locals_are_not_free() {
        let symbols = parse(
            r#"
import util
from .shapes import area

def report(add, scale=default_scale):
    total = add + scale
    for item in items:
        log.info(item)
    return util.mul(total, key=area(2))
"#,
        );

        let mul = symbols.calls.iter().find(|c| c.name == "mul").unwrap();
        assert!(mul.member);
        assert!(!symbols.uses("mul"));
        assert!(!symbols.uses("info"));
        assert!(symbols.calls_member("mul"));

        for bound in ["add", "scale", "total", "item", "key"] {
            assert!(!symbols.uses(bound), "{} is bound locally", bound);
        }
        assert!(symbols.uses("area"));
        assert!(symbols.uses("default_scale"));
        assert!(symbols.uses("items"));
        assert!(symbols.uses("util"));
    }

    #[test]
    fn test_module_to_specifier() {
        assert_eq!(module_to_specifier(".util"), ("./util".to_string(), false));
        assert_eq!(module_to_specifier("..pkg.mod"), ("../pkg/mod".to_string(), false));
        assert_eq!(module_to_specifier("."), ("./__init__".to_string(), false));
        assert_eq!(module_to_specifier("pkg.mod"), ("pkg/mod".to_string(), true));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let err = PythonParser::new()
            .parse("def broken(:\n    pass\n", Path::new("broken.py"))
            .unwrap_err();
        assert!(err.reason.contains("syntax error"));
    }
}
