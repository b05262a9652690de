use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::parser::{content_hash, Symbol};

/// A symbol present before and after a change with a different signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedSymbol {
    pub old: Symbol,
    pub new: Symbol,
}

impl ModifiedSymbol {
    pub fn name(&self) -> &str {
        &self.new.name
    }

    pub fn arity_changed(&self) -> bool {
        self.old.arity != self.new.arity
    }
}

/// Structural difference between two parses of the same file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub path: PathBuf,
    /// In the order they appear in the new parse
    pub added_symbols: Vec<Symbol>,
    /// In the order they appeared in the old parse
    pub removed_symbols: Vec<Symbol>,
    /// Sorted by name
    pub modified_symbols: Vec<ModifiedSymbol>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added_symbols.is_empty()
            && self.removed_symbols.is_empty()
            && self.modified_symbols.is_empty()
    }
}

/// Name-based symbol differ.
///
/// A renamed symbol shows up as one removal plus one addition; there is no
/// attempt to pair them up by signature.
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn diff(&self, path: impl Into<PathBuf>, old: &[Symbol], new: &[Symbol]) -> ChangeSet {
        let old_by_name = first_by_name(old);
        let new_by_name = first_by_name(new);

        let added_symbols = unique(new)
            .filter(|s| !old_by_name.contains_key(s.name.as_str()))
            .cloned()
            .collect();

        let removed_symbols = unique(old)
            .filter(|s| !new_by_name.contains_key(s.name.as_str()))
            .cloned()
            .collect();

        let mut modified_symbols: Vec<ModifiedSymbol> = unique(old)
            .filter_map(|before| {
                let after = new_by_name.get(before.name.as_str())?;
                if before.same_signature(after) {
                    None
                } else {
                    Some(ModifiedSymbol {
                        old: before.clone(),
                        new: (*after).clone(),
                    })
                }
            })
            .collect();
        modified_symbols.sort_by(|a, b| a.name().cmp(b.name()));

        ChangeSet {
            path: path.into(),
            added_symbols,
            removed_symbols,
            modified_symbols,
        }
    }

    /// Whether `content` differs from the content that produced `expected_hash`
    pub fn has_content_changed(&self, expected_hash: &str, content: &str) -> bool {
        content_hash(content) != expected_hash
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Duplicate names keep their first occurrence
fn first_by_name(symbols: &[Symbol]) -> HashMap<&str, &Symbol> {
    let mut map = HashMap::new();
    for symbol in symbols {
        map.entry(symbol.name.as_str()).or_insert(symbol);
    }
    map
}

fn unique(symbols: &[Symbol]) -> impl Iterator<Item = &Symbol> {
    symbols
        .iter()
        .enumerate()
        .filter(move |(i, s)| !symbols[..*i].iter().any(|earlier| earlier.name == s.name))
        .map(|(_, s)| s)
}
