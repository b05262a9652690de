use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::differ::ChangeSet;
use super::graph::ProjectGraph;
use super::parser::{Symbol, SymbolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Removed,
    Modified,
}

/// A removed or modified symbol that other files rely on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalChange {
    pub symbol_name: String,
    pub kind: ChangeKind,
    pub symbol_kind: SymbolKind,
    /// Direct dependents that refer to the symbol
    pub affected_paths: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub origin: PathBuf,
    /// One `dependents` edge away from the origin
    pub direct: BTreeSet<PathBuf>,
    /// Reachable through more than one edge
    pub indirect: BTreeSet<PathBuf>,
    pub critical: Vec<CriticalChange>,
}

impl ImpactReport {
    pub fn affects(&self, path: &Path) -> bool {
        self.direct.contains(path) || self.indirect.contains(path)
    }
}

/// Breadth-first walk over `dependents` edges
pub struct ImpactAnalyzer;

impl ImpactAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, graph: &ProjectGraph, changed: &Path, changes: &ChangeSet) -> ImpactReport {
        let mut report = ImpactReport {
            origin: changed.to_path_buf(),
            ..Default::default()
        };

        let Some(origin) = graph.get(changed) else {
            return report;
        };

        let mut visited: HashSet<PathBuf> = HashSet::new();
        visited.insert(origin.path.clone());
        let mut queue: VecDeque<(PathBuf, usize)> = VecDeque::new();

        for dependent in &origin.dependents {
            if visited.insert(dependent.clone()) {
                report.direct.insert(dependent.clone());
                queue.push_back((dependent.clone(), 1));
            }
        }

        while let Some((path, depth)) = queue.pop_front() {
            let Some(node) = graph.get(&path) else {
                continue;
            };
            for dependent in &node.dependents {
                if visited.insert(dependent.clone()) {
                    report.indirect.insert(dependent.clone());
                    queue.push_back((dependent.clone(), depth + 1));
                }
            }
        }

        let removed = changes
            .removed_symbols
            .iter()
            .map(|s| (s, ChangeKind::Removed));
        let modified = changes
            .modified_symbols
            .iter()
            .map(|m| (&m.old, ChangeKind::Modified));

        for (symbol, kind) in removed.chain(modified) {
            let critical = critical_change(graph, &origin.path, &report.direct, symbol, kind);
            if let Some(critical) = critical {
                report.critical.push(critical);
            }
        }

        report
    }
}

impl Default for ImpactAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Exports are always critical; other symbols only when a direct dependent refers to them
fn critical_change(
    graph: &ProjectGraph,
    origin: &Path,
    direct: &BTreeSet<PathBuf>,
    symbol: &Symbol,
    kind: ChangeKind,
) -> Option<CriticalChange> {
    let affected_paths: BTreeSet<PathBuf> = direct
        .iter()
        .filter(|path| graph.refers_to(path, origin, &symbol.name))
        .cloned()
        .collect();

    if symbol.kind != SymbolKind::Export && affected_paths.is_empty() {
        return None;
    }

    Some(CriticalChange {
        symbol_name: symbol.name.clone(),
        kind,
        symbol_kind: symbol.kind,
        affected_paths,
    })
}
