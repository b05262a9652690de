use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::parser::{DocReferences, ParseResult, ParsedContent, SourceParser, SourceSymbols, Symbol};
use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    SourceFile,
    DocFile,
}

/// One tracked file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectNode {
    /// Path relative to the project root
    pub path: PathBuf,
    pub kind: NodeKind,
    pub language: String,
    pub content_hash: String,
    pub parsed: ParsedContent,
    /// Nodes this node imports
    pub dependencies: BTreeSet<PathBuf>,
    /// Nodes importing this node; always the transpose of `dependencies`
    pub dependents: BTreeSet<PathBuf>,
    pub last_modified: DateTime<Utc>,
}

impl ProjectNode {
    pub fn source(&self) -> Option<&SourceSymbols> {
        match &self.parsed {
            ParsedContent::Source(source) => Some(source),
            ParsedContent::Doc(_) => None,
        }
    }

    pub fn doc(&self) -> Option<&DocReferences> {
        match &self.parsed {
            ParsedContent::Doc(doc) => Some(doc),
            ParsedContent::Source(_) => None,
        }
    }

    pub fn symbols(&self) -> &[Symbol] {
        self.source().map_or(&[], |s| &s.symbols)
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols().iter().find(|s| s.name == name)
    }

    /// Whether this node refers to `name`: a free identifier in source, a code reference in docs
    pub fn mentions(&self, name: &str) -> bool {
        match &self.parsed {
            ParsedContent::Source(source) => source.uses(name),
            ParsedContent::Doc(doc) => doc.mentioning(name).next().is_some(),
        }
    }

    /// Import specifiers that may produce edges, with whether bare names are local
    fn import_specifiers(&self) -> Vec<(&str, bool)> {
        match &self.parsed {
            ParsedContent::Source(source) => source
                .imports
                .iter()
                .map(|i| (i.specifier.as_str(), i.bare_is_local))
                .collect(),
            ParsedContent::Doc(doc) => doc
                .of_kind(super::parser::ReferenceKind::ImportMention)
                .map(|r| {
                    let python = matches!(r.language.as_deref(), Some("py") | Some("python"));
                    (r.content.as_str(), python)
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub source_nodes: usize,
    pub doc_nodes: usize,
    pub edges: usize,
    /// Local-looking imports that resolve to no tracked file
    pub dangling_imports: usize,
}

/// File-level dependency graph keyed by relative path
#[derive(Debug, Clone)]
pub struct ProjectGraph {
    root: PathBuf,
    resolve_extensions: Vec<String>,
    nodes: BTreeMap<PathBuf, ProjectNode>,
    dangling_imports: usize,
}

impl ProjectGraph {
    pub fn new(root: impl Into<PathBuf>, resolve_extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            resolve_extensions,
            nodes: BTreeMap::new(),
            dangling_imports: 0,
        }
    }

    /// Build the graph by parsing every supported file under `root`
    pub fn scan(root: &Path, parser: &SourceParser, config: &Config) -> Result<Self> {
        let mut graph = Self::new(root, config.parsing.resolve_extensions.clone());
        let ignore_dirs = config.project.ignore_dirs.clone();

        // Use ignore crate to respect .gitignore and custom patterns
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
                !(is_dir
                    && ignore_dirs
                        .iter()
                        .any(|d| entry.file_name().to_string_lossy() == d.as_str()))
            })
            .build();

        let mut failed = 0;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() || !parser.handles(path) {
                continue;
            }

            let relative = graph.relative_path(path);
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    failed += 1;
                    continue;
                }
            };

            match parser.parse(&relative, &content) {
                Ok(result) => graph.insert_node(result),
                Err(e) => {
                    warn!("Skipping unparseable file {}", e);
                    failed += 1;
                }
            }
        }

        graph.rebuild_edges();

        let stats = graph.stats();
        info!(
            "📊 Scanned {}: {} nodes ({} source, {} docs), {} edges, {} skipped",
            root.display(),
            stats.nodes,
            stats.source_nodes,
            stats.doc_nodes,
            stats.edges,
            failed
        );

        Ok(graph)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to the graph root; paths outside the root are returned as-is
    pub fn relative_path(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        normalize(relative).unwrap_or_else(|| relative.to_path_buf())
    }

    pub fn absolute_path(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    pub fn get(&self, path: &Path) -> Option<&ProjectNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProjectNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All `(dependent, dependency)` pairs
    pub fn edges(&self) -> BTreeSet<(PathBuf, PathBuf)> {
        self.nodes
            .values()
            .flat_map(|n| n.dependencies.iter().map(move |d| (n.path.clone(), d.clone())))
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let source_nodes = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::SourceFile)
            .count();
        GraphStats {
            nodes: self.nodes.len(),
            source_nodes,
            doc_nodes: self.nodes.len() - source_nodes,
            edges: self.nodes.values().map(|n| n.dependencies.len()).sum(),
            dangling_imports: self.dangling_imports,
        }
    }

    /// Replace a node's parsed data and recompute the edge set
    pub fn upsert(&mut self, result: ParseResult) {
        debug!("Upserting node {}", result.path.display());
        self.insert_node(result);
        self.rebuild_edges();
    }

    /// Delete a node and scrub it from every neighbour
    pub fn remove(&mut self, path: &Path) -> Option<ProjectNode> {
        let removed = self.nodes.remove(path)?;
        for node in self.nodes.values_mut() {
            node.dependencies.remove(path);
            node.dependents.remove(path);
        }
        debug!("Removed node {}", path.display());
        Some(removed)
    }

    /// Whether `dependent` refers to `name` defined in `origin`.
    ///
    /// Source files must reach the name through one of their imports of
    /// `origin`: by naming it, or through a namespace, default or `require`
    /// binding that the file then uses or calls a member of. Docs refer to a
    /// name whenever they mention it in code.
    pub fn refers_to(&self, dependent: &Path, origin: &Path, name: &str) -> bool {
        let Some(node) = self.get(dependent) else {
            return false;
        };
        let Some(source) = node.source() else {
            return node.mentions(name);
        };

        source
            .imports
            .iter()
            .filter(|i| {
                self.resolve(dependent, &i.specifier, i.bare_is_local).as_deref() == Some(origin)
            })
            .any(|import| {
                if import.names.iter().any(|n| n == name) {
                    return true;
                }
                let whole_module = import.names.iter().any(|n| n == "*" || n == "default");
                whole_module && (source.uses(name) || source.calls_member(name))
            })
    }

    /// Resolve an import specifier written in `from` to a tracked node
    pub fn resolve(&self, from: &Path, specifier: &str, bare_is_local: bool) -> Option<PathBuf> {
        let dir = from.parent().unwrap_or_else(|| Path::new(""));

        let bases = if specifier == "."
            || specifier == ".."
            || specifier.starts_with("./")
            || specifier.starts_with("../")
        {
            vec![dir.join(specifier)]
        } else if let Some(absolute) = specifier.strip_prefix('/') {
            vec![PathBuf::from(absolute)]
        } else if bare_is_local {
            vec![dir.join(specifier), PathBuf::from(specifier)]
        } else {
            // Package import
            return None;
        };

        for base in bases {
            let Some(base) = normalize(&base) else {
                continue;
            };
            if self.nodes.contains_key(&base) {
                return Some(base);
            }
            let stem = base.to_string_lossy();
            for extension in &self.resolve_extensions {
                let candidate = PathBuf::from(format!("{}{}", stem, extension));
                if let Some(candidate) = normalize(&candidate) {
                    if self.nodes.contains_key(&candidate) {
                        return Some(candidate);
                    }
                }
            }
        }

        None
    }

    fn insert_node(&mut self, result: ParseResult) {
        let kind = match result.content {
            ParsedContent::Source(_) => NodeKind::SourceFile,
            ParsedContent::Doc(_) => NodeKind::DocFile,
        };
        let node = ProjectNode {
            path: result.path.clone(),
            kind,
            language: result.language,
            content_hash: result.content_hash,
            parsed: result.content,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            last_modified: Utc::now(),
        };
        self.nodes.insert(result.path, node);
    }

    /// Recompute every edge from the nodes' imports. Both directions are
    /// written in the same pass, so `dependents` stays the transpose of
    /// `dependencies`.
    fn rebuild_edges(&mut self) {
        let mut dependencies: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
        let mut dangling = 0;

        for node in self.nodes.values() {
            let mut targets = BTreeSet::new();
            for (specifier, bare_is_local) in node.import_specifiers() {
                match self.resolve(&node.path, specifier, bare_is_local) {
                    Some(target) if target != node.path => {
                        targets.insert(target);
                    }
                    Some(_) => {}
                    None => {
                        if bare_is_local || specifier.starts_with('.') || specifier.starts_with('/')
                        {
                            dangling += 1;
                        }
                    }
                }
            }
            dependencies.insert(node.path.clone(), targets);
        }

        for node in self.nodes.values_mut() {
            node.dependencies = dependencies.remove(&node.path).unwrap_or_default();
            node.dependents.clear();
        }

        let edges = self.edges();
        for (dependent, dependency) in edges {
            if let Some(node) = self.nodes.get_mut(&dependency) {
                node.dependents.insert(dependent);
            }
        }

        self.dangling_imports = dangling;
    }
}

/// Lexically normalize a relative path. Returns None when it escapes the root.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part),
        }
    }
    Some(parts.iter().collect())
}
