mod parser;
mod graph;
mod differ;
mod impact;
mod issues;
mod validator;
mod protector;
mod lessons;
mod events;
mod scheduler;
mod pipeline;

pub mod fixes;
pub mod llm;

// Language-specific parsers
mod languages;

pub use parser::{
    content_hash, contains_word, CallSite, DocReference, DocReferences, Heading, Import,
    ParseResult, ParsedContent, ReferenceKind, SourceParser, SourceSpan, SourceSymbols, Symbol,
    SymbolKind, STALE_MARKER,
};
pub use graph::{GraphStats, NodeKind, ProjectGraph, ProjectNode};
pub use differ::{ChangeDetector, ChangeSet, ModifiedSymbol};
pub use impact::{ChangeKind, CriticalChange, ImpactAnalyzer, ImpactReport};
pub use issues::{
    technology_of, ApiContractRule, BreakingChangeRule, DetectionContext, DetectionRule, Evidence,
    Issue, IssueDetector, IssueKind, IssueSubject, OutdatedDocRule, Severity,
};
pub use validator::{DocValidator, ValidationResult};
pub use protector::{EditProtector, ProtectedRegion};
pub use lessons::{
    JsonlLessonStore, Lesson, LessonBook, LessonStore, MemoryLessonStore, Outcome, ScoredLesson,
};
pub use events::{ChannelSink, EventSink, FileEvent, PipelineEvent, PipelineState, TracingSink};
pub use scheduler::{CancelToken, SweepControl, SweepScheduler};
pub use pipeline::{Collaborators, PendingFix, Pipeline, Resolution, RunSummary, SweepReport};

pub use languages::LanguageParser;
