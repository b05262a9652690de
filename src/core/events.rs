use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::fixes::{AppliedFix, Fix};
use super::issues::Issue;
use super::lessons::Lesson;
use crate::error::ParseError;

/// A filesystem notification delivered by the host's watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Changed(PathBuf),
    Added(PathBuf),
    Removed(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Changed(path) | FileEvent::Added(path) | FileEvent::Removed(path) => path,
        }
    }
}

/// Per-file pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Parsing,
    Diffing,
    ImpactAnalysis,
    IssueDetection,
    FixPlanning,
    Applying,
    Verifying,
    RolledBack,
    QueuedForReview,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged { path: PathBuf, state: PipelineState },
    IssueDetected(Issue),
    FixApplied(AppliedFix),
    FixQueued { issue: Issue, fix: Fix },
    FixRolledBack { fix: Fix, reason: String },
    FixFailed { fix: Fix, reason: String },
    LessonRecorded(Lesson),
    ParseFailed(ParseError),
    NodeRemoved(PathBuf),
    SweepFinished { checked: usize, issues: usize, cancelled: bool },
}

/// Receives everything the pipeline reports; documentation writers hang off this
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Forwards events to an unbounded channel
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PipelineEvent) {
        // A dropped receiver only means nobody is listening any more
        let _ = self.sender.send(event);
    }
}

/// Renders events as log lines
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::StateChanged { path, state } => {
                debug!("{} -> {:?}", path.display(), state)
            }
            PipelineEvent::IssueDetected(issue) => warn!(
                "🔎 {} [{:?}] {}: {}",
                issue.kind,
                issue.severity,
                issue.path.display(),
                issue.message
            ),
            PipelineEvent::FixApplied(applied) if applied.changed => {
                info!("✅ {}", applied.fix.summary())
            }
            PipelineEvent::FixApplied(applied) => {
                debug!("{} was already in place", applied.fix.id)
            }
            PipelineEvent::FixQueued { fix, .. } => info!(
                "📝 Queued {} for review (confidence {:.2}): {}",
                fix.id,
                fix.confidence,
                fix.summary()
            ),
            PipelineEvent::FixRolledBack { fix, reason } => {
                warn!("↩️ Rolled back {}: {}", fix.id, reason)
            }
            PipelineEvent::FixFailed { fix, reason } => error!("❌ {} failed: {}", fix.id, reason),
            PipelineEvent::LessonRecorded(lesson) => {
                debug!("Recorded {} ({:?})", lesson.id, lesson.outcome)
            }
            PipelineEvent::ParseFailed(e) => warn!("⚠️ Keeping previous parse: {}", e),
            PipelineEvent::NodeRemoved(path) => info!("🗑️ Removed {}", path.display()),
            PipelineEvent::SweepFinished {
                checked,
                issues,
                cancelled,
            } => {
                if cancelled {
                    info!("⏭️ Sweep cancelled after {} documents", checked)
                } else {
                    info!("📊 Sweep checked {} documents, {} issues", checked, issues)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut receiver) = ChannelSink::new();
        sink.emit(PipelineEvent::NodeRemoved(PathBuf::from("a.js")));
        sink.emit(PipelineEvent::SweepFinished {
            checked: 2,
            issues: 0,
            cancelled: false,
        });

        assert!(matches!(receiver.recv().await, Some(PipelineEvent::NodeRemoved(p)) if p == Path::new("a.js")));
        assert!(matches!(receiver.recv().await, Some(PipelineEvent::SweepFinished { checked: 2, .. })));
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, receiver) = ChannelSink::new();
        drop(receiver);
        sink.emit(PipelineEvent::NodeRemoved(PathBuf::from("a.js")));
    }

    #[test]
    fn test_file_event_path() {
        assert_eq!(FileEvent::Removed(PathBuf::from("x.py")).path(), Path::new("x.py"));
    }
}
