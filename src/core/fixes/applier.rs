use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::{AppliedFix, Fix, Patch};
use crate::core::events::{EventSink, PipelineEvent, PipelineState};
use crate::core::parser::SourceParser;
use crate::core::protector::EditProtector;
use crate::error::ApplyError;

/// Post-write check; an `Err` triggers a rollback
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, path: &Path, content: &str) -> Result<(), String>;
}

/// Re-parses the written file and optionally runs a smoke-check command
pub struct ParseVerifier {
    parser: Arc<SourceParser>,
    root: PathBuf,
    command: Option<Vec<String>>,
    timeout: Duration,
}

impl ParseVerifier {
    pub fn new(
        parser: Arc<SourceParser>,
        root: impl Into<PathBuf>,
        command: Option<Vec<String>>,
        timeout: Duration,
    ) -> Self {
        Self {
            parser,
            root: root.into(),
            command,
            timeout,
        }
    }

    async fn run_command(&self, argv: &[String], path: &Path) -> Result<(), String> {
        let absolute = self.root.join(path);
        let argv: Vec<String> = argv
            .iter()
            .map(|arg| arg.replace("{path}", &absolute.to_string_lossy()))
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };

        let mut command = tokio::process::Command::new(program);
        command.args(args).current_dir(&self.root).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| format!("`{}` timed out after {}s", program, self.timeout.as_secs()))?
            .map_err(|e| format!("failed to run `{}`: {}", program, e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        Err(format!(
            "`{}` exited with {}: {}",
            program,
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        ))
    }
}

#[async_trait]
impl Verifier for ParseVerifier {
    async fn verify(&self, path: &Path, content: &str) -> Result<(), String> {
        if self.parser.handles(path) {
            self.parser
                .parse(path, content)
                .map_err(|e| e.reason)?;
        }
        if let Some(argv) = &self.command {
            self.run_command(argv, path).await?;
        }
        Ok(())
    }
}

/// Writes fixes behind a backup and rolls back on failed verification.
///
/// Fixes for one target run one at a time, from reading the original through
/// verification, whichever pipeline run planned them.
pub struct FixApplier {
    root: PathBuf,
    backup_dir: PathBuf,
    threshold: f32,
    protector: EditProtector,
    verifier: Arc<dyn Verifier>,
    sink: Option<Arc<dyn EventSink>>,
    targets: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FixApplier {
    pub fn new(
        root: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        threshold: f32,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
            threshold,
            protector: EditProtector::new(),
            verifier,
            sink: None,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Report the verification step to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Apply a fix that cleared the confidence gate
    pub async fn apply(&self, fix: &Fix) -> Result<AppliedFix, ApplyError> {
        if fix.confidence < self.threshold {
            return Err(ApplyError::BelowThreshold {
                confidence: fix.confidence,
                threshold: self.threshold,
            });
        }
        self.write_with_backup(fix).await
    }

    /// Apply a fix a human approved, whatever its confidence
    pub async fn apply_approved(&self, fix: &Fix) -> Result<AppliedFix, ApplyError> {
        self.write_with_backup(fix).await
    }

    async fn target_lock(&self, target: &Path) -> Arc<Mutex<()>> {
        let mut targets = self.targets.lock().await;
        targets.entry(target.to_path_buf()).or_default().clone()
    }

    async fn write_with_backup(&self, fix: &Fix) -> Result<AppliedFix, ApplyError> {
        let lock = self.target_lock(&fix.target_path).await;
        let _guard = lock.lock().await;

        let target = self.root.join(&fix.target_path);
        let write_failed = |reason: String| ApplyError::WriteFailed {
            path: fix.target_path.clone(),
            reason,
        };

        let original = tokio::fs::read_to_string(&target)
            .await
            .map_err(|e| write_failed(format!("cannot read target: {}", e)))?;
        let updated = self.patched(&original, &fix.patch).map_err(write_failed)?;

        if updated == original {
            debug!("{} already contains {}", fix.target_path.display(), fix.id);
            return Ok(AppliedFix {
                fix: fix.clone(),
                backup_path: None,
                changed: false,
                applied_at: Utc::now(),
                content: original,
            });
        }

        let backup = self
            .backup(fix, &original)
            .await
            .map_err(|e| write_failed(format!("backup failed, target left untouched: {}", e)))?;
        debug!("Backed up {} to {}", fix.target_path.display(), backup.display());

        if let Err(e) = tokio::fs::write(&target, &updated).await {
            self.rollback(fix, &target, &backup).await?;
            return Err(write_failed(e.to_string()));
        }

        if let Some(sink) = &self.sink {
            sink.emit(PipelineEvent::StateChanged {
                path: fix.target_path.clone(),
                state: PipelineState::Verifying,
            });
        }
        if let Err(reason) = self.verifier.verify(&fix.target_path, &updated).await {
            warn!("⚠️ Verification failed for {}: {}", fix.target_path.display(), reason);
            self.rollback(fix, &target, &backup).await?;
            info!("↩️ Rolled back {}", fix.target_path.display());
            return Err(ApplyError::VerificationFailed {
                path: fix.target_path.clone(),
                reason,
            });
        }

        info!("✅ Applied {}: {}", fix.id, fix.summary());
        Ok(AppliedFix {
            fix: fix.clone(),
            backup_path: Some(backup),
            changed: true,
            applied_at: Utc::now(),
            content: updated,
        })
    }

    fn patched(&self, original: &str, patch: &Patch) -> Result<String, String> {
        match patch {
            Patch::Append(text) => {
                if original.contains(text.trim()) {
                    return Ok(original.to_string());
                }
                let mut updated = original.to_string();
                if !updated.is_empty() && !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push_str(text);
                if !updated.ends_with('\n') {
                    updated.push('\n');
                }
                Ok(updated)
            }
            Patch::Replace(replacements) => {
                let mut updated = original.to_string();
                for replacement in replacements {
                    if updated.contains(&replacement.replace) {
                        continue;
                    }
                    match self.protector.find_unprotected(&updated, &replacement.find) {
                        Some(range) => updated.replace_range(range, &replacement.replace),
                        None if updated.contains(&replacement.find) => {
                            return Err(format!(
                                "`{}` is inside a protected region",
                                replacement.find
                            ))
                        }
                        None => return Err(format!("anchor `{}` not found", replacement.find)),
                    }
                }
                Ok(updated)
            }
        }
    }

    /// Snapshot to `<backup_dir>/<timestamp>-<fix id>/<relative path>`
    async fn backup(&self, fix: &Fix, original: &str) -> std::io::Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let backup = self
            .backup_dir
            .join(format!("{}-{}", stamp, fix.id))
            .join(&fix.target_path);

        if let Some(parent) = backup.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&backup, original).await?;
        Ok(backup)
    }

    async fn rollback(&self, fix: &Fix, target: &Path, backup: &Path) -> Result<(), ApplyError> {
        let restored = match tokio::fs::read(backup).await {
            Ok(content) => tokio::fs::write(target, content).await,
            Err(e) => Err(e),
        };

        restored.map_err(|e| {
            error!(
                "🚨 ROLLBACK FAILED for {} ({}); restore it by hand from {}: {}",
                fix.target_path.display(),
                fix.id,
                backup.display(),
                e
            );
            ApplyError::RollbackFailed {
                path: fix.target_path.clone(),
                backup: backup.to_path_buf(),
                reason: e.to_string(),
            }
        })
    }
}

/// A snapshot found in the backup directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// `<timestamp>-<fix id>` directory name
    pub snapshot: String,
    /// Relative path of the backed-up file
    pub target: PathBuf,
    pub backup_path: PathBuf,
    pub created: Option<DateTime<Utc>>,
}

/// Every backup file under `backup_dir`, newest snapshot first
pub fn list_backups(backup_dir: &Path) -> Vec<BackupEntry> {
    let mut entries: Vec<BackupEntry> = WalkDir::new(backup_dir)
        .min_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let relative = e.path().strip_prefix(backup_dir).ok()?;
            let mut components = relative.components();
            let snapshot = components.next()?.as_os_str().to_string_lossy().to_string();
            let target: PathBuf = components.collect();
            let created = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            Some(BackupEntry {
                snapshot,
                target,
                backup_path: e.path().to_path_buf(),
                created,
            })
        })
        .collect();

    entries.sort_by(|a, b| b.snapshot.cmp(&a.snapshot).then_with(|| a.target.cmp(&b.target)));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParsingConfig, ProjectConfig};
    use crate::core::fixes::{FixAction, FixSource, Replacement};
    use crate::core::issues::{Issue, IssueKind, Severity};
    use tempfile::TempDir;

    struct Rejecting;

    #[async_trait]
    impl Verifier for Rejecting {
        async fn verify(&self, _path: &Path, _content: &str) -> Result<(), String> {
            Err("smoke check failed".to_string())
        }
    }

    fn parse_verifier(root: &Path) -> Arc<dyn Verifier> {
        let parser = Arc::new(SourceParser::new(&ParsingConfig::default(), &ProjectConfig::default()));
        Arc::new(ParseVerifier::new(parser, root, None, Duration::from_secs(5)))
    }

    fn fix(target: &str, patch: Patch, confidence: f32) -> Fix {
        let issue = Issue::new(IssueKind::BreakingChange, Severity::Critical, "main.js", "removed");
        Fix::new(&issue, FixAction::Restore, patch, PathBuf::from(target), confidence, FixSource::Template)
    }

    #[tokio::test]
    async fn test_backup_holds_pre_write_content() {
        let dir = TempDir::new().unwrap();
        let original = "export function sub(a, b) { return a - b; }\n";
        std::fs::write(dir.path().join("util.js"), original).unwrap();

        let applier = FixApplier::new(dir.path(), dir.path().join("backups"), 0.7, parse_verifier(dir.path()));
        let fix = fix(
            "util.js",
            Patch::Append("export function add(a, b) { return a + b; }\n".to_string()),
            0.75,
        );

        let applied = applier.apply(&fix).await.unwrap();
        assert!(applied.changed);
        let backup = applied.backup_path.unwrap();
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), original);
        assert!(std::fs::read_to_string(dir.path().join("util.js"))
            .unwrap()
            .contains("export function add"));

        let listed = list_backups(&dir.path().join("backups"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target, PathBuf::from("util.js"));
        assert!(listed[0].snapshot.ends_with(&fix.id));

        // Applying the same patch again writes nothing
        let again = applier.apply(&fix).await.unwrap();
        assert!(!again.changed);
        assert_eq!(list_backups(&dir.path().join("backups")).len(), 1);
    }

    /// Holds every verification open long enough for other writes to interleave
    struct Slow;

    #[async_trait]
    impl Verifier for Slow {
        async fn verify(&self, _path: &Path, _content: &str) -> Result<(), String> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_fixes_to_one_target_both_land() {
        let dir = TempDir::new().unwrap();
        let original = "# Util\n\nCall `add(a, b)` or `mul(a, b)`.\n";
        std::fs::write(dir.path().join("README.md"), original).unwrap();
        let applier = FixApplier::new(dir.path(), dir.path().join("backups"), 0.7, Arc::new(Slow));

        let add = fix(
            "README.md",
            Patch::Replace(vec![Replacement {
                find: "`add(a, b)`".to_string(),
                replace: "`add(a, b)` <!-- docsmith: stale -->".to_string(),
            }]),
            0.9,
        );
        let mul = fix(
            "README.md",
            Patch::Replace(vec![Replacement {
                find: "`mul(a, b)`".to_string(),
                replace: "`mul(a, b)` <!-- docsmith: stale -->".to_string(),
            }]),
            0.9,
        );

        let (first, second) = tokio::join!(applier.apply(&add), applier.apply(&mul));
        assert!(first.unwrap().changed);
        assert!(second.unwrap().changed);

        let content = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert_eq!(content.matches("<!-- docsmith: stale -->").count(), 2);

        // The later snapshot already holds the earlier annotation
        let mut snapshots: Vec<String> = list_backups(&dir.path().join("backups"))
            .iter()
            .map(|b| std::fs::read_to_string(&b.backup_path).unwrap())
            .collect();
        snapshots.sort_by_key(|s| s.len());
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0], original);
        assert_eq!(snapshots[1].matches("<!-- docsmith: stale -->").count(), 1);
    }

    #[tokio::test]
    async fn test_below_threshold_never_writes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("util.js"), "export const a = 1;\n").unwrap();
        let applier = FixApplier::new(dir.path(), dir.path().join("backups"), 0.7, parse_verifier(dir.path()));

        let err = applier
            .apply(&fix("util.js", Patch::Append("export const b = 2;\n".to_string()), 0.6))
            .await
            .unwrap_err();

        assert!(matches!(err, ApplyError::BelowThreshold { .. }));
        assert_eq!(std::fs::read_to_string(dir.path().join("util.js")).unwrap(), "export const a = 1;\n");
        assert!(!dir.path().join("backups").exists());
    }

    #[tokio::test]
    async fn test_failed_verification_rolls_back() {
        let dir = TempDir::new().unwrap();
        let original = "export const a = 1;\n";
        std::fs::write(dir.path().join("util.js"), original).unwrap();
        let applier = FixApplier::new(dir.path(), dir.path().join("backups"), 0.7, Arc::new(Rejecting));

        let err = applier
            .apply(&fix("util.js", Patch::Append("export const b = 2;\n".to_string()), 0.9))
            .await
            .unwrap_err();

        assert!(matches!(err, ApplyError::VerificationFailed { ref reason, .. } if reason == "smoke check failed"));
        assert_eq!(std::fs::read_to_string(dir.path().join("util.js")).unwrap(), original);
    }

    #[tokio::test]
    async fn test_syntax_error_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let original = "export const a = 1;\n";
        std::fs::write(dir.path().join("util.js"), original).unwrap();
        let applier = FixApplier::new(dir.path(), dir.path().join("backups"), 0.7, parse_verifier(dir.path()));

        let err = applier
            .apply(&fix("util.js", Patch::Append("export function (\n".to_string()), 0.9))
            .await
            .unwrap_err();

        assert!(matches!(err, ApplyError::VerificationFailed { .. }));
        assert_eq!(std::fs::read_to_string(dir.path().join("util.js")).unwrap(), original);
    }

    #[tokio::test]
    async fn test_replace_respects_protected_regions() {
        let dir = TempDir::new().unwrap();
        let doc = "<!-- PROTECTED -->\n`add`\n<!-- /PROTECTED -->\n";
        std::fs::write(dir.path().join("README.md"), doc).unwrap();
        let applier = FixApplier::new(dir.path(), dir.path().join("backups"), 0.7, parse_verifier(dir.path()));

        let patch = Patch::Replace(vec![Replacement {
            find: "`add`".to_string(),
            replace: "`add` <!-- docsmith: stale -->".to_string(),
        }]);
        let err = applier.apply(&fix("README.md", patch, 0.7)).await.unwrap_err();

        assert!(matches!(err, ApplyError::WriteFailed { ref reason, .. } if reason.contains("protected")));
        assert_eq!(std::fs::read_to_string(dir.path().join("README.md")).unwrap(), doc);
    }

    #[tokio::test]
    async fn test_verify_command_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("util.js"), "export const a = 1;\n").unwrap();
        let parser = Arc::new(SourceParser::new(&ParsingConfig::default(), &ProjectConfig::default()));
        let verifier = ParseVerifier::new(
            parser,
            dir.path(),
            Some(vec!["sh".to_string(), "-c".to_string(), "grep -q never {path}".to_string()]),
            Duration::from_secs(5),
        );

        let result = verifier.verify(Path::new("util.js"), "export const a = 1;\n").await;
        assert!(result.unwrap_err().contains("exited with"));
    }
}
