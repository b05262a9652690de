//! Filesystem watcher feeding the pipeline.
//!
//! Raw `notify` events are debounced into batches of distinct paths; each
//! path is classified against the disk once the batch is flushed.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use docsmith::core::FileEvent;

const DEBOUNCE: Duration = Duration::from_millis(150);

/// Start watching `root` recursively.
///
/// Returns the watcher (dropping it stops notifications) and a receiver of
/// debounced path batches.
pub fn start_watching(
    root: &Path,
    ignore_dirs: Vec<String>,
) -> Result<(RecommendedWatcher, mpsc::Receiver<Vec<PathBuf>>), notify::Error> {
    let (tx, rx) = mpsc::channel::<Vec<PathBuf>>(64);
    let (event_tx, mut event_rx) = mpsc::channel::<PathBuf>(1024);

    tokio::spawn(async move {
        let mut batch: Vec<PathBuf> = Vec::new();
        loop {
            match tokio::time::timeout(DEBOUNCE, event_rx.recv()).await {
                Ok(Some(path)) => {
                    if !batch.contains(&path) {
                        batch.push(path);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    if !batch.is_empty() && tx.send(std::mem::take(&mut batch)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else {
            return;
        };
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        for path in event.paths {
            if should_watch(&watch_root, &path, &ignore_dirs) {
                let _ = event_tx.blocking_send(path);
            }
        }
    })?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

/// Turn a flushed path into a pipeline event
pub fn classify(path: PathBuf, known: bool) -> FileEvent {
    if !path.exists() {
        FileEvent::Removed(path)
    } else if known {
        FileEvent::Changed(path)
    } else {
        FileEvent::Added(path)
    }
}

fn should_watch(root: &Path, path: &Path, ignore_dirs: &[String]) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    !relative.components().any(|c| match c {
        Component::Normal(name) => ignore_dirs.iter().any(|d| name == d.as_str()),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ignored() -> Vec<String> {
        vec![".git".to_string(), "node_modules".to_string(), ".docsmith".to_string()]
    }

    #[test]
    fn test_should_watch_project_files() {
        let root = PathBuf::from("/project");
        assert!(should_watch(&root, Path::new("/project/src/foo.js"), &ignored()));
        assert!(should_watch(&root, Path::new("/project/README.md"), &ignored()));
    }

    #[test]
    fn test_should_ignore_excluded_dirs() {
        let root = PathBuf::from("/project");
        assert!(!should_watch(&root, Path::new("/project/node_modules/x/index.js"), &ignored()));
        assert!(!should_watch(
            &root,
            Path::new("/project/.docsmith/backups/20240101T000000.000000Z-fix-1/a.js"),
            &ignored()
        ));
    }

    #[test]
    fn test_classify_by_disk_state() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.py");
        std::fs::write(&file, "x = 1\n").unwrap();

        assert_eq!(classify(file.clone(), true), FileEvent::Changed(file.clone()));
        assert_eq!(classify(file.clone(), false), FileEvent::Added(file.clone()));

        let gone = dir.path().join("gone.py");
        assert_eq!(classify(gone.clone(), true), FileEvent::Removed(gone));
    }
}
