use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use docsmith::config::Config;
use docsmith::core::fixes::list_backups;
use docsmith::core::{
    CancelToken, FileEvent, Issue, IssueKind, JsonlLessonStore, LessonBook, Pipeline, ProjectGraph,
    Resolution, SourceParser, SweepScheduler,
};
use docsmith::error::DocsmithError;

use crate::watcher;

#[derive(Parser)]
#[command(name = "docsmith")]
#[command(about = "Keeps code and its documentation consistent as files change")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default Docsmith.toml
    Init {
        /// Target directory (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Build the project graph and print statistics
    Scan,

    /// Run one consistency check over all documents
    Check {
        /// Apply fixes that clear the confidence gate
        #[arg(long)]
        apply: bool,

        /// Exit with an error if any issue is found (useful for CI)
        #[arg(long)]
        fail_on_issues: bool,
    },

    /// Watch the project and keep documentation in sync
    Watch {
        /// Seconds between background sweeps (overrides the configuration)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// List recorded lessons
    Lessons {
        /// Only lessons for this issue kind (e.g. breaking-change)
        #[arg(long)]
        kind: Option<IssueKind>,
    },

    /// List pre-edit backups, newest first
    Backups,
}

impl Cli {
    pub async fn execute(self, config: Config) -> Result<()> {
        match self.command {
            Commands::Init { path, force } => init(path, force),
            Commands::Scan => scan(&config),
            Commands::Check {
                apply,
                fail_on_issues,
            } => check(config, apply, fail_on_issues).await,
            Commands::Watch { interval } => watch_project(config, interval).await,
            Commands::Lessons { kind } => lessons(&config, kind).await,
            Commands::Backups => backups(&config),
        }
    }
}

fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let target_dir = match path {
        Some(path) => path,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let config_path = target_dir.join("Docsmith.toml");
    if config_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }

    std::fs::create_dir_all(&target_dir)?;
    Config::default().save(&config_path)?;
    info!("📝 Wrote {}", config_path.display());
    Ok(())
}

fn scan(config: &Config) -> Result<()> {
    let parser = SourceParser::new(&config.parsing, &config.project);
    let graph = ProjectGraph::scan(&config.project.root, &parser, config)?;
    let stats = graph.stats();

    println!("Files:            {}", stats.nodes);
    println!("  source:         {}", stats.source_nodes);
    println!("  documentation:  {}", stats.doc_nodes);
    println!("Dependency edges: {}", stats.edges);
    println!("Dangling imports: {}", stats.dangling_imports);
    Ok(())
}

async fn check(mut config: Config, apply: bool, fail_on_issues: bool) -> Result<()> {
    let found = if apply {
        config.fixes.auto_apply = true;
        let pipeline = Pipeline::from_config(&config)?;
        let report = pipeline.sweep(&CancelToken::never()).await?;

        for (issue, resolution) in report.issues.iter().zip(&report.resolutions) {
            let outcome = match resolution {
                Resolution::Applied(applied) if applied.changed => "fixed",
                Resolution::Applied(_) => "already fixed",
                Resolution::Queued(_) => "needs review",
                Resolution::RolledBack(_) => "rolled back",
                Resolution::Failed(_) => "fix failed",
                Resolution::NoFix => "no fix",
            };
            print_issue(issue);
            println!("    -> {}", outcome);
        }
        for pending in pipeline.pending().await {
            println!("  review {}: {}", pending.fix.id, pending.fix.summary());
        }
        report
            .resolutions
            .iter()
            .filter(|r| !matches!(r, Resolution::Applied(_)))
            .count()
    } else {
        let pipeline = Pipeline::from_config(&config)?;
        let result = pipeline.validate().await;
        for issue in &result.issues {
            print_issue(issue);
        }
        info!("📊 Checked {} documents, {} issues", result.checked, result.issues.len());
        result.issues.len()
    };

    if fail_on_issues && found > 0 {
        bail!("{} unresolved documentation issues", found);
    }
    Ok(())
}

fn print_issue(issue: &Issue) {
    println!(
        "{} [{:?}] {}: {}",
        issue.kind,
        issue.severity,
        issue.path.display(),
        issue.message
    );
    for evidence in &issue.evidence {
        println!("    line {}: {}", evidence.line, evidence.snippet);
    }
}

async fn watch_project(config: Config, interval: Option<u64>) -> Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    let root = pipeline.root().to_path_buf();
    let (_watcher, mut batches) = watcher::start_watching(&root, config.project.ignore_dirs.clone())?;
    info!("🔎 Watching {}", root.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let period = Duration::from_secs(interval.unwrap_or(config.pipeline.sweep_interval_secs).max(1));
    let scheduler = SweepScheduler::new(period, pipeline.sweep_control());
    let sweeper = pipeline.clone();
    let sweeps = tokio::spawn(scheduler.run(
        move |token| {
            let pipeline = sweeper.clone();
            async move {
                if let Err(e) = pipeline.sweep(&token).await {
                    error!("❌ Sweep failed: {}", e);
                }
            }
        },
        shutdown_rx,
    ));

    let result = loop {
        tokio::select! {
            batch = batches.recv() => {
                let Some(batch) = batch else {
                    break Ok(());
                };
                if let Err(e) = dispatch(&pipeline, batch).await {
                    break Err(e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break Ok(());
            }
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeps.await {
        warn!("⚠️ Sweep scheduler ended abnormally: {}", e);
    }
    result
}

/// Run one pipeline pass per path; distinct paths proceed concurrently
async fn dispatch(pipeline: &Arc<Pipeline>, batch: Vec<PathBuf>) -> Result<()> {
    let mut runs = JoinSet::new();
    for path in batch {
        let known = {
            let graph = pipeline.graph();
            let graph = graph.read().await;
            graph.contains(&graph.relative_path(&path))
        };
        let event: FileEvent = watcher::classify(path, known);
        let pipeline = pipeline.clone();
        runs.spawn(async move { pipeline.handle(event).await });
    }

    while let Some(joined) = runs.join_next().await {
        match joined {
            Ok(Ok(summary)) => {
                for applied in summary.applied().filter(|a| a.changed) {
                    println!("fixed {}", applied.fix.summary());
                }
            }
            Ok(Err(e @ DocsmithError::Apply(_))) => {
                error!("🚨 {}", e);
                return Err(e.into());
            }
            Ok(Err(e)) => warn!("⚠️ {}", e),
            Err(e) => warn!("⚠️ Pipeline task failed: {}", e),
        }
    }
    Ok(())
}

async fn lessons(config: &Config, kind: Option<IssueKind>) -> Result<()> {
    let book = LessonBook::new(
        Arc::new(JsonlLessonStore::new(config.lesson_store_path())),
        config.lessons.weights,
        config.lessons.similarity_threshold,
    );

    let lessons = book.list(kind).await?;
    if lessons.is_empty() {
        println!("No lessons recorded");
    }
    for lesson in lessons {
        println!(
            "{} {} {:?} {} ({:.2})",
            lesson.timestamp.format("%Y-%m-%d %H:%M"),
            lesson.issue_kind,
            lesson.outcome,
            lesson.path.display(),
            lesson.confidence
        );
        println!("    {}", lesson.solution_summary);
    }
    Ok(())
}

fn backups(config: &Config) -> Result<()> {
    let entries = list_backups(&config.backup_dir());
    if entries.is_empty() {
        println!("No backups in {}", config.backup_dir().display());
    }
    for entry in entries {
        println!("{}  {}  {}", entry.snapshot, entry.target.display(), entry.backup_path.display());
    }
    Ok(())
}
