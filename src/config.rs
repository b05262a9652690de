use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DocsmithError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Whether to ask an LLM for fix suggestions
    pub enabled: bool,

    /// Suggestion backend (anthropic, openai, mcp)
    pub provider: String,

    /// Model name (e.g., "claude-3-5-sonnet-latest", "gpt-4")
    pub model: String,

    /// API key (for external providers)
    pub api_key: Option<String>,

    /// Base URL (for MCP bridges or custom endpoints)
    pub base_url: Option<String>,

    /// Maximum tokens for LLM responses
    pub max_tokens: Option<u32>,

    /// Temperature for LLM responses (0.0 to 1.0)
    pub temperature: Option<f32>,

    /// Hard limit on a single suggestion call
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Source code parsing configuration
    pub parsing: ParsingConfig,

    /// Change pipeline settings
    pub pipeline: PipelineConfig,

    /// Fix application settings
    pub fixes: FixConfig,

    /// Lesson store settings
    pub lessons: LessonConfig,

    /// LLM integration settings
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project name
    pub name: String,

    /// Directory the graph is built from
    pub root: PathBuf,

    /// Directory names skipped while scanning
    pub ignore_dirs: Vec<String>,

    /// Extensions treated as documentation
    pub doc_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsingConfig {
    /// Languages to support
    pub languages: Vec<String>,

    /// Maximum file size to parse (in bytes)
    pub max_file_size: usize,

    /// Suffixes tried, in order, when resolving an import specifier
    pub resolve_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fixes below this confidence are queued for review instead of applied
    pub confidence_threshold: f32,

    /// Interval between background consistency sweeps (0 disables them)
    pub sweep_interval_secs: u64,

    /// Stop a run early when the content hash did not change
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    /// Apply fixes above the confidence threshold without asking
    pub auto_apply: bool,

    /// Where pre-write snapshots are stored, relative to the project root
    pub backup_dir: PathBuf,

    /// Optional smoke check run after each write; `{path}` is substituted
    pub verify_command: Option<Vec<String>>,

    /// Time limit for the smoke check
    pub verify_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LessonConfig {
    /// Append-only lesson log, relative to the project root
    pub store_path: PathBuf,

    /// Minimum similarity for `find_similar`
    pub similarity_threshold: f32,

    /// Field weights used by the similarity score
    pub weights: SimilarityWeights,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub kind: f32,
    pub severity: f32,
    pub technology: f32,
    pub category: f32,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "Unnamed Project".to_string(),
            root: PathBuf::from("."),
            ignore_dirs: vec![
                "target".to_string(),
                "node_modules".to_string(),
                ".git".to_string(),
                "dist".to_string(),
                "build".to_string(),
                "__pycache__".to_string(),
                ".docsmith".to_string(),
            ],
            doc_extensions: vec!["md".to_string(), "markdown".to_string()],
        }
    }
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            languages: vec!["javascript".to_string(), "python".to_string()],
            max_file_size: 1024 * 1024, // 1MB
            resolve_extensions: vec![
                ".js".to_string(),
                ".mjs".to_string(),
                ".cjs".to_string(),
                ".jsx".to_string(),
                ".ts".to_string(),
                ".tsx".to_string(),
                ".py".to_string(),
                "/index.js".to_string(),
                "/index.ts".to_string(),
                "/__init__.py".to_string(),
            ],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            sweep_interval_secs: 300,
            skip_unchanged: true,
        }
    }
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            auto_apply: true,
            backup_dir: PathBuf::from(".docsmith/backups"),
            verify_command: None,
            verify_timeout_secs: 60,
        }
    }
}

impl Default for LessonConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(".docsmith/lessons.jsonl"),
            similarity_threshold: 0.7,
            weights: SimilarityWeights::default(),
        }
    }
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            kind: 0.4,
            severity: 0.2,
            technology: 0.3,
            category: 0.1,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "anthropic".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: Some(2000),
            temperature: Some(0.2),
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| DocsmithError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| DocsmithError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(p) => {
                if p.as_ref().exists() {
                    Self::load(p)
                } else {
                    Ok(Self::default())
                }
            }
            None => {
                // Try common config file locations
                let candidates = ["Docsmith.toml", "docsmith.toml", ".docsmith.toml"];

                for candidate in &candidates {
                    if Path::new(candidate).exists() {
                        return Self::load(candidate);
                    }
                }

                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.pipeline.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DocsmithError::Config(format!(
                "pipeline.confidence_threshold must be within 0.0..=1.0, got {}",
                threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.lessons.similarity_threshold) {
            return Err(DocsmithError::Config(format!(
                "lessons.similarity_threshold must be within 0.0..=1.0, got {}",
                self.lessons.similarity_threshold
            )));
        }
        Ok(())
    }

    /// Absolute location of the backup directory
    pub fn backup_dir(&self) -> PathBuf {
        self.project.root.join(&self.fixes.backup_dir)
    }

    /// Absolute location of the lesson log
    pub fn lesson_store_path(&self) -> PathBuf {
        self.project.root.join(&self.lessons.store_path)
    }
}
