//! TOML configuration parsing and validation.
//!
//! Every section has defaults, so a project can be opened with
//! [`Config::for_project`] and no file at all. [`load_config`] reads a TOML
//! file and validates it; invalid values are fatal.
//!
//! ```toml
//! [db]
//! dir = ".code-harness"
//!
//! [indexing]
//! max_file_size = 1048576
//! include_extensions = ["py", "java", "ts"]
//! respect_gitignore = true
//!
//! [embedding]
//! provider = "sidecar"
//! url = "http://127.0.0.1:8088"
//! model = "all-MiniLM-L6-v2"
//! dims = 384
//!
//! [retrieval]
//! rerank = "hybrid"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub docs: DocsConfig,
}

impl Config {
    /// Default configuration with stores placed under `<root>/.code-harness`.
    pub fn for_project(root: &Path) -> Self {
        let mut config = Config::default();
        config.db.dir = root.join(".code-harness");
        config
    }

    /// Directory holding attached documentation bundles.
    pub fn bundle_dir(&self) -> PathBuf {
        self.docs
            .bundle_dir
            .clone()
            .unwrap_or_else(|| self.db.dir.join("docs"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Directory that holds `code.sqlite` and `meta.sqlite`.
    #[serde(default = "default_db_dir")]
    pub dir: PathBuf,
    /// SQLite page cache size in KiB.
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: i64,
    /// Pool size used for reads. Writes are serialized regardless.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dir: default_db_dir(),
            cache_size_kib: default_cache_size_kib(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_dir() -> PathBuf {
    PathBuf::from(".code-harness")
}
fn default_cache_size_kib() -> i64 {
    64 * 1024
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Files larger than this many bytes are rejected with `too_large`.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// If non-empty, only files with one of these extensions are walked.
    #[serde(default)]
    pub include_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_extensions: Vec<String>,
    /// Literal glob patterns, matched against paths relative to the walk root.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Additional gitignore-syntax files to honor.
    #[serde(default)]
    pub ignore_files: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
    /// Honor `.harnessignore` files.
    #[serde(default = "default_true")]
    pub respect_index_ignore: bool,
    #[serde(default)]
    pub respect_global_gitignore: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            include_extensions: Vec::new(),
            exclude_extensions: Vec::new(),
            exclude_globs: Vec::new(),
            ignore_files: Vec::new(),
            respect_gitignore: true,
            respect_index_ignore: true,
            respect_global_gitignore: false,
            follow_symlinks: false,
        }
    }
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `sidecar` and `openai` providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub normalize: bool,
    /// Interval of the background flush timer.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            normalize: true,
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_flush_interval_ms() -> u64 {
    2000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Candidates fetched per entity type before reranking.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// `none`, `hybrid`, or `keyword_boost`.
    #[serde(default = "default_rerank")]
    pub rerank: String,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    /// Weight of the semantic signal in the hybrid reranker.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default)]
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            candidate_k: default_candidate_k(),
            rerank: default_rerank(),
            rerank_top_k: default_rerank_top_k(),
            hybrid_alpha: default_hybrid_alpha(),
            min_score: 0.0,
        }
    }
}

fn default_limit() -> usize {
    20
}
fn default_candidate_k() -> usize {
    80
}
fn default_rerank() -> String {
    "hybrid".to_string()
}
fn default_rerank_top_k() -> usize {
    50
}
fn default_hybrid_alpha() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_maintenance_retries")]
    pub max_retries: u32,
    /// Multiplier applied to a stale tag's weight on each run.
    #[serde(default = "default_tag_decay_factor")]
    pub tag_decay_factor: f64,
    #[serde(default = "default_tag_stale_after_days")]
    pub tag_stale_after_days: i64,
    /// Unreferenced tags whose weight falls below this are deleted.
    #[serde(default = "default_tag_prune_threshold")]
    pub tag_prune_threshold: f64,
    /// A run is overdue after `interval * overdue_factor` without completing.
    #[serde(default = "default_overdue_factor")]
    pub overdue_factor: f64,
    #[serde(default = "default_warning_failure_rate")]
    pub warning_failure_rate: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            max_retries: default_maintenance_retries(),
            tag_decay_factor: default_tag_decay_factor(),
            tag_stale_after_days: default_tag_stale_after_days(),
            tag_prune_threshold: default_tag_prune_threshold(),
            overdue_factor: default_overdue_factor(),
            warning_failure_rate: default_warning_failure_rate(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}
fn default_maintenance_retries() -> u32 {
    3
}
fn default_tag_decay_factor() -> f64 {
    0.9
}
fn default_tag_stale_after_days() -> i64 {
    30
}
fn default_tag_prune_threshold() -> f64 {
    0.1
}
fn default_overdue_factor() -> f64 {
    2.0
}
fn default_warning_failure_rate() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocsConfig {
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,
    /// Sentences returned as highlights per documentation hit.
    #[serde(default = "default_highlight_sentences")]
    pub highlight_sentences: usize,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            bundle_dir: None,
            highlight_sentences: default_highlight_sentences(),
        }
    }
}

fn default_highlight_sentences() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Relative store directories resolve against the config file's directory.
    if config.db.dir.is_relative() {
        if let Some(parent) = path.parent() {
            config.db.dir = parent.join(&config.db.dir);
        }
    }

    validate(&config)?;
    Ok(config)
}

/// Validate a configuration. Called by [`load_config`]; exposed for
/// callers that build a [`Config`] in code.
pub fn validate(config: &Config) -> Result<()> {
    if config.indexing.max_file_size == 0 {
        anyhow::bail!("indexing.max_file_size must be > 0");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.retrieval.default_limit == 0 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    match config.retrieval.rerank.as_str() {
        "none" | "hybrid" | "keyword_boost" => {}
        other => anyhow::bail!(
            "Unknown rerank strategy: '{}'. Must be none, hybrid, or keyword_boost.",
            other
        ),
    }

    let decay = config.maintenance.tag_decay_factor;
    if !(decay > 0.0 && decay <= 1.0) {
        anyhow::bail!("maintenance.tag_decay_factor must be in (0.0, 1.0]");
    }
    if config.maintenance.interval_secs == 0 {
        anyhow::bail!("maintenance.interval_secs must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "sidecar" | "openai" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, sidecar, openai, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.indexing.max_file_size, 1024 * 1024);
        assert!(config.indexing.respect_gitignore);
        assert!(!config.indexing.respect_global_gitignore);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.retrieval.rerank, "hybrid");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_sidecar_requires_model_and_dims() {
        let config: Config = toml::from_str(
            r#"
[embedding]
provider = "sidecar"
url = "http://127.0.0.1:8088"
"#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_rejects_unknown_rerank() {
        let mut config = Config::default();
        config.retrieval.rerank = "magic".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_config_resolves_relative_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("harness.toml");
        std::fs::write(&path, "[db]\ndir = \"state\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.db.dir, tmp.path().join("state"));
        assert_eq!(config.bundle_dir(), tmp.path().join("state").join("docs"));
    }
}
