//! Configuration for the coderank ranking workers.
//!
//! Settings are layered in this order, later layers winning:
//! - built-in defaults (every field has one)
//! - an optional TOML file
//! - `CODERANK__*` environment variables (`__` separates nested keys)
//! - the legacy `ENABLE_EXPERIMENTAL_RANKING` gate

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cron::Schedule;

/// Prefix for environment overrides, e.g. `CODERANK__LOADER__RESULTS_BUCKET`.
pub const ENV_PREFIX: &str = "CODERANK";

/// Environment gate honored on top of `enabled`. It can only turn ranking on.
pub const LEGACY_GATE_VAR: &str = "ENABLE_EXPERIMENTAL_RANKING";

/// Whether a legacy gate value switches ranking on. Empty and unrecognized
/// values leave `enabled` as configured.
pub fn legacy_gate_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "yes" | "on"
    )
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid cron expression {expression:?}: {source}")]
    Cron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
}

/// Top-level ranking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Master gate for the indexer, loader and merger tasks
    pub enabled: bool,

    /// Manual boosts keyed by repository name prefix
    pub repo_scores: HashMap<String, f64>,

    /// Cron expression (with seconds field) for the reference count job
    pub reference_counts_cron: String,

    pub loader: LoaderConfig,
    pub merger: MergerConfig,
    pub indexer: IndexerConfig,
    pub worker: WorkerConfig,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repo_scores: HashMap::new(),
            reference_counts_cron: "0 0 0 * * Sun".to_string(),
            loader: LoaderConfig::default(),
            merger: MergerConfig::default(),
            indexer: IndexerConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Settings for ingesting precomputed rank files from the results bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Bucket holding exported rank CSVs; loading is a no-op when unset
    pub results_bucket: Option<String>,

    /// Key prefix under which rank objects are written
    pub results_object_prefix: String,

    /// Ranking generation that seen-object bookkeeping is scoped to
    pub results_graph_key: String,

    /// Seconds between loader passes
    pub interval_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            results_bucket: None,
            results_object_prefix: "ranks/".to_string(),
            results_graph_key: "dev".to_string(),
            interval_secs: 3600,
        }
    }
}

/// Settings for merging bulk-written rows into the queryable rank table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    /// Maximum rows merged per pass
    pub batch_size: usize,

    /// Seconds between merger passes
    pub interval_secs: u64,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            interval_secs: 60,
        }
    }
}

/// Settings for the per-repository graph indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Seconds between indexing passes
    pub interval_secs: u64,

    /// Files larger than this many bytes are not scanned
    pub max_file_size: u64,

    /// Upper bound on symbols requested per repository
    pub max_symbols: usize,

    /// Buffered edges between the archive producer and the ranker
    pub channel_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            max_file_size: 100_000,
            max_symbols: 10_000,
            channel_capacity: 1024,
        }
    }
}

/// Settings used only by the standalone worker binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// JSON snapshot backing the local rank store
    pub store_path: String,

    /// Directory standing in for the results bucket
    pub bucket_root: String,

    /// Seconds between snapshots of a changed rank store
    pub snapshot_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store_path: "~/.coderank/ranks.json".to_string(),
            bucket_root: "~/.coderank/bucket".to_string(),
            snapshot_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store_path).into_owned())
    }

    pub fn bucket_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.bucket_root).into_owned())
    }
}

impl RankingConfig {
    /// Load configuration from an optional TOML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = Self::file_layer(path)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("enabled", Self::legacy_gate())?;

        Self::finish(builder)
    }

    fn legacy_gate() -> Option<bool> {
        std::env::var(LEGACY_GATE_VAR)
            .ok()
            .filter(|value| legacy_gate_enabled(value))
            .map(|_| true)
    }

    /// Parse configuration from TOML text without consulting the environment.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::from_str(contents, FileFormat::Toml));
        Self::finish(builder)
    }

    fn file_layer(path: Option<&Path>) -> ConfigBuilder<config::builder::DefaultState> {
        let builder = Config::builder();
        match path {
            Some(path) => builder.add_source(File::from(path).format(FileFormat::Toml).required(true)),
            None => builder,
        }
    }

    fn finish(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self, ConfigError> {
        let config: RankingConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the workers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loader.interval_secs == 0
            || self.merger.interval_secs == 0
            || self.indexer.interval_secs == 0
            || self.worker.snapshot_interval_secs == 0
        {
            return Err(ConfigError::Invalid(
                "task intervals must be at least one second".to_string(),
            ));
        }
        if self.merger.batch_size == 0 {
            return Err(ConfigError::Invalid("merger.batch_size must be positive".to_string()));
        }
        if self.indexer.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "indexer.channel_capacity must be positive".to_string(),
            ));
        }
        if let Some((prefix, score)) = self.repo_scores.iter().find(|(_, s)| !s.is_finite() || **s < 0.0) {
            return Err(ConfigError::Invalid(format!(
                "repo_scores[{prefix:?}] must be a non-negative number, got {score}"
            )));
        }
        self.schedule()?;
        Ok(())
    }

    /// Parsed schedule for the reference count job.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Schedule::from_str(&self.reference_counts_cron).map_err(|source| ConfigError::Cron {
            expression: self.reference_counts_cron.clone(),
            source,
        })
    }

    /// Whether the loader has a bucket to read from.
    pub fn results_bucket(&self) -> Option<&str> {
        self.loader
            .results_bucket
            .as_deref()
            .filter(|bucket| !bucket.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    /// Sets environment variables for one test and removes them on drop.
    struct EnvGuard(Vec<&'static str>);

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            for (key, value) in vars {
                std::env::set_var(key, value);
            }
            Self(vars.iter().map(|(key, _)| *key).collect())
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in &self.0 {
                std::env::remove_var(key);
            }
        }
    }

    fn toml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RankingConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.enabled);
        assert_eq!(config.loader.results_object_prefix, "ranks/");
        assert_eq!(config.indexer.max_file_size, 100_000);
        assert_eq!(config.indexer.max_symbols, 10_000);
        assert!(config.results_bucket().is_none());
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = RankingConfig::from_toml(
            r#"
enabled = true
reference_counts_cron = "0 30 2 * * *"

[repo_scores]
"github.com/foo" = 400.0
"github.com/bar" = 200.0

[loader]
results_bucket = "ranking-results"
results_graph_key = "v2"

[merger]
batch_size = 10
"#,
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.repo_scores.get("github.com/foo"), Some(&400.0));
        assert_eq!(config.results_bucket(), Some("ranking-results"));
        assert_eq!(config.loader.results_graph_key, "v2");
        assert_eq!(config.loader.results_object_prefix, "ranks/");
        assert_eq!(config.merger.batch_size, 10);
        assert_eq!(config.merger.interval_secs, 60);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = toml_file("[indexer]\nmax_file_size = 2048");

        let config = RankingConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.indexer.max_file_size, 2048);
    }

    #[test]
    #[serial]
    fn test_env_overlay_beats_file() {
        let file = toml_file("[merger]\nbatch_size = 10\n[loader]\nresults_bucket = \"from-file\"");
        let _env = EnvGuard::set(&[
            ("CODERANK__MERGER__BATCH_SIZE", "42"),
            ("CODERANK__LOADER__RESULTS_BUCKET", "from-env"),
        ]);

        let config = RankingConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.merger.batch_size, 42);
        assert_eq!(config.results_bucket(), Some("from-env"));
        assert_eq!(config.merger.interval_secs, 60);
    }

    #[test]
    fn test_legacy_gate_values() {
        for value in ["1", "true", "TRUE", "t", "yes", " on "] {
            assert!(legacy_gate_enabled(value), "{value:?} should enable");
        }
        for value in ["", "0", "false", "off", "maybe"] {
            assert!(!legacy_gate_enabled(value), "{value:?} should not enable");
        }
    }

    #[test]
    #[serial]
    fn test_legacy_gate_turns_ranking_on() {
        let _env = EnvGuard::set(&[(LEGACY_GATE_VAR, "true")]);
        assert!(RankingConfig::load(None).unwrap().enabled);
    }

    #[test]
    #[serial]
    fn test_legacy_gate_cannot_turn_ranking_off() {
        let file = toml_file("enabled = true");

        let _env = EnvGuard::set(&[(LEGACY_GATE_VAR, "false")]);
        assert!(RankingConfig::load(Some(file.path())).unwrap().enabled);
    }

    #[test]
    #[serial]
    fn test_empty_legacy_gate_is_unset() {
        let _env = EnvGuard::set(&[(LEGACY_GATE_VAR, "")]);
        let config = RankingConfig::load(None).unwrap();
        assert!(!config.enabled);
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let err = RankingConfig::from_toml(r#"reference_counts_cron = "not a schedule""#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Cron { .. }));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = RankingConfig::from_toml("[merger]\nbatch_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_negative_score_rejected() {
        let err = RankingConfig::from_toml("[repo_scores]\n\"github.com\" = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_bucket_counts_as_unset() {
        let mut config = RankingConfig::default();
        config.loader.results_bucket = Some(String::new());
        assert!(config.results_bucket().is_none());
    }

    #[test]
    fn test_worker_paths_expand_tilde() {
        let config = WorkerConfig {
            store_path: "/tmp/ranks.json".to_string(),
            bucket_root: "relative/bucket".to_string(),
            snapshot_interval_secs: 30,
        };
        assert_eq!(config.store_path(), PathBuf::from("/tmp/ranks.json"));
        assert_eq!(config.bucket_root(), PathBuf::from("relative/bucket"));
    }
}
