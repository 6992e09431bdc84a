use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ai::SuggestionCategory;

/// Upper bound for `file_ttl_secs`: one hundred years.
pub const MAX_FILE_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_file_ttl_secs")]
    pub file_ttl_secs: u64,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl EngineConfig {
    /// Config rooted in a single directory, used by tests and the CLI's
    /// `--data-dir` flag.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            storage_root: dir.join("storage"),
            database_path: dir.join("redline.db"),
            ..Self::default()
        }
    }

    pub fn file_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.file_ttl_secs.min(MAX_FILE_TTL_SECS) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            database_path: default_database_path(),
            worker_count: default_worker_count(),
            file_ttl_secs: default_file_ttl_secs(),
            upload: UploadConfig::default(),
            subscriber_buffer: default_subscriber_buffer(),
            pipeline: PipelineSettings::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            pricing: PricingConfig::default(),
        }
    }
}

fn redline_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".redline")
}

fn default_storage_root() -> PathBuf {
    redline_home().join("storage")
}

fn default_database_path() -> PathBuf {
    redline_home().join("data").join("redline.db")
}

fn default_worker_count() -> usize {
    1
}

fn default_file_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_sweep_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["docx".to_string(), "txt".to_string(), "md".to_string()]
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_analyze_timeout_secs")]
    pub analyze_timeout_secs: u64,
    #[serde(default = "default_integrate_timeout_secs")]
    pub integrate_timeout_secs: u64,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_categories")]
    pub categories: Vec<SuggestionCategory>,
}

impl PipelineSettings {
    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }

    pub fn integrate_timeout(&self) -> Duration {
        Duration::from_secs(self.integrate_timeout_secs)
    }
}

fn default_analyze_timeout_secs() -> u64 {
    120
}

fn default_integrate_timeout_secs() -> u64 {
    60
}

fn default_max_chunk_chars() -> usize {
    4000
}

fn default_categories() -> Vec<SuggestionCategory> {
    SuggestionCategory::ALL.to_vec()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            analyze_timeout_secs: default_analyze_timeout_secs(),
            integrate_timeout_secs: default_integrate_timeout_secs(),
            max_chunk_chars: default_max_chunk_chars(),
            categories: default_categories(),
        }
    }
}

/// Token prices used for the per-job cost estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_input_price")]
    pub input_per_1k_tokens: f64,
    #[serde(default = "default_output_price")]
    pub output_per_1k_tokens: f64,
}

fn default_input_price() -> f64 {
    0.00015
}

fn default_output_price() -> f64 {
    0.0006
}

impl PricingConfig {
    pub fn estimate(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.input_per_1k_tokens
            + (completion_tokens as f64 / 1000.0) * self.output_per_1k_tokens
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_1k_tokens: default_input_price(),
            output_per_1k_tokens: default_output_price(),
        }
    }
}
