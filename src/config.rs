// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const ENV_STATE_DIR: &str = "PIPELINE_STATE_DIR";
pub const ENV_GENERATOR_ENDPOINT: &str = "GENERATOR_ENDPOINT";
pub const ENV_GENERATOR_API_KEY: &str = "GENERATOR_API_KEY";

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_max_processing_age_secs() -> u64 {
    30 * 60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_recovery_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    5
}
fn default_inter_item_delay_ms() -> u64 {
    2_000
}
fn default_inter_batch_delay_ms() -> u64 {
    60_000
}
fn default_artifact_field() -> String {
    "generated_image".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_retention_days() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding queue documents and the fingerprint file.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Enqueue without dedup when the fingerprint store is unreachable.
    #[serde(default)]
    pub best_effort_dedup: bool,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_processing_age_secs")]
    pub max_processing_age_secs: u64,
    /// Ceiling checked by stall recovery; a stalled item with more attempts
    /// than this goes to `error` instead of back to `pending`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_inter_item_delay_ms")]
    pub inter_item_delay_ms: u64,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    /// Payload field holding the generated artifact; a non-empty value marks
    /// the payload as already processed.
    #[serde(default = "default_artifact_field")]
    pub artifact_field: String,
    /// Move `failed` back to `pending` at the start of every worker cycle.
    #[serde(default)]
    pub auto_retry_failed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub endpoint: Option<String>,
    /// "ENV" means: read from GENERATOR_API_KEY.
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            best_effort_dedup: false,
            dispatch: DispatchConfig::default(),
            batch: BatchConfig::default(),
            generator: GeneratorConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_processing_age_secs: default_max_processing_age_secs(),
            max_attempts: default_max_attempts(),
            recovery_interval_secs: default_recovery_interval_secs(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            inter_item_delay_ms: default_inter_item_delay_ms(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            artifact_field: default_artifact_field(),
            auto_retry_failed: false,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_processing_age(&self) -> Duration {
        Duration::from_secs(self.max_processing_age_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

impl BatchConfig {
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }
}

impl PipelineConfig {
    pub fn content_queue_path(&self) -> PathBuf {
        self.state_dir.join("content_queue.json")
    }

    pub fn image_queue_path(&self) -> PathBuf {
        self.state_dir.join("image_queue.json")
    }

    pub fn fingerprints_path(&self) -> PathBuf {
        self.state_dir.join("fingerprints.jsonl")
    }

    /// Clamp values that would stall or spin the workers.
    fn sanitize(mut self) -> Self {
        if self.batch.batch_size == 0 {
            self.batch.batch_size = 1;
        }
        if self.dispatch.max_attempts == 0 {
            self.dispatch.max_attempts = 1;
        }
        if self.dispatch.poll_interval_ms == 0 {
            self.dispatch.poll_interval_ms = default_poll_interval_ms();
        }
        if self.dispatch.recovery_interval_secs == 0 {
            self.dispatch.recovery_interval_secs = default_recovery_interval_secs();
        }
        if self.batch.artifact_field.trim().is_empty() {
            self.batch.artifact_field = default_artifact_field();
        }
        self
    }

    /// Overlay env vars on top of file values.
    fn apply_env(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            if !dir.trim().is_empty() {
                self.state_dir = PathBuf::from(dir);
            }
        }
        if let Ok(ep) = std::env::var(ENV_GENERATOR_ENDPOINT) {
            if !ep.trim().is_empty() {
                self.generator.endpoint = Some(ep);
            }
        }
        let wants_env_key = self
            .generator
            .api_key
            .as_deref()
            .is_some_and(|k| k.trim().eq_ignore_ascii_case("env"));
        if wants_env_key {
            let key = std::env::var(ENV_GENERATOR_API_KEY)
                .map_err(|_| anyhow!("Missing {ENV_GENERATOR_API_KEY} env var"))?;
            self.generator.api_key = Some(key);
        } else if self.generator.api_key.is_none() {
            self.generator.api_key = std::env::var(ENV_GENERATOR_API_KEY).ok();
        }
        Ok(self)
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing pipeline config {}", path.display()))?;
    Ok(cfg.apply_env()?.sanitize())
}

/// Load config using env var + fallbacks:
/// 1) $PIPELINE_CONFIG_PATH
/// 2) config/pipeline.toml
/// 3) config/pipeline.json
/// 4) built-in defaults
pub fn load_config_default() -> Result<PipelineConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        } else {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/pipeline.toml");
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/pipeline.json");
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    Ok(PipelineConfig::default().apply_env()?.sanitize())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PipelineConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        _ => {
            if let Ok(v) = serde_json::from_str(s) {
                return Ok(v);
            }
            toml::from_str(s).map_err(|e| anyhow!("unsupported pipeline config format: {e}"))
        }
    }
}
