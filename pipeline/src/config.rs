//! Layered configuration: `config.toml` (path from `MAILSIFT_CONFIG` or the
//! working directory) plus environment overrides for secrets. Loaded once at
//! startup; rule tables and mappings derived from it are immutable for the
//! life of the process.

use std::{collections::HashMap, env, path::PathBuf};

use config::Config;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    #[serde(default = "default_stale_lock_ttl")]
    pub stale_lock_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    pub endpoint: String,
    #[serde(default = "default_ocr_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub small_model: String,
    pub medium_model: String,
    pub large_model: String,
    #[serde(default = "default_small_timeout")]
    pub small_timeout_secs: u64,
    #[serde(default = "default_medium_timeout")]
    pub medium_timeout_secs: u64,
    #[serde(default = "default_large_timeout")]
    pub large_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: u32,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: default_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            factor: default_backoff_factor(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (0-based), capped.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let raw = self.initial_backoff_secs * u64::from(self.factor).pow(attempt);
        raw.min(self.max_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub daily_token_budget: u64,
    #[serde(default = "default_timeout_external")]
    pub timeout_secs: u64,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_cpu")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_max_ram")]
    pub max_ram_percent: f32,
    #[serde(default = "default_max_gpu")]
    pub max_gpu_percent: f32,
    #[serde(default = "default_min_free_disk")]
    pub min_free_disk_gib: f64,
    #[serde(default)]
    pub disk_paths: Vec<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval_secs: default_monitor_interval(),
            max_cpu_percent: default_max_cpu(),
            max_ram_percent: default_max_ram(),
            max_gpu_percent: default_max_gpu(),
            min_free_disk_gib: default_min_free_disk(),
            disk_paths: Vec::new(),
        }
    }
}

/// Per-machine launch plan: instance counts per phase and an optional fixed
/// index range when the fleet splits one input between hosts.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MachineConfig {
    #[serde(default)]
    pub instances: HashMap<String, usize>,
    #[serde(default)]
    pub range: Option<[usize; 2]>,
}

impl MachineConfig {
    pub fn instances_for(&self, phase: u8) -> usize {
        self.instances
            .get(&format!("phase{phase}"))
            .copied()
            .unwrap_or(1)
    }
}

/// Extra classification rules merged over the built-in table.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleOverride {
    pub kind: String,
    pub priority: i32,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CorrespondentConfig {
    /// TOML file mapping normalized keys to display names; merged over the
    /// built-in table.
    #[serde(default)]
    pub known_mappings: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub ocr: OcrConfig,
    pub inference: InferenceConfig,
    pub external: ExternalConfig,
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub machines: HashMap<String, MachineConfig>,
    #[serde(default)]
    pub rules: Vec<RuleOverride>,
    #[serde(default)]
    pub correspondents: CorrespondentConfig,
}

impl PipelineConfig {
    pub fn load() -> PipelineResult<Self> {
        let path = env::var("MAILSIFT_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let mut cfg: PipelineConfig = Config::builder()
            .add_source(config::File::with_name(&path))
            .build()?
            .try_deserialize()?;

        if let Ok(key) = env::var("MAILSIFT_EXTERNAL_API_KEY") {
            cfg.external.api_key = Some(key);
        }
        if let Ok(token) = env::var("MAILSIFT_DELIVERY_TOKEN") {
            cfg.delivery.token = Some(token);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> PipelineResult<()> {
        if !self.store.input_root.is_dir() {
            return Err(PipelineError::Config(format!(
                "input root {} is not a directory",
                self.store.input_root.display()
            )));
        }
        if self.external.daily_token_budget == 0 {
            return Err(PipelineError::Config(
                "external.daily_token_budget must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn machine(&self, tag: &str) -> PipelineResult<&MachineConfig> {
        self.machines.get(tag).ok_or_else(|| {
            PipelineError::Config(format!("machine tag '{tag}' not present in [machines]"))
        })
    }
}

fn default_stale_lock_ttl() -> u64 {
    600
}
fn default_ocr_timeout() -> u64 {
    120
}
fn default_max_pages() -> u32 {
    50
}
fn default_small_timeout() -> u64 {
    60
}
fn default_medium_timeout() -> u64 {
    90
}
fn default_large_timeout() -> u64 {
    180
}
fn default_timeout_external() -> u64 {
    120
}
fn default_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    2
}
fn default_backoff_factor() -> u32 {
    2
}
fn default_max_backoff() -> u64 {
    30
}
fn default_requests_per_minute() -> usize {
    30
}
fn default_fan_out() -> usize {
    4
}
fn default_monitor_interval() -> u64 {
    2
}
fn default_max_cpu() -> f32 {
    85.0
}
fn default_max_ram() -> f32 {
    85.0
}
fn default_max_gpu() -> f32 {
    90.0
}
fn default_min_free_disk() -> f64 {
    10.0
}
