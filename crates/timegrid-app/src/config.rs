//! Configuration loading: defaults, optional TOML files, environment.
//!
//! Pipeline behaviour is captured once at startup in a [`PipelineConfig`]
//! value that is injected where needed; business logic never reads the
//! process environment directly.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const CONFIG_OVERRIDE_ENV: &str = "TIMEGRID_CONFIG_FILE";

pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_LONG_POLL_SECS: u64 = 20;
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub backends: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for LMDB and the filesystem blob store.
    pub data_dir: PathBuf,
}

/// Pipeline behaviour assembled once at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_true")]
    pub structured_enabled: bool,
    #[serde(default = "PipelineConfig::default_true")]
    pub hybrid_enabled: bool,
    #[serde(default = "PipelineConfig::default_true")]
    pub vision_fallback_enabled: bool,
    /// Run the timeline validator on extraction output. Disabling this is an
    /// explicit performance trade; results may then contain gaps or overlaps.
    #[serde(default = "PipelineConfig::default_true")]
    pub validate_output: bool,
    #[serde(default = "PipelineConfig::default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "PipelineConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "PipelineConfig::default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "PipelineConfig::default_long_poll_secs")]
    pub long_poll_secs: u64,
    #[serde(default = "PipelineConfig::default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
}

impl PipelineConfig {
    fn default_true() -> bool {
        true
    }

    fn default_worker_concurrency() -> usize {
        DEFAULT_WORKER_CONCURRENCY
    }

    fn default_max_retries() -> u32 {
        DEFAULT_MAX_RETRIES
    }

    fn default_visibility_timeout_secs() -> u64 {
        DEFAULT_VISIBILITY_TIMEOUT_SECS
    }

    fn default_long_poll_secs() -> u64 {
        DEFAULT_LONG_POLL_SECS
    }

    fn default_backend_timeout_secs() -> u64 {
        DEFAULT_BACKEND_TIMEOUT_SECS
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn long_poll(&self) -> Duration {
        Duration::from_secs(self.long_poll_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            structured_enabled: true,
            hybrid_enabled: true,
            vision_fallback_enabled: true,
            validate_output: true,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            long_poll_secs: DEFAULT_LONG_POLL_SECS,
            backend_timeout_secs: DEFAULT_BACKEND_TIMEOUT_SECS,
        }
    }
}

/// Extraction provider endpoints and models.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// OpenAI-compatible chat-completions endpoint for the vision model.
    pub vision_endpoint: String,
    pub vision_model: String,
    /// Document-AI table recognition endpoint for the structured backend.
    pub table_endpoint: String,
    /// Chat-completions endpoint used for OCR; usually the vision endpoint.
    pub ocr_endpoint: String,
    pub ocr_model: String,
    /// Name of the environment variable holding the provider API key.
    #[serde(default = "BackendConfig::default_api_key_env")]
    pub api_key_env: String,
}

impl BackendConfig {
    fn default_api_key_env() -> String {
        "TIMEGRID_API_KEY".to_string()
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let default_data = dirs.data_dir().to_path_buf();

    let mut builder = Config::builder()
        .set_default(
            "storage.data_dir",
            default_data.to_string_lossy().to_string(),
        )?
        .set_default("backends.vision_endpoint", "")?
        .set_default("backends.vision_model", "")?
        .set_default("backends.table_endpoint", "")?
        .set_default("backends.ocr_endpoint", "")?
        .set_default("backends.ocr_model", "")?;

    let user_config = dirs.config_dir().join("settings.toml");
    for path in [user_config, PathBuf::from(LOCAL_CONFIG_PATH)] {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(raw) = env::var_os(CONFIG_OVERRIDE_ENV) {
        let path = PathBuf::from(raw);
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("TIMEGRID").separator("__"));

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_env_aliases(&mut cfg.pipeline)?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "timegrid", "timegrid").ok_or(AppConfigError::MissingProjectDirs)
}

/// Operational aliases kept for deployment compatibility; they override the
/// layered configuration when set.
fn apply_env_aliases(pipeline: &mut PipelineConfig) -> Result<(), AppConfigError> {
    if let Some(value) = read_env("WORKER_CONCURRENCY") {
        pipeline.worker_concurrency = parse_env("WORKER_CONCURRENCY", &value)?;
    }
    if let Some(value) = read_env("MAX_RETRIES") {
        pipeline.max_retries = parse_env("MAX_RETRIES", &value)?;
    }
    if let Some(value) = read_env("USE_STRUCTURED") {
        pipeline.structured_enabled = parse_bool("USE_STRUCTURED", &value)?;
    }
    if let Some(value) = read_env("USE_VISION_FALLBACK") {
        pipeline.vision_fallback_enabled = parse_bool("USE_VISION_FALLBACK", &value)?;
    }
    if let Some(value) = read_env("USE_HYBRID") {
        pipeline.hybrid_enabled = parse_bool("USE_HYBRID", &value)?;
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, AppConfigError> {
    value.trim().parse().map_err(|_| {
        AppConfigError::Build(config::ConfigError::Message(format!(
            "invalid value `{value}` for {name}"
        )))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, AppConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(AppConfigError::Build(config::ConfigError::Message(
            format!("invalid boolean `{other}` for {name}"),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_match_operational_contract() {
        let cfg = PipelineConfig::default();
        assert!(cfg.structured_enabled);
        assert!(cfg.hybrid_enabled);
        assert!(cfg.vision_fallback_enabled);
        assert!(cfg.validate_output);
        assert_eq!(cfg.worker_concurrency, 5);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.visibility_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.long_poll(), Duration::from_secs(20));
        assert_eq!(cfg.backend_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn boolean_alias_parsing() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
