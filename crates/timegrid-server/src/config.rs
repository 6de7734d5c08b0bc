//! Server configuration: listen address, rate limiting, CORS.

use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU64};
use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const CONFIG_OVERRIDE_ENV: &str = "TIMEGRID_CONFIG_FILE";
const CORS_MAX_LIST_SIZE: usize = 64;
const CORS_MAX_AGE_LIMIT: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl ServerConfig {
    fn default_listen_addr() -> String {
        "127.0.0.1:8080".to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

/// Keyed rate limit applied to the upload route. Status and projection reads
/// are cheap and stay unthrottled.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "RateLimitConfig::default_window_ms")]
    pub window_ms: NonZeroU64,
    #[serde(default = "RateLimitConfig::default_upload_requests")]
    pub upload_max_requests: NonZeroU32,
    #[serde(default = "RateLimitConfig::default_upload_burst")]
    pub upload_burst: NonZeroU32,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl RateLimitConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_window_ms() -> NonZeroU64 {
        NonZeroU64::new(60_000).expect("non-zero window defaults to one minute")
    }

    fn default_upload_requests() -> NonZeroU32 {
        NonZeroU32::new(30).expect("upload default must be non-zero")
    }

    fn default_upload_burst() -> NonZeroU32 {
        NonZeroU32::new(10).expect("upload burst must be non-zero")
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            window_ms: Self::default_window_ms(),
            upload_max_requests: Self::default_upload_requests(),
            upload_burst: Self::default_upload_burst(),
            proxy_mode: ProxyMode::Off,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    Off,
    XForwardedFor,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default = "CorsConfig::default_max_age_secs")]
    pub max_age_secs: u64,
}

impl CorsConfig {
    fn default_allow_methods() -> Vec<String> {
        vec![
            "GET".to_string(),
            "POST".to_string(),
            "DELETE".to_string(),
            "OPTIONS".to_string(),
        ]
    }

    fn default_allow_headers() -> Vec<String> {
        vec!["authorization".to_string(), "content-type".to_string()]
    }

    fn default_max_age_secs() -> u64 {
        600
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origins: Vec::new(),
            allow_methods: Self::default_allow_methods(),
            allow_headers: Self::default_allow_headers(),
            max_age_secs: Self::default_max_age_secs(),
        }
    }
}

pub fn load() -> Result<ServerConfig, ServerConfigError> {
    let dirs = timegrid_app::config::project_dirs()
        .map_err(|_| ServerConfigError::MissingProjectDirs)?;

    let mut builder = Config::builder()
        .set_default("server.listen_addr", ServerConfig::default_listen_addr())?;

    let user_config = dirs.config_dir().join("settings.toml");
    for path in [user_config, PathBuf::from(LOCAL_CONFIG_PATH)] {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }
    if let Some(raw) = std::env::var_os(CONFIG_OVERRIDE_ENV) {
        builder = builder.add_source(
            File::from(PathBuf::from(raw))
                .format(FileFormat::Toml)
                .required(true),
        );
    }
    builder = builder.add_source(Environment::with_prefix("TIMEGRID").separator("__"));

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(default)]
        server: Option<ServerConfig>,
    }

    let wrapper: Wrapper = builder.build()?.try_deserialize()?;
    let cfg = wrapper.server.unwrap_or_default();
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(config: &ServerConfig) -> Result<(), ServerConfigError> {
    let cors = &config.cors;
    if cors.max_age_secs > CORS_MAX_AGE_LIMIT {
        return Err(invalid("CORS max_age_secs exceeds 86400 second ceiling"));
    }
    if cors.enabled && cors.allow_origins.is_empty() {
        return Err(invalid("CORS enabled but allow_origins is empty"));
    }
    if cors.allow_origins.len() > CORS_MAX_LIST_SIZE {
        return Err(invalid("CORS allow_origins list is too long"));
    }
    for origin in &cors.allow_origins {
        let url = Url::parse(origin).map_err(|_| invalid(format!("invalid CORS origin `{origin}`")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "CORS origin `{origin}` must use http or https"
            )));
        }
    }
    Ok(())
}

fn invalid<S: Into<String>>(message: S) -> ServerConfigError {
    ServerConfigError::Build(config::ConfigError::Message(message.into()))
}
