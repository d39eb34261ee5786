//! Configuration loader and validator for the grading tracker client.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Overrides `app.mode` when set to `development` or `production`.
pub const MODE_ENV: &str = "GRADING_MODE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub endpoints: Endpoints,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub mode: Option<Mode>,
}

fn default_request_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Development,
    Production,
}

impl Mode {
    /// Mode implied by the build profile.
    pub fn from_build() -> Self {
        if cfg!(debug_assertions) {
            Mode::Development
        } else {
            Mode::Production
        }
    }

    pub fn parse(raw: &str) -> Option<Mode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Mode::Development),
            "production" | "prod" => Some(Mode::Production),
            _ => None,
        }
    }
}

/// Backend locations per mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoints {
    pub development: EndpointSet,
    pub production: EndpointSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointSet {
    pub api_base_url: String,
    pub storage_base_url: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.app.data_dir)
    }

    /// Default SQLite location unless `DATABASE_URL` is set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/grading.db", self.resolved_data_dir()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.app.request_timeout_secs)
    }

    /// Mode chosen by `GRADING_MODE`, then `app.mode`, then the build profile.
    pub fn resolved_mode(&self) -> Mode {
        let from_env = std::env::var(MODE_ENV).ok();
        self.mode_with_override(from_env.as_deref())
    }

    pub fn mode_with_override(&self, env_value: Option<&str>) -> Mode {
        env_value
            .and_then(Mode::parse)
            .or(self.app.mode)
            .unwrap_or_else(Mode::from_build)
    }

    pub fn endpoints_for(&self, mode: Mode) -> &EndpointSet {
        match mode {
            Mode::Development => &self.endpoints.development,
            Mode::Production => &self.endpoints.production,
        }
    }

    pub fn active_endpoints(&self) -> &EndpointSet {
        self.endpoints_for(self.resolved_mode())
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn is_http_url(raw: &str) -> bool {
    Url::parse(raw.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_secs must be > 0"));
    }

    let dev = &cfg.endpoints.development;
    if !is_http_url(&dev.api_base_url) {
        return Err(ConfigError::Invalid(
            "endpoints.development.api_base_url must be an http(s) URL",
        ));
    }
    if !is_http_url(&dev.storage_base_url) {
        return Err(ConfigError::Invalid(
            "endpoints.development.storage_base_url must be an http(s) URL",
        ));
    }

    let prod = &cfg.endpoints.production;
    if !is_http_url(&prod.api_base_url) {
        return Err(ConfigError::Invalid(
            "endpoints.production.api_base_url must be an http(s) URL",
        ));
    }
    if !is_http_url(&prod.storage_base_url) {
        return Err(ConfigError::Invalid(
            "endpoints.production.storage_base_url must be an http(s) URL",
        ));
    }

    Ok(())
}

/// Returns the example YAML content shipped as `config.example.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  request_timeout_secs: 15
  # mode: production

endpoints:
  development:
    api_base_url: "http://localhost:8000/api/"
    storage_base_url: "http://localhost:8000/storage/"
  production:
    api_base_url: "https://api.grading.example.com/api/"
    storage_base_url: "https://api.grading.example.com/storage/"
"#
}
