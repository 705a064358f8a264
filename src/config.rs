//! Configuration loader and validator for the arrival watcher.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

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
    pub watch: Watch,
    pub cron: Cron,
    pub email: Email,
    pub sms: Sms,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub bind_addr: String,
    pub data_dir: String,
}

/// The monitored "new arrivals" page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Watch {
    pub page_url: String,
    /// Identifier for the validator-cache row of this endpoint.
    pub state_key: String,
    /// Only the top N products on the page are tracked.
    pub max_tracked_products: usize,
    pub user_agent: String,
}

/// Scheduler trigger protection and lock settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cron {
    pub secret: String,
    pub header_name: String,
    pub lock_key: String,
    pub lock_ttl_seconds: u64,
}

/// Email provider settings. Empty `api_key` means unconfigured; sends will
/// fail per-recipient with a configuration error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Email {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub from: String,
}

/// SMS provider settings. Empty `api_key` means unconfigured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sms {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub api_key: String,
    /// Plan name whose active subscribers may receive SMS.
    pub required_plan: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
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

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.watch.page_url.trim().is_empty() {
        return Err(ConfigError::Invalid("watch.page_url must be non-empty"));
    }
    if url::Url::parse(&cfg.watch.page_url).is_err() {
        return Err(ConfigError::Invalid("watch.page_url must be a valid URL"));
    }
    if cfg.watch.state_key.trim().is_empty() {
        return Err(ConfigError::Invalid("watch.state_key must be non-empty"));
    }
    if cfg.watch.max_tracked_products == 0 {
        return Err(ConfigError::Invalid(
            "watch.max_tracked_products must be > 0",
        ));
    }
    if cfg.watch.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("watch.user_agent must be non-empty"));
    }

    if cfg.cron.secret.trim().is_empty() {
        return Err(ConfigError::Invalid("cron.secret must be non-empty"));
    }
    if cfg.cron.header_name.trim().is_empty() {
        return Err(ConfigError::Invalid("cron.header_name must be non-empty"));
    }
    if cfg.cron.lock_key.trim().is_empty() {
        return Err(ConfigError::Invalid("cron.lock_key must be non-empty"));
    }
    if cfg.cron.lock_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("cron.lock_ttl_seconds must be > 0"));
    }

    if cfg.sms.required_plan.trim().is_empty() {
        return Err(ConfigError::Invalid("sms.required_plan must be non-empty"));
    }

    Ok(())
}

/// Example YAML used by tests and as a starting point for deployments.
pub fn example() -> &'static str {
    r#"app:
  bind_addr: "127.0.0.1:5080"
  data_dir: "./data"

watch:
  page_url: "https://jellycat.com/new"
  state_key: "jellycat:/new"
  max_tracked_products: 20
  user_agent: "dropwatch/0.1 (+stock-check)"

cron:
  secret: "CHANGE_ME"
  header_name: "x-cron-secret"
  lock_key: "dropwatch:cron:stock-check"
  lock_ttl_seconds: 120

email:
  api_key: "YOUR_RESEND_API_KEY"
  from: "alerts@example.com"

sms:
  username: "YOUR_CLICKSEND_USERNAME"
  api_key: "YOUR_CLICKSEND_API_KEY"
  required_plan: "plus"
"#
}
