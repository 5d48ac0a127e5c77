use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::notify::Receiver;
use crate::provider::{github, gitlab, ProviderSettings};

/// Main configuration structure for Ratatoskr
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// SQLite database holding the tracked repositories
    #[serde(default = "default_database")]
    pub database: String,

    /// CSV file read by `load`
    #[serde(default = "default_reference_list")]
    pub reference_list: String,

    /// GitHub API settings
    #[serde(default = "ProviderConfig::github")]
    pub github: ProviderConfig,

    /// GitLab API settings
    #[serde(default = "ProviderConfig::gitlab")]
    pub gitlab: ProviderConfig,

    /// Check run behaviour
    #[serde(default)]
    pub check: CheckConfig,

    /// Notification delivery
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hosting provider API configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    /// Base URL of the REST API
    pub api_url: String,

    /// Environment variable holding the access token
    pub token_env: String,
}

/// Check run configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CheckConfig {
    /// Upper bound for a whole check run, including rate limit waits
    #[serde(default = "default_run_timeout")]
    pub run_timeout: String, // "30m"

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Pause before retrying a transient failure
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String, // "2s"

    /// Suspension applied when a provider refuses a call without telling when to retry
    #[serde(default = "default_backoff")]
    pub rate_limit_backoff: String, // "60s"
}

/// Notification configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NotifyConfig {
    /// Default receiver when `check` is run without `--receiver`
    pub receiver: Option<Receiver>,

    /// Environment variable holding the webhook URL (defaults to `<RECEIVER>_WEBHOOK`)
    pub webhook_env: Option<String>,

    /// Wait before retrying a webhook that answered 429
    #[serde(default = "default_backoff")]
    pub backoff: String, // "60s"

    /// Directory for undelivered messages
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

// Default value functions
fn default_database() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/ratatoskr/tracker.db", data_home)
    } else {
        "${HOME}/.local/share/ratatoskr/tracker.db".to_string()
    }
}
fn default_reference_list() -> String {
    "GitHub_Tools_List.csv".to_string()
}
fn default_run_timeout() -> String {
    "30m".to_string()
}
fn default_request_timeout() -> u64 {
    5
}
fn default_retry_delay() -> String {
    "2s".to_string()
}
fn default_backoff() -> String {
    "60s".to_string()
}
fn default_spool_dir() -> String {
    ".".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl ProviderConfig {
    fn github() -> Self {
        Self {
            api_url: github::DEFAULT_API_URL.to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }

    fn gitlab() -> Self {
        Self {
            api_url: gitlab::DEFAULT_API_URL.to_string(),
            token_env: "GITLAB_TOKEN".to_string(),
        }
    }

    /// Token from the configured environment variable; empty values count as unset
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }

    pub fn settings(&self, request_timeout: Duration) -> ProviderSettings {
        ProviderSettings::new(&self.api_url, self.token()).timeout(request_timeout)
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            run_timeout: default_run_timeout(),
            request_timeout: default_request_timeout(),
            retry_delay: default_retry_delay(),
            rate_limit_backoff: default_backoff(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            receiver: None,
            webhook_env: None,
            backoff: default_backoff(),
            spool_dir: default_spool_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CheckConfig {
    pub fn run_timeout(&self) -> Result<Duration> {
        parse_duration(&self.run_timeout).context("Invalid check.run_timeout")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn retry_delay(&self) -> Result<Duration> {
        parse_duration(&self.retry_delay).context("Invalid check.retry_delay")
    }

    pub fn rate_limit_backoff(&self) -> Result<Duration> {
        parse_duration(&self.rate_limit_backoff).context("Invalid check.rate_limit_backoff")
    }
}

impl NotifyConfig {
    pub fn backoff(&self) -> Result<Duration> {
        parse_duration(&self.backoff).context("Invalid notify.backoff")
    }

    /// Name of the environment variable holding the webhook URL for `receiver`
    pub fn webhook_env(&self, receiver: Receiver) -> String {
        self.webhook_env
            .clone()
            .unwrap_or_else(|| receiver.default_webhook_env())
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("ratatoskr").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.database = shellexpand::full(&self.database)
            .context("Failed to expand database path")?
            .into_owned();

        self.reference_list = shellexpand::full(&self.reference_list)
            .context("Failed to expand reference_list path")?
            .into_owned();

        self.notify.spool_dir = shellexpand::full(&self.notify.spool_dir)
            .context("Failed to expand spool_dir path")?
            .into_owned();

        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            reference_list: default_reference_list(),
            github: ProviderConfig::github(),
            gitlab: ProviderConfig::gitlab(),
            check: CheckConfig::default(),
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse durations like "30s", "30m", "1h" or "2d"; a bare number is seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let seconds = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")?
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30s', '30m', '1h', '2d'")?
    };

    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.reference_list, "GitHub_Tools_List.csv");
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.github.token_env, "GITHUB_TOKEN");
        assert_eq!(config.gitlab.api_url, "https://gitlab.com/api/v4");
        assert_eq!(config.gitlab.token_env, "GITLAB_TOKEN");
        assert_eq!(config.check.run_timeout().unwrap(), Duration::from_secs(1800));
        assert_eq!(config.check.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.check.retry_delay().unwrap(), Duration::from_secs(2));
        assert_eq!(config.notify.backoff().unwrap(), Duration::from_secs(60));
        assert!(config.notify.receiver.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 2d ").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));

        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_RATATOSKR_HOME", "/test/home");

        let mut config = Config::default();
        config.database = "${TEST_RATATOSKR_HOME}/tracker.db".to_string();
        config.notify.spool_dir = "${TEST_RATATOSKR_HOME}/spool".to_string();

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.database, "/test/home/tracker.db");
        assert_eq!(config.notify.spool_dir, "/test/home/spool");

        env::remove_var("TEST_RATATOSKR_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.database = "/custom/tracker.db".to_string();
        config.notify.receiver = Some(Receiver::Slack);
        config.check.request_timeout = 9;

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.database, "/custom/tracker.db");
        assert_eq!(loaded.notify.receiver, Some(Receiver::Slack));
        assert_eq!(loaded.check.request_timeout, 9);
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("ratatoskr"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
database: "/var/lib/ratatoskr/tracker.db"
reference_list: "tools.csv"
gitlab:
  api_url: "https://gitlab.example.org/api/v4/"
  token_env: "CORP_GITLAB_TOKEN"
check:
  run_timeout: "1h"
  retry_delay: "5s"
notify:
  receiver: "rocketchat"
  webhook_env: "CHAT_HOOK"
logging:
  level: "debug"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.database, "/var/lib/ratatoskr/tracker.db");
        assert_eq!(config.reference_list, "tools.csv");
        // Sections left out keep their defaults
        assert_eq!(config.github.token_env, "GITHUB_TOKEN");
        assert_eq!(config.gitlab.token_env, "CORP_GITLAB_TOKEN");
        assert_eq!(config.check.run_timeout().unwrap(), Duration::from_secs(3600));
        assert_eq!(config.check.request_timeout, 5);
        assert_eq!(config.check.rate_limit_backoff, "60s");
        assert_eq!(config.notify.receiver, Some(Receiver::RocketChat));
        assert_eq!(config.notify.webhook_env(Receiver::RocketChat), "CHAT_HOOK");
        assert_eq!(config.notify.spool_dir, ".");
        assert_eq!(config.logging.level, "debug");

        let settings = config.gitlab.settings(Duration::from_secs(3));
        assert_eq!(settings.api_url, "https://gitlab.example.org/api/v4");
        assert_eq!(settings.timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn test_token_from_environment() {
        let mut provider = ProviderConfig::github();
        provider.token_env = "TEST_RATATOSKR_TOKEN".to_string();

        env::remove_var("TEST_RATATOSKR_TOKEN");
        assert!(provider.token().is_none());

        env::set_var("TEST_RATATOSKR_TOKEN", "  ");
        assert!(provider.token().is_none());

        env::set_var("TEST_RATATOSKR_TOKEN", "ghp_abc");
        assert_eq!(provider.token().as_deref(), Some("ghp_abc"));

        env::remove_var("TEST_RATATOSKR_TOKEN");
    }

    #[test]
    fn test_default_webhook_env_follows_receiver() {
        let notify = NotifyConfig::default();
        assert_eq!(notify.webhook_env(Receiver::Slack), "SLACK_WEBHOOK");
        assert_eq!(notify.webhook_env(Receiver::MsTeams), "MSTEAMS_WEBHOOK");
    }
}
