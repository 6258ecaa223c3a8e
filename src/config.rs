use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

const APP_DIR: &str = "feedhoard";
const HOME_ENV: &str = "FEEDHOARD_HOME";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Root of the `files/` and `thumbs/` trees.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    #[serde(default = "default_bucket_size")]
    pub files_bucket_size: i64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_post_delay")]
    pub post_delay_secs: u64,

    #[serde(default = "default_subscription_delay")]
    pub subscription_delay_secs: u64,

    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    #[serde(default = "default_backoff_min")]
    pub rate_limit_backoff_min_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub rate_limit_backoff_max_secs: u64,

    /// Used when neither the subscription nor its source sets an interval.
    #[serde(default = "default_update_interval")]
    pub default_update_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub error_directory: Option<PathBuf>,
    pub sendmail_to: Option<String>,
    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: PathBuf,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_db_path() -> String {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("hoard.db").to_string_lossy().to_string()
}

fn default_base_path() -> PathBuf {
    data_dir()
}

fn default_bucket_size() -> i64 {
    2048
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_user_agent() -> String {
    format!("{}/{}", APP_DIR, env!("CARGO_PKG_VERSION"))
}

fn default_post_delay() -> u64 {
    10
}

fn default_subscription_delay() -> u64 {
    60
}

fn default_retry_limit() -> u32 {
    3
}

fn default_backoff_min() -> u64 {
    16 * 60
}

fn default_backoff_max() -> u64 {
    20 * 60
}

fn default_update_interval() -> u64 {
    24 * 60
}

fn default_sendmail_path() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            base_path: default_base_path(),
            files_bucket_size: default_bucket_size(),
            log_level: default_log_level(),
            user_agent: default_user_agent(),
            scheduler: SchedulerConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            post_delay_secs: default_post_delay(),
            subscription_delay_secs: default_subscription_delay(),
            retry_limit: default_retry_limit(),
            rate_limit_backoff_min_secs: default_backoff_min(),
            rate_limit_backoff_max_secs: default_backoff_max(),
            default_update_interval_minutes: default_update_interval(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            error_directory: None,
            sendmail_to: None,
            sendmail_path: default_sendmail_path(),
        }
    }
}

impl SchedulerConfig {
    pub fn post_delay(&self) -> Duration {
        Duration::from_secs(self.post_delay_secs)
    }

    pub fn subscription_delay(&self) -> Duration {
        Duration::from_secs(self.subscription_delay_secs)
    }

    pub fn default_update_interval(&self) -> Duration {
        Duration::from_secs(self.default_update_interval_minutes * 60)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            return PathBuf::from(home).join("config.toml");
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    fn validate(&self) -> Result<()> {
        if self.files_bucket_size <= 0 {
            return Err(AppError::Config(
                "files_bucket_size must be positive".to_string(),
            ));
        }
        let s = &self.scheduler;
        if s.rate_limit_backoff_min_secs > s.rate_limit_backoff_max_secs {
            return Err(AppError::Config(
                "rate_limit_backoff_min_secs exceeds rate_limit_backoff_max_secs".to_string(),
            ));
        }
        Ok(())
    }
}
