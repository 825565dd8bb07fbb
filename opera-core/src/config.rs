// ABOUTME: Configuration parsing from a TOML file with OPERA_* environment variable overrides.
// ABOUTME: Every section has defaults; validation rejects settings the pool and retry layer cannot honor.

use crate::analysis::AnalysisConfig;
use crate::dispatcher::DispatchConfig;
use crate::paths;
use crate::pool::PoolConfig;
use crate::registry::WorkerEntry;
use crate::retry::RetryConfig;
use anyhow::{Context, Result};
use opera_classifier::ClassifierConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "OPERA_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// SQLite database holding bots' default tags
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    paths::database_file().to_string_lossy().into_owned()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rotated log files
    #[serde(default)]
    pub to_file: bool,
    /// Where log files go; setting it implies `to_file`. Defaults to the data dir's logs/
    #[serde(default)]
    pub directory: Option<String>,
}

impl LoggingConfig {
    /// Directory for rotated log files, `None` when file logging is off
    pub fn file_directory(&self) -> Option<PathBuf> {
        match &self.directory {
            Some(dir) => Some(PathBuf::from(dir)),
            None if self.to_file => Some(paths::log_dir()),
            None => None,
        }
    }
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. OPERA_CONFIG_PATH env var (if set and present)
    /// 2. ./config.toml
    /// 3. ~/.config/opera/config.toml
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Some(local);
        }

        let xdg = paths::config_file();
        if xdg.exists() {
            return Some(xdg);
        }
        None
    }

    /// Load the first config file found (or defaults), apply env overrides and validate
    pub fn load() -> Result<Self> {
        Ok(Self::load_with_source()?.0)
    }

    /// Like [`Config::load`], also returning the file that was read.
    ///
    /// Logging is configured from the result, so callers log the source once
    /// their subscriber is installed.
    pub fn load_with_source() -> Result<(Self, Option<PathBuf>)> {
        let source = Self::find_config_file();
        let mut config = match &source {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok((config, source))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("OPERA_POOL_MAX_SIZE") {
            self.pool.max_size = val
                .parse()
                .with_context(|| format!("OPERA_POOL_MAX_SIZE must be a number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("OPERA_HEAT_DECAY_RATE") {
            self.pool.heat_decay_rate = val
                .parse()
                .with_context(|| format!("OPERA_HEAT_DECAY_RATE must be a number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("OPERA_MAX_RETRIES") {
            self.retry.max_retries = val
                .parse()
                .with_context(|| format!("OPERA_MAX_RETRIES must be a number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("OPERA_CLASSIFIER_TYPE") {
            self.classifier.classifier_type = val;
        }
        if let Ok(val) = std::env::var("OPERA_CLASSIFIER_ENDPOINT") {
            self.classifier.set("endpoint", val);
        }
        if let Ok(val) = std::env::var("OPERA_CLASSIFIER_API_KEY") {
            self.classifier.set("api_key", val);
        }
        if let Ok(val) = std::env::var("OPERA_MANAGER_STAFF_ID") {
            self.dispatch.manager_staff_id = Some(val);
        }
        if let Ok(val) = std::env::var("OPERA_MANAGER_BOT_ID") {
            self.dispatch.manager_bot_id = Some(val);
        }
        if let Ok(val) = std::env::var("OPERA_DIRECTORY_PATH") {
            self.directory.path = val;
        }
        if let Ok(val) = std::env::var("OPERA_LOG_FORMAT") {
            self.logging.format = match val.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => anyhow::bail!("OPERA_LOG_FORMAT must be 'pretty' or 'json', got: {}", other),
            };
        }
        if let Ok(val) = std::env::var("OPERA_LOG_DIR") {
            self.logging.directory = Some(val);
        }
        if let Ok(val) = std::env::var("OPERA_LOG_TO_FILE") {
            self.logging.to_file = val
                .parse()
                .with_context(|| format!("OPERA_LOG_TO_FILE must be true or false, got: {}", val))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.max_size == 0 {
            anyhow::bail!("pool.max_size must be greater than 0");
        }
        if pool.heat_decay_rate < 0.0 {
            anyhow::bail!("pool.heat_decay_rate must not be negative, got {}", pool.heat_decay_rate);
        }
        if pool.min_heat < 0.0 {
            anyhow::bail!("pool.min_heat must not be negative, got {}", pool.min_heat);
        }
        if let Some(ceiling) = pool.heat_ceiling {
            if ceiling < pool.min_heat {
                anyhow::bail!(
                    "pool.heat_ceiling ({}) must be at least pool.min_heat ({})",
                    ceiling,
                    pool.min_heat
                );
            }
        }
        if pool.maintenance_interval_secs == 0 {
            anyhow::bail!("pool.maintenance_interval_secs must be greater than 0");
        }
        if self.retry.multiplier < 1.0 {
            anyhow::bail!("retry.multiplier must be at least 1.0, got {}", self.retry.multiplier);
        }
        if self.analysis.max_concurrency == 0 {
            anyhow::bail!("analysis.max_concurrency must be greater than 0");
        }
        for worker in &self.workers {
            if worker.worker_id.trim().is_empty() {
                anyhow::bail!("workers entries need a non-empty worker_id");
            }
        }
        Ok(())
    }
}
