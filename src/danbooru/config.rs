use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE: &str = "config.toml";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Api {
    pub base_url: String,
    pub posts_per_page: u64,
    pub max_pages: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Http {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Collector {
    /// 0 means one worker per CPU.
    pub workers: usize,
    pub page_retries: usize,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Download {
    /// 0 means one worker per CPU.
    pub workers: usize,
    pub output_directory: String,
    pub retries: usize,
    pub retry_base_delay_ms: u64,
    pub atomic_writes: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_directory: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: Api,
    pub http: Http,
    pub collector: Collector,
    pub download: Download,
    pub logging: Logging,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            base_url: "https://danbooru.donmai.us".to_string(),
            posts_per_page: 20,
            max_pages: 1000,
        }
    }
}

impl Default for Http {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0".to_string(),
            timeout_secs: 10,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 16,
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self {
            workers: 0,
            page_retries: 0,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for Download {
    fn default() -> Self {
        Self {
            workers: 0,
            output_directory: "output".to_string(),
            retries: 0,
            retry_base_delay_ms: 1000,
            atomic_writes: true,
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "line".to_string(),
            log_directory: "./logs".to_string(),
            log_to_terminal: true,
            log_to_file: true,
        }
    }
}

/// How the config in a [ConfigManager] was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Read from an existing file.
    Loaded,
    /// No file existed; defaults were written.
    Created,
    /// The file did not parse and was replaced with defaults.
    Recovered {
        reason: String,
        /// Where the old file was moved, if the move succeeded.
        backup: Option<PathBuf>,
    },
}

/// Owns the config file on disk and the values loaded from it.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    config: AppConfig,
    source: ConfigSource,
}

impl ConfigManager {
    /// Loads the config at `path`, writing a default one first if it is missing.
    ///
    /// A file that no longer parses is moved aside to `*.toml.backup` and
    /// replaced with defaults. Logs nothing; call [ConfigManager::log_source]
    /// once the logger is up.
    pub fn load_or_create(path: &Path) -> ConfigResult<Self> {
        let (config, source) = if !path.exists() {
            let config = AppConfig::default();
            config.save(path)?;
            (config, ConfigSource::Created)
        } else {
            let content = fs::read_to_string(path)?;
            match toml::from_str::<AppConfig>(&content) {
                Ok(config) => (config, ConfigSource::Loaded),
                Err(e) => {
                    let backup_path = path.with_extension("toml.backup");
                    let backup = fs::rename(path, &backup_path).ok().map(|_| backup_path);
                    let config = AppConfig::default();
                    config.save(path)?;
                    (
                        config,
                        ConfigSource::Recovered {
                            reason: e.to_string(),
                            backup,
                        },
                    )
                }
            }
        };

        config.validate()?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            source,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }

    /// Reports how the config was obtained.
    pub fn log_source(&self) {
        match &self.source {
            ConfigSource::Loaded => info!("Loaded config from {}", self.path.display()),
            ConfigSource::Created => info!("Created default config file: {}", self.path.display()),
            ConfigSource::Recovered { reason, backup } => {
                error!("Failed to parse {}: {}", self.path.display(), reason);
                match backup {
                    Some(backup) => info!(
                        "Backed up old config to {} and created a new one with default values",
                        backup.display()
                    ),
                    None => warn!("Failed to backup old config, replaced it with default values"),
                }
            }
        }
    }
}

impl AppConfig {
    /// Writes the config as pretty TOML.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let toml_string =
            toml::to_string_pretty(self).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml_string)?;
        Ok(())
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api.base_url must not be empty".to_string()));
        }
        if self.api.posts_per_page == 0 {
            return Err(ConfigError::Invalid("api.posts_per_page must be at least 1".to_string()));
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Invalid("http.timeout_secs must be at least 1".to_string()));
        }
        if self.download.output_directory.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "download.output_directory must not be empty".to_string(),
            ));
        }
        match self.logging.log_format.as_str() {
            "line" | "json" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "logging.log_format must be \"line\" or \"json\", got \"{}\"",
                other
            ))),
        }
    }
}
