//! Configuration management

use clap::{Parser, Subcommand};
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid catalogs configuration: {0}")]
    InvalidCatalogs(String),

    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),

    #[error("Invalid network configuration: {0}")]
    InvalidNetwork(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub catalogs: CatalogsConfig,
    pub rate_limit: RateLimitConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

fn default_extensions_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("catalog-host").join("extensions"))
        .unwrap_or_else(|| PathBuf::from("./extensions"))
}

fn with_defaults(
    builder: config::builder::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    Ok(builder
        .set_default("catalogs.extensions_dir", default_extensions_dir().display().to_string())?
        .set_default("catalogs.hydration_workers", 4)?
        .set_default("catalogs.min_lib_version", 2)?
        .set_default("catalogs.max_lib_version", 2)?
        .set_default("catalogs.pinned", Vec::<String>::new())?
        .set_default("rate_limit.default_rate", 2.0)?
        .set_default("rate_limit.floor", 0.25)?
        .set_default("rate_limit.ceiling", 10.0)?
        .set_default("rate_limit.backoff_factor", 0.5)?
        .set_default("rate_limit.recovery_step", 0.5)?
        .set_default("rate_limit.success_streak", 3)?
        .set_default("network.request_timeout", 30)?
        .set_default("network.user_agent", concat!("catalog-host/", env!("CARGO_PKG_VERSION")))?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?)
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = with_defaults(ConfigBuilder::builder())?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }

        // Example: CATALOG__RATE_LIMIT__DEFAULT_RATE=4
        builder = builder.add_source(
            Environment::with_prefix("CATALOG")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(dir) = &cli_args.extensions_dir {
            builder = builder.set_override("catalogs.extensions_dir", dir.display().to_string())?;
        }
        if let Some(index_url) = &cli_args.index_url {
            builder = builder.set_override("network.index_url", index_url.clone())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, filling gaps with defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalogs.validate()?;
        self.rate_limit.validate()?;
        self.network.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Staging directory, defaulting to a hidden sibling inside the extensions
    /// directory so the final rename never crosses filesystems.
    pub fn staging_dir(&self) -> PathBuf {
        self.catalogs
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.catalogs.extensions_dir.join(".staging"))
    }
}

/// Command-line interface
#[derive(Debug, Parser)]
#[command(name = "catalog-host")]
#[command(about = "Install, inspect and load reader catalogs", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding installed catalogs
    #[arg(long, value_name = "DIR", global = true)]
    pub extensions_dir: Option<PathBuf>,

    /// Remote catalog index URL
    #[arg(long, value_name = "URL", global = true)]
    pub index_url: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List installed catalogs after hydration
    List,
    /// Fetch and print the remote catalog index
    Index,
    /// Install a catalog from the remote index
    Install { package_id: String },
    /// Remove an installed catalog
    Uninstall { package_id: String },
    /// Rescan and re-hydrate a single catalog
    Reload { package_id: String },
    /// Run a search against an installed catalog
    Search {
        package_id: String,
        query: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogsConfig {
    pub extensions_dir: PathBuf,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Read-only directory with catalogs shipped by the system
    #[serde(default)]
    pub system_dir: Option<PathBuf>,
    pub hydration_workers: usize,
    pub min_lib_version: u64,
    pub max_lib_version: u64,
    #[serde(default)]
    pub pinned: Vec<String>,
}

impl CatalogsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hydration_workers == 0 {
            return Err(ConfigError::InvalidCatalogs(
                "hydration_workers must be greater than 0".to_string(),
            ));
        }
        if self.min_lib_version > self.max_lib_version {
            return Err(ConfigError::InvalidCatalogs(
                "min_lib_version must not exceed max_lib_version".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second each host starts at
    pub default_rate: f64,
    pub floor: f64,
    pub ceiling: f64,
    /// Multiplier applied on a 429
    pub backoff_factor: f64,
    /// Requests per second added after a success streak
    pub recovery_step: f64,
    pub success_streak: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rate: 2.0,
            floor: 0.25,
            ceiling: 10.0,
            backoff_factor: 0.5,
            recovery_step: 0.5,
            success_streak: 3,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.floor > 0.0) {
            return Err(ConfigError::InvalidRateLimit("floor must be greater than 0".to_string()));
        }
        if self.default_rate < self.floor || self.default_rate > self.ceiling {
            return Err(ConfigError::InvalidRateLimit(
                "default_rate must lie between floor and ceiling".to_string(),
            ));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(ConfigError::InvalidRateLimit(
                "backoff_factor must be in (0, 1)".to_string(),
            ));
        }
        if !(self.recovery_step > 0.0) {
            return Err(ConfigError::InvalidRateLimit(
                "recovery_step must be greater than 0".to_string(),
            ));
        }
        if self.success_streak == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "success_streak must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub index_url: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout: u64,
    pub user_agent: String,
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidNetwork(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if let Some(url) = &self.index_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::InvalidNetwork(format!("index_url: {}", e)))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        Ok(())
    }
}
