//! Configuration management for geoingest
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::convert::crs::Crs;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root for manifests and the `downloads` cache
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Administrative owner granted ownership of ingested records
    #[serde(default)]
    pub owner: Option<String>,

    /// Coordinate reference all vector artifacts are normalized into
    #[serde(default = "default_canonical_crs")]
    pub canonical_crs: String,

    /// Remote download configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Raster canonicalization configuration
    #[serde(default)]
    pub raster: RasterConfig,

    /// Analytics configuration
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Remote download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User agent string
    #[serde(default = "default_http_user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Render a progress bar per download
    #[serde(default = "default_http_progress")]
    pub progress: bool,
}

/// Raster canonicalization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterConfig {
    /// Directory holding the GDAL command line tools (PATH lookup if unset)
    #[serde(default)]
    pub gdal_bin_dir: Option<PathBuf>,

    /// Coordinate reference canonical rasters are warped into
    #[serde(default = "default_raster_target_crs")]
    pub target_crs: String,

    /// Compression codec for cloud-optimized output
    #[serde(default = "default_raster_compression")]
    pub compression: String,

    /// Internal tile size in pixels
    #[serde(default = "default_raster_block_size")]
    pub block_size: u32,
}

/// Analytics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Command (argv) of the external flood simulation model
    #[serde(default)]
    pub flood_model_command: Option<Vec<String>>,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for geoingest data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,

    /// Root of stored artifact bytes
    pub storage_dir: PathBuf,
}

impl PathsConfig {
    fn under(base: PathBuf) -> Self {
        Self {
            config_file: base.join("config.toml"),
            db_file: base.join("catalog.db"),
            storage_dir: base.join("storage"),
            base_dir: base,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            owner: None,
            canonical_crs: default_canonical_crs(),
            http: HttpConfig::default(),
            raster: RasterConfig::default(),
            analytics: AnalyticsConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_http_user_agent(),
            timeout_secs: default_http_timeout(),
            progress: default_http_progress(),
        }
    }
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            gdal_bin_dir: None,
            target_crs: default_raster_target_crs(),
            compression: default_raster_compression(),
            block_size: default_raster_block_size(),
        }
    }
}

impl Config {
    /// Get the default base directory for geoingest (~/.geoingest)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".geoingest")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Configuration rooted at a specific base directory, without reading any file
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: PathsConfig::under(base_dir.into()),
            ..Self::default()
        }
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig::under(base);
        config.paths.config_file = config_path.to_path_buf();

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::with_base_dir(base_dir.unwrap_or_else(Self::default_base_dir));

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if geoingest is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Directory remote files are cached under
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// Parsed canonical coordinate reference
    pub fn canonical_crs(&self) -> Result<Crs> {
        Crs::parse(&self.canonical_crs).ok_or_else(|| {
            Error::Config(format!(
                "canonical_crs '{}' is not a recognized coordinate reference",
                self.canonical_crs
            ))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.http.timeout_secs == 0 {
            return Err(Error::Config(
                "http.timeout_secs must be positive".to_string(),
            ));
        }

        if self.raster.block_size < 16 || !self.raster.block_size.is_power_of_two() {
            return Err(Error::Config(
                "raster.block_size must be a power of two >= 16".to_string(),
            ));
        }

        if let Some(command) = &self.analytics.flood_model_command {
            if command.is_empty() {
                return Err(Error::Config(
                    "analytics.flood_model_command must name an executable".to_string(),
                ));
            }
        }

        self.canonical_crs()?;
        Ok(())
    }
}
