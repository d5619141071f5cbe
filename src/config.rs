//! Configuration for fcsload.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Remote folders that carry procurement notices.
pub const AVAILABLE_FOLDERS: &[&str] = &["notifications", "protocols"];

/// Procurement law numbers the loader understands.
pub const AVAILABLE_LAWS: &[&str] = &["44", "223"];

/// Environment override for the archive limit.
pub const ENV_LIMIT_ARCHIVES: &str = "FCSLOAD_LIMIT_ARCHIVES";

/// Environment override for the remote folder name.
pub const ENV_SERVER_FOLDER: &str = "FCSLOAD_SERVER_FOLDER";

/// Main configuration, constructed once at startup and passed by parameter
/// into every component that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Crawl behavior
    #[serde(default)]
    pub app: AppConfig,
    /// Remote server
    pub server: ServerConfig,
    /// Status store
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate everything in one pass.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment variables take precedence over file values, mirroring how
    /// the loader is configured when run from a scheduler.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(ENV_LIMIT_ARCHIVES) {
            self.app.limit_archives = raw.parse().map_err(|_| {
                anyhow::anyhow!("{} must be an integer, got '{}'", ENV_LIMIT_ARCHIVES, raw)
            })?;
        }
        if let Ok(folder) = std::env::var(ENV_SERVER_FOLDER) {
            self.app.folder = folder;
        }
        Ok(())
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together so the user
    /// can fix everything in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.address.is_empty() {
            errors.push("server address must not be empty".to_string());
        }
        if self.server.root_dir.is_empty() {
            errors.push("server root_dir must not be empty".to_string());
        }
        if !AVAILABLE_FOLDERS.contains(&self.app.folder.as_str()) {
            errors.push(format!(
                "folder must be one of {:?}, got '{}'",
                AVAILABLE_FOLDERS, self.app.folder
            ));
        }
        if !AVAILABLE_LAWS.contains(&self.app.law_number.as_str()) {
            errors.push(format!(
                "law_number must be one of {:?}, got '{}'",
                AVAILABLE_LAWS, self.app.law_number
            ));
        }
        if self.app.download_dir.as_os_str().is_empty() {
            errors.push("download_dir must not be empty".to_string());
        }
        if self.database.path.as_os_str().is_empty() {
            errors.push("database path must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }

    /// Starter configuration written by `fcsload init`.
    pub fn starter_toml() -> String {
        r#"# fcsload configuration

[server]
# FTP server with the procurement archives
address = "ftp.zakupki.gov.ru"
root_dir = "/fcs_regions"

[app]
# "notifications" or "protocols"
folder = "notifications"
# "44" or "223"
law_number = "44"
# 0 means no limit
limit_archives = 0
download_dir = "downloads"
# Optional JSON filter, e.g.
# filters = '[{"field": "region", "match": "in", "value": ["Adygeja_Resp"]}]'

[database]
path = "fcsload.db"
# Log every SQL statement at debug level
echo = false
"#
        .to_string()
    }
}

/// Crawl behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote folder inside every region directory to read archives from
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Procurement law the archives belong to
    #[serde(default = "default_law_number")]
    pub law_number: String,
    /// Stop after this many archives were actually processed (0 = no limit)
    #[serde(default)]
    pub limit_archives: usize,
    /// Local directory for downloaded archives
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Optional JSON filter expression over `date` and `region`
    #[serde(default)]
    pub filters: Option<String>,
}

fn default_folder() -> String {
    "notifications".to_string()
}

fn default_law_number() -> String {
    "44".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            law_number: default_law_number(),
            limit_archives: 0,
            download_dir: default_download_dir(),
            filters: None,
        }
    }
}

/// Remote server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server address, with or without an explicit port
    pub address: String,
    /// Root directory that contains one subdirectory per region
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

fn default_root_dir() -> String {
    "/fcs_regions".to_string()
}

/// Status store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Log every SQL statement at debug level
    #[serde(default)]
    pub echo: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fcsload.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            echo: false,
        }
    }
}
