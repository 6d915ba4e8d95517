//! Configuration file parser for `$XDG_CONFIG_HOME/rivulet/config.toml`.
//!
//! The config file is optional. A missing or empty file yields defaults:
//! the data directory is `$XDG_DATA_HOME/rivulet` and the backend is
//! `markdown`, unless a `rivulet.db` already sits in that directory, in which
//! case `sqlite` is assumed. Unknown keys are accepted but logged as a
//! warning, since they are usually typos.
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::storage::SQLITE_FILE_NAME;

const APP_DIR: &str = "rivulet";
const CONFIG_FILE: &str = "config.toml";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Unknown storage backend {0:?} (expected \"sqlite\" or \"markdown\")")]
    InvalidBackend(String),

    #[error("Cannot locate home directory: set HOME or the XDG_* variables")]
    NoHome,
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Which [`Store`](crate::storage::Store) implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Markdown,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Markdown => "markdown",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "markdown" => Ok(Backend::Markdown),
            _ => Err(ConfigError::InvalidBackend(s.to_owned())),
        }
    }
}

/// The file as written; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    backend: Option<String>,
    data_dir: Option<String>,
}

/// Resolved application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend: Backend,
    /// Root for the SQLite file or the Markdown tree
    pub data_dir: PathBuf,
}

/// Locations derived from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_file: PathBuf,
    pub default_data_dir: PathBuf,
    pub home: Option<PathBuf>,
}

impl Paths {
    /// Resolves paths from an environment lookup.
    ///
    /// `XDG_CONFIG_HOME` and `XDG_DATA_HOME` are used when set to absolute
    /// paths; otherwise `~/.config` and `~/.local/share`.
    pub fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let home = env("HOME").filter(|h| !h.is_empty()).map(PathBuf::from);
        let xdg = |key: &str, fallback: &[&str]| -> Result<PathBuf, ConfigError> {
            if let Some(dir) = env(key).map(PathBuf::from).filter(|p| p.is_absolute()) {
                return Ok(dir);
            }
            let home = home.as_ref().ok_or(ConfigError::NoHome)?;
            Ok(fallback.iter().fold(home.clone(), |p, part| p.join(part)))
        };

        let config_home = xdg("XDG_CONFIG_HOME", &[".config"])?;
        let data_home = xdg("XDG_DATA_HOME", &[".local", "share"])?;

        Ok(Self {
            config_file: config_home.join(APP_DIR).join(CONFIG_FILE),
            default_data_dir: data_home.join(APP_DIR),
            home,
        })
    }

    /// Resolves paths from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Expands a leading `~` or `~/`.
    fn expand(&self, raw: &str) -> Result<PathBuf, ConfigError> {
        let rest = match raw.strip_prefix('~') {
            Some("") => "",
            Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
            _ => return Ok(PathBuf::from(raw)),
        };
        let home = self.home.as_ref().ok_or(ConfigError::NoHome)?;
        Ok(if rest.is_empty() {
            home.clone()
        } else {
            home.join(rest)
        })
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 2] = ["backend", "data_dir"];

    /// Defaults for a data directory: markdown unless a SQLite file exists.
    pub fn defaults_for(data_dir: PathBuf) -> Self {
        let backend = if data_dir.join(SQLITE_FILE_NAME).exists() {
            Backend::Sqlite
        } else {
            Backend::Markdown
        };
        Self { backend, data_dir }
    }

    /// Load configuration from `path`, filling gaps from `paths`.
    ///
    /// - Missing file → defaults
    /// - Empty file → defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path, paths: &Paths) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        // from a maliciously large or corrupted config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::defaults_for(paths.default_data_dir.clone()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::defaults_for(paths.default_data_dir.clone()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let raw: RawConfig = if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            RawConfig::default()
        } else {
            if let Ok(table) = content.parse::<toml::Table>() {
                for key in table.keys() {
                    if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                        tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                    }
                }
            }
            toml::from_str(&content)?
        };

        let data_dir = match raw.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => paths.expand(dir)?,
            _ => paths.default_data_dir.clone(),
        };
        let config = match raw.backend {
            Some(name) => Self {
                backend: name.parse()?,
                data_dir,
            },
            None => Self::defaults_for(data_dir),
        };

        tracing::info!(
            path = %path.display(),
            backend = %config.backend,
            data_dir = %config.data_dir.display(),
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
