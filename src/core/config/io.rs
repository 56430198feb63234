use crate::core::config::data::{path_display, Settings};
use directories::ProjectDirs;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read a configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The settings file is not valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The server dictionary is not valid JSON.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The file parsed but does not have the expected shape.
    Invalid { path: PathBuf, message: String },
}

impl ConfigError {
    fn display_path(path: &Path) -> String {
        path_display(path)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "Failed to read config at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::Json { path, source } => {
                write!(
                    f,
                    "Failed to parse server dictionary at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::Invalid { path, message } => {
                write!(
                    f,
                    "Invalid server dictionary at {}: {}",
                    Self::display_path(path),
                    message
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Json { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl Settings {
    /// Missing files yield defaults; unreadable or malformed files are errors.
    pub fn load_from_path(config_path: &Path) -> Result<Settings, ConfigError> {
        if !config_path.exists() {
            return Ok(Settings::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn load() -> Result<Settings, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Settings::default()),
        }
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(config_path)
            .map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "permacommons", "relais")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The server dictionary to read: an explicit path, then `servers_file`,
    /// then `servers.json` next to the default config file.
    pub fn resolve_servers_path(&self, explicit: Option<&Path>) -> Option<PathBuf> {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| self.servers_file.clone())
            .or_else(|| {
                ProjectDirs::from("org", "permacommons", "relais")
                    .map(|dirs| dirs.config_dir().join("servers.json"))
            })
    }
}
