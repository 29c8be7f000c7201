use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult, ConfigError};

use super::types::ConfigFile;

/// Config filenames looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["lockstep.toml", "lockstep.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn for_path(path: &Path) -> AppResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some(ext) => Err(AppError::config(ConfigError::UnsupportedExtension {
                ext: ext.to_owned(),
            })),
            None => Err(AppError::config(ConfigError::MissingExtension)),
        }
    }

    fn parse(self, path: &Path, content: &str) -> AppResult<ConfigFile> {
        let path = path.to_path_buf();
        match self {
            Self::Toml => toml::from_str(content)
                .map_err(|err| AppError::config(ConfigError::ParseToml { path, source: err })),
            Self::Json => serde_json::from_str(content)
                .map_err(|err| AppError::config(ConfigError::ParseJson { path, source: err })),
        }
    }
}

/// Loads `path`, or the first default config file present in the working
/// directory. `Ok(None)` when neither exists.
///
/// # Errors
///
/// Returns an error when the config file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> AppResult<Option<ConfigFile>> {
    let chosen = match path {
        Some(path) => Some(PathBuf::from(path)),
        None => DEFAULT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists()),
    };
    chosen.map(|path| load_config_file(&path)).transpose()
}

pub(crate) fn load_config_file(path: &Path) -> AppResult<ConfigFile> {
    let format = ConfigFormat::for_path(path)?;
    let content = std::fs::read_to_string(path).map_err(|err| {
        AppError::config(ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source: err,
        })
    })?;
    format.parse(path, &content)
}
