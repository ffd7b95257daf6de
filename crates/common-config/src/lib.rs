//! Shared configuration helpers for gateway services.
//!
//! A service config is a `Deserialize + Default` struct. [`load`] starts from
//! an optional TOML file named by `{PREFIX}CONFIG`, falls back to `Default`,
//! then lets `{PREFIX}*` environment variables override individual fields.

use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub trait ServiceConfig: DeserializeOwned + Default {
    /// Environment variable prefix, including the trailing underscore.
    const PREFIX: &'static str;

    fn apply_environment_overrides(&mut self, prefix: &str);
}

/// Load `T` from its config file (if any) and the process environment.
pub fn load<T: ServiceConfig>() -> Result<T, ConfigError> {
    let file_var = format!("{}CONFIG", T::PREFIX);
    let mut config = match env::var_os(&file_var) {
        Some(path) => from_file::<T>(Path::new(&path))?,
        None => T::default(),
    };
    config.apply_environment_overrides(T::PREFIX);
    Ok(config)
}

pub fn from_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Overwrite `target` with the parsed value of `{prefix}{name}` when it is set.
///
/// An unparsable value is logged and ignored.
pub fn override_from_env<T>(target: &mut T, prefix: &str, name: &str)
where
    T: FromStr,
    T::Err: Display,
{
    let var = format!("{prefix}{name}");
    if let Ok(value) = env::var(&var) {
        match value.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(error) => {
                tracing::warn!(%var, %error, "invalid environment override, keeping previous value");
            }
        }
    }
}

/// Like [`override_from_env`] for optional settings. An empty value clears
/// the setting.
pub fn override_optional_from_env<T>(target: &mut Option<T>, prefix: &str, name: &str)
where
    T: FromStr,
    T::Err: Display,
{
    let var = format!("{prefix}{name}");
    if let Ok(value) = env::var(&var) {
        if value.is_empty() {
            *target = None;
            return;
        }
        match value.parse::<T>() {
            Ok(parsed) => *target = Some(parsed),
            Err(error) => {
                tracing::warn!(%var, %error, "invalid environment override, keeping previous value");
            }
        }
    }
}
