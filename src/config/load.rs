use std::fs;
use std::path::{Path, PathBuf};

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigError, ConfigLayer};

pub const DEPLOYMENT_CONFIG_FILE: &str = "flowbus.toml";

/// User configuration file.
///
/// Uses `FLOWBUS_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/flowbus` or
/// `~/.config/flowbus`.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLOWBUS_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("flowbus")
}

pub fn deployment_config_path(deployment_dir: &Path) -> PathBuf {
    deployment_dir.join(DEPLOYMENT_CONFIG_FILE)
}

pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_user_config() -> Result<Option<ConfigLayer>, ConfigError> {
    load_layer(&config_path())
}

pub fn load_deployment_config(deployment_dir: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    load_layer(&deployment_config_path(deployment_dir))
}

/// User file, then the deployment file, then environment overrides.
pub fn load(deployment_dir: Option<&Path>) -> Result<Config, ConfigError> {
    let user = load_user_config()?;
    let deployment = match deployment_dir {
        Some(dir) => load_deployment_config(dir)?,
        None => None,
    };
    let mut config = merge_layers(user, deployment);
    apply_env_overrides(&mut config);
    config.instance.pin_instance_id();
    Ok(config)
}

/// Load configuration, falling back to defaults on error and writing a
/// default user file when none exists.
pub fn load_or_init(deployment_dir: Option<&Path>) -> Config {
    let path = config_path();
    let had_user_config = path.exists();

    let config = match load(deployment_dir) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!("config load failed, using defaults: {err}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg.instance.pin_instance_id();
            cfg
        }
    };

    if !had_user_config && let Err(err) = write_config(&path, &Config::default()) {
        tracing::warn!("failed to write default config: {err}");
    }

    config
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let contents = toml::to_string_pretty(cfg)?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent directory"),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|source| ConfigError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    fs::write(temp.path(), data).map_err(|source| ConfigError::Write {
        path: temp.path().to_path_buf(),
        source,
    })?;
    temp.persist(path).map_err(|err| ConfigError::Write {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}
