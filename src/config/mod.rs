//! Config loading and persistence.

mod load;
mod merge;
mod schema;

use std::path::PathBuf;

use thiserror::Error;

use flowbus_core::{Effect, Transience};

pub use load::{
    DEPLOYMENT_CONFIG_FILE, config_path, deployment_config_path, load, load_deployment_config,
    load_layer, load_or_init, load_user_config, write_config,
};
pub use merge::{
    ENV_LOCAL_GROUPS, ENV_LOG_FORMAT, ENV_P2P_OUT_TOPIC, ENV_PARTITION_COUNT, ENV_SESSION_TOPIC,
    apply_env_overrides, apply_env_overrides_from, merge_layers,
};
pub use schema::{
    Config, ConfigLayer, DedupConfig, DedupConfigOverride, FileLoggingConfig,
    FileLoggingConfigOverride, InstanceConfig, InstanceConfigOverride, LimitsOverride, LogFormat,
    LogRotation, LoggingConfig, LoggingConfigOverride, TopicsConfig, TopicsConfigOverride,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Retryable,
            ConfigError::Parse { .. } | ConfigError::Serialize(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ConfigError::Write { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
