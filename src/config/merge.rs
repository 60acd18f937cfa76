use flowbus_core::GroupId;

use super::{Config, ConfigLayer, LogFormat};

pub const ENV_PARTITION_COUNT: &str = "FLOWBUS_PARTITION_COUNT";
pub const ENV_LOCAL_GROUPS: &str = "FLOWBUS_LOCAL_GROUPS";
pub const ENV_P2P_OUT_TOPIC: &str = "FLOWBUS_P2P_OUT_TOPIC";
pub const ENV_SESSION_TOPIC: &str = "FLOWBUS_SESSION_TOPIC";
pub const ENV_LOG_FORMAT: &str = "FLOWBUS_LOG_FORMAT";

/// Later layers win: user file first, then the deployment file.
pub fn merge_layers(user: Option<ConfigLayer>, deployment: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = deployment {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`. Invalid values are logged and
/// ignored.
pub fn apply_env_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(raw) = read(ENV_PARTITION_COUNT) {
        match raw.parse::<u32>() {
            Ok(count) if count > 0 => config.instance.partition_count = count,
            Ok(_) => tracing::warn!("{ENV_PARTITION_COUNT} must be positive, ignoring"),
            Err(err) => tracing::warn!("invalid {ENV_PARTITION_COUNT}, ignoring: {err}"),
        }
    }

    if let Some(raw) = read(ENV_LOCAL_GROUPS) {
        let parsed: Result<Vec<GroupId>, _> = raw
            .split(',')
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .map(GroupId::new)
            .collect();
        match parsed {
            Ok(groups) => config.instance.local_groups = groups,
            Err(err) => tracing::warn!("invalid {ENV_LOCAL_GROUPS}, ignoring: {err}"),
        }
    }

    if let Some(topic) = read(ENV_P2P_OUT_TOPIC) {
        config.topics.p2p_out = topic;
    }

    if let Some(topic) = read(ENV_SESSION_TOPIC) {
        config.topics.session_events = topic;
    }

    if let Some(raw) = read(ENV_LOG_FORMAT) {
        match LogFormat::parse(&raw) {
            Some(format) => config.logging.stdout_format = format,
            None => tracing::warn!("invalid {ENV_LOG_FORMAT} `{raw}`, ignoring"),
        }
    }
}
