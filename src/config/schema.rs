use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use flowbus_core::{GroupId, InstanceId, Limits};

use crate::session::ProtocolCatalog;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub topics: TopicsConfig,
    pub limits: Limits,
    pub dedup: DedupConfig,
    pub logging: LoggingConfig,
    pub protocols: ProtocolCatalog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Fixed worker identity; a random one is used when unset.
    pub instance_id: Option<InstanceId>,
    /// Partitions of the session and dedup topics.
    pub partition_count: u32,
    /// Groups whose parties are reachable on the local bus.
    pub local_groups: Vec<GroupId>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            partition_count: 10,
            local_groups: Vec::new(),
        }
    }
}

impl InstanceConfig {
    /// The configured identity, or a fresh random one when unset.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id.unwrap_or_else(InstanceId::random)
    }

    /// Fix the identity so every component built from this config reports
    /// the same worker.
    pub fn pin_instance_id(&mut self) -> InstanceId {
        *self.instance_id.get_or_insert_with(InstanceId::random)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Session events for parties hosted on the local bus.
    pub session_events: String,
    /// Egress topic drained by the peer-to-peer gateway.
    pub p2p_out: String,
    /// Compacted dedup window state; clears publish tombstones here.
    pub dedup_state: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            session_events: "flow.session.event".to_string(),
            p2p_out: "p2p.out".to_string(),
            dedup_state: "flow.dedup.state".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Lifetime of a new dedup window.
    pub window_ms: u64,
    /// Delay before a failed tombstone publish is attempted again.
    pub clear_retry_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: 30 * 60 * 1000,
            clear_retry_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tree" => Some(LogFormat::Tree),
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    /// `EnvFilter` directives; `FLOWBUS_LOG` takes precedence.
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_files: Some(10),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfigOverride {
    pub instance_id: Option<InstanceId>,
    pub partition_count: Option<u32>,
    pub local_groups: Option<Vec<GroupId>>,
}

impl InstanceConfigOverride {
    pub fn apply_to(&self, target: &mut InstanceConfig) {
        if self.instance_id.is_some() {
            target.instance_id = self.instance_id;
        }
        if let Some(count) = self.partition_count {
            target.partition_count = count;
        }
        if let Some(groups) = self.local_groups.as_ref() {
            target.local_groups = groups.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfigOverride {
    pub session_events: Option<String>,
    pub p2p_out: Option<String>,
    pub dedup_state: Option<String>,
}

impl TopicsConfigOverride {
    pub fn apply_to(&self, target: &mut TopicsConfig) {
        if let Some(topic) = self.session_events.as_ref() {
            target.session_events = topic.clone();
        }
        if let Some(topic) = self.p2p_out.as_ref() {
            target.p2p_out = topic.clone();
        }
        if let Some(topic) = self.dedup_state.as_ref() {
            target.dedup_state = topic.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsOverride {
    pub max_buffered_events: Option<usize>,
    pub gap_timeout_ms: Option<u64>,
    pub max_undelivered_events: Option<usize>,
    pub session_inactivity_timeout_ms: Option<u64>,
    pub max_batch_events: Option<usize>,
    pub max_payload_bytes: Option<usize>,
}

impl LimitsOverride {
    pub fn apply_to(&self, limits: &mut Limits) {
        if let Some(value) = self.max_buffered_events {
            limits.max_buffered_events = value;
        }
        if let Some(value) = self.gap_timeout_ms {
            limits.gap_timeout_ms = value;
        }
        if let Some(value) = self.max_undelivered_events {
            limits.max_undelivered_events = value;
        }
        if let Some(value) = self.session_inactivity_timeout_ms {
            limits.session_inactivity_timeout_ms = value;
        }
        if let Some(value) = self.max_batch_events {
            limits.max_batch_events = value;
        }
        if let Some(value) = self.max_payload_bytes {
            limits.max_payload_bytes = value;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfigOverride {
    pub window_ms: Option<u64>,
    pub clear_retry_ms: Option<u64>,
}

impl DedupConfigOverride {
    pub fn apply_to(&self, target: &mut DedupConfig) {
        if let Some(window_ms) = self.window_ms {
            target.window_ms = window_ms;
        }
        if let Some(retry_ms) = self.clear_retry_ms {
            target.clear_retry_ms = retry_ms;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
        if let Some(file) = self.file.as_ref() {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
    pub retention_max_files: Option<usize>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = Some(dir.clone());
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}

/// One configuration file. Every field is optional and only set fields
/// override the layer below.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub instance: InstanceConfigOverride,
    pub topics: TopicsConfigOverride,
    pub limits: LimitsOverride,
    pub dedup: DedupConfigOverride,
    pub logging: LoggingConfigOverride,
    pub protocols: Option<ProtocolCatalog>,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.instance.apply_to(&mut base.instance);
        self.topics.apply_to(&mut base.topics);
        self.limits.apply_to(&mut base.limits);
        self.dedup.apply_to(&mut base.dedup);
        self.logging.apply_to(&mut base.logging);
        if let Some(protocols) = self.protocols.as_ref() {
            base.protocols.merge(protocols);
        }
    }
}
