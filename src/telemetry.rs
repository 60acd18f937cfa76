//! Logging setup.
//!
//! One `EnvFilter` gates a stdout layer, an optional rolling file layer and
//! an optional in-process sink. The sink lifts the correlation fields flowbus
//! attaches to its spans and events (`session_id`, `partition`,
//! `request_key`, `sequence`) out of the free-form field map.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::field::{Field, Visit};
use tracing::metadata::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};

const LOG_FILE_PREFIX: &str = "flowbus.log";
pub const LOG_FILTER_ENV: &str = "FLOWBUS_LOG";
pub const LOG_DIR_ENV: &str = "FLOWBUS_LOG_DIR";

/// Where a log line sits in the protocol. Event fields win over span fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Correlation {
    pub session_id: Option<String>,
    pub partition: Option<u32>,
    pub request_key: Option<String>,
    pub sequence: Option<u64>,
}

impl Correlation {
    fn absorb(&mut self, field: &str, value: &FieldValue) -> bool {
        match field {
            "session_id" => self.session_id = Some(value.text()),
            "request_key" => self.request_key = Some(value.text()),
            "partition" => self.partition = value.number().and_then(|n| u32::try_from(n).ok()),
            "sequence" => self.sequence = value.number(),
            _ => return false,
        }
        true
    }

    fn fill_from(&mut self, outer: &Correlation) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&outer.session_id);
        }
        if self.request_key.is_none() {
            self.request_key.clone_from(&outer.request_key);
        }
        self.partition = self.partition.or(outer.partition);
        self.sequence = self.sequence.or(outer.sequence);
    }
}

/// One event as delivered to a `LogSink`.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub level: Level,
    pub target: &'static str,
    pub message: Option<String>,
    pub correlation: Correlation,
    /// Remaining event fields, rendered as text.
    pub fields: BTreeMap<String, String>,
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

#[derive(Clone)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
    pub sink: Option<Arc<dyn LogSink>>,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self {
            verbosity,
            logging,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Flushes buffered file output when dropped.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

struct Installed {
    layers: Vec<BoxedLayer>,
    file_guard: Option<WorkerGuard>,
    /// Reported once the subscriber is live.
    notes: Vec<SetupNote>,
}

enum SetupNote {
    Pruned { dir: PathBuf, removed: usize },
    Failed(String),
}

/// Install the global subscriber and return the guard that keeps the file
/// writer alive. A subscriber installed earlier by an embedding process is
/// left in place.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let installed = assemble(config);
    let guard = TelemetryGuard {
        _file: installed.file_guard,
    };
    if Registry::default().with(installed.layers).try_init().is_ok() {
        for note in installed.notes {
            match note {
                SetupNote::Pruned { dir, removed } => {
                    tracing::info!(dir = %dir.display(), removed, "old log files pruned");
                }
                SetupNote::Failed(reason) => tracing::warn!("{reason}"),
            }
        }
    }
    guard
}

fn assemble(config: TelemetryConfig) -> Installed {
    let mut installed = Installed {
        layers: Vec::new(),
        file_guard: None,
        notes: Vec::new(),
    };
    let logging = config.logging;

    if logging.stdout {
        installed
            .layers
            .push(format_layer(logging.stdout_format, std::io::stderr, true));
    }
    if logging.file.enabled {
        attach_file_layer(&logging.file, &mut installed);
    }
    if let Some(sink) = config.sink {
        installed.layers.push(Box::new(SinkLayer { sink }));
    }
    installed
        .layers
        .push(Box::new(build_filter(config.verbosity, logging.filter.as_deref())));
    installed
}

fn attach_file_layer(file: &FileLoggingConfig, installed: &mut Installed) {
    let dir = resolve_log_dir(file);
    if let Err(err) = fs::create_dir_all(&dir) {
        installed.notes.push(SetupNote::Failed(format!(
            "file logging disabled, cannot create {}: {err}",
            dir.display()
        )));
        return;
    }
    if let Some(keep) = file.retention_max_files {
        match prune_rotated(&dir, LOG_FILE_PREFIX, keep) {
            Ok(0) => {}
            Ok(removed) => installed.notes.push(SetupNote::Pruned {
                dir: dir.clone(),
                removed,
            }),
            Err(err) => installed
                .notes
                .push(SetupNote::Failed(format!("log retention skipped: {err}"))),
        }
    }
    let rotation = match file.rotation {
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Never => Rotation::NEVER,
    };
    let (writer, guard) =
        tracing_appender::non_blocking(RollingFileAppender::new(rotation, &dir, LOG_FILE_PREFIX));
    installed.layers.push(format_layer(file.format, writer, false));
    installed.file_guard = Some(guard);
}

/// `FLOWBUS_LOG`, then the configured directives, then verbosity.
fn build_filter(verbosity: u8, configured: Option<&str>) -> EnvFilter {
    let default_level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let from_env = std::env::var(LOG_FILTER_ENV)
        .ok()
        .filter(|directives| !directives.trim().is_empty());
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .parse_lossy(from_env.as_deref().or(configured).unwrap_or_default())
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if format == LogFormat::Tree {
        return Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(ansi)
                .with_targets(true)
                .with_writer(writer),
        );
    }
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);
    match format {
        LogFormat::Tree | LogFormat::Pretty => Box::new(fmt.pretty()),
        LogFormat::Compact => Box::new(fmt.compact().with_thread_names(true)),
        LogFormat::Json => Box::new(fmt.json().with_current_span(true).with_span_list(true)),
    }
}

fn resolve_log_dir(file: &FileLoggingConfig) -> PathBuf {
    if let Some(dir) = &file.dir {
        return dir.clone();
    }
    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("flowbus")
            .join("logs"),
    }
}

/// Delete all but the newest `keep` rotated files. Rotation suffixes are
/// dates, so name order is age order.
fn prune_rotated(dir: &Path, prefix: &str, keep: usize) -> std::io::Result<usize> {
    let rotated_prefix = format!("{prefix}.");
    let mut rotated = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(&rotated_prefix)
        {
            rotated.push(name.to_string());
        }
    }
    rotated.sort();
    let excess = rotated.len().saturating_sub(keep);
    let mut removed = 0;
    for name in rotated.into_iter().take(excess) {
        fs::remove_file(dir.join(&name))?;
        removed += 1;
    }
    Ok(removed)
}

enum FieldValue {
    Number(u64),
    Text(String),
}

impl FieldValue {
    fn text(&self) -> String {
        match self {
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(text) => text.clone(),
        }
    }

    fn number(&self) -> Option<u64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(text) => text.parse().ok(),
        }
    }
}

/// Splits recorded fields into message, correlation and the rest.
#[derive(Default)]
struct Collector {
    message: Option<String>,
    correlation: Correlation,
    rest: BTreeMap<String, String>,
}

impl Collector {
    fn put(&mut self, field: &Field, value: FieldValue) {
        let name = field.name();
        if name == "message" {
            self.message = Some(value.text());
        } else if !self.correlation.absorb(name, &value) {
            self.rest.insert(name.to_string(), value.text());
        }
    }
}

impl Visit for Collector {
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, FieldValue::Number(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, FieldValue::Text(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, FieldValue::Text(format!("{value:?}")));
    }
}

struct SinkLayer {
    sink: Arc<dyn LogSink>,
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: Context<'_, S>,
    ) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collector.correlation);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        event.record(&mut collector);
        if let Some(scope) = ctx.event_scope(event) {
            // Innermost span first, so the closest value wins.
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    collector.correlation.fill_from(outer);
                }
            }
        }
        let metadata = event.metadata();
        self.sink.log(LogRecord {
            timestamp: SystemTime::now(),
            level: *metadata.level(),
            target: metadata.target(),
            message: collector.message,
            correlation: collector.correlation,
            fields: collector.rest,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<LogRecord>>);

    impl LogSink for Collect {
        fn log(&self, record: LogRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn quiet() -> LoggingConfig {
        let mut logging = LoggingConfig::default();
        logging.stdout = false;
        logging
    }

    #[test]
    fn sink_lifts_correlation_from_spans_and_events() {
        let sink = Arc::new(Collect::default());
        let mut logging = quiet();
        logging.filter = Some("info".into());
        let installed = assemble(TelemetryConfig::new(1, logging).with_sink(sink.clone()));
        let subscriber = Registry::default().with(installed.layers);

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("batch", partition = 3u32, sequence = 1u64);
            let _outer = outer.enter();
            let inner = tracing::info_span!("process_event", session_id = "s1");
            let _inner = inner.enter();
            tracing::info!(sequence = 7u64, kind = "data", "delivered");
            tracing::debug!("filtered out");
        });

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.message.as_deref(), Some("delivered"));
        assert_eq!(
            record.correlation,
            Correlation {
                session_id: Some("s1".into()),
                partition: Some(3),
                request_key: None,
                sequence: Some(7),
            }
        );
        assert_eq!(record.fields.get("kind").map(String::as_str), Some("data"));
        assert!(!record.fields.contains_key("sequence"));
    }

    #[test]
    fn retention_keeps_the_newest_rotations() {
        let dir = tempfile::tempdir().unwrap();
        for day in ["2026-10-15", "2026-10-16", "2026-10-17"] {
            fs::write(dir.path().join(format!("{LOG_FILE_PREFIX}.{day}")), b"x").unwrap();
        }
        fs::write(dir.path().join("other.txt"), b"keep").unwrap();

        assert_eq!(prune_rotated(dir.path(), LOG_FILE_PREFIX, 2).unwrap(), 1);
        assert!(!dir.path().join("flowbus.log.2026-10-15").exists());
        assert!(dir.path().join("flowbus.log.2026-10-17").exists());
        assert!(dir.path().join("other.txt").exists());
        assert_eq!(prune_rotated(dir.path(), LOG_FILE_PREFIX, 2).unwrap(), 0);
    }

    #[test]
    fn file_logging_creates_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut logging = quiet();
        logging.file.enabled = true;
        logging.file.dir = Some(dir.path().join("logs"));
        let installed = assemble(TelemetryConfig::new(0, logging));
        assert!(installed.notes.is_empty());
        assert!(installed.file_guard.is_some());
        assert!(dir.path().join("logs").is_dir());
    }
}
