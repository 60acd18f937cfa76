//! Metrics emission helpers.
//!
//! Metrics go out as structured `tracing` events (target `metrics`) unless a
//! different sink is installed. Tests install a capturing sink.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use flowbus_core::{ErrorCode, InstanceId, PartitionId, SessionStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

impl MetricEvent {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.key == key)
            .map(|label| label.value.as_str())
    }
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let (kind, value) = match event.value {
            MetricValue::Counter(value) => ("counter", value),
            MetricValue::Gauge(value) => ("gauge", value),
            MetricValue::Histogram(value) => ("histogram", value),
        };
        tracing::info!(
            target: "metrics",
            metric = event.name,
            kind,
            value,
            labels = ?event.labels
        );
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink_lock() -> &'static RwLock<Arc<dyn MetricSink>> {
    METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)))
}

fn sink() -> Arc<dyn MetricSink> {
    match sink_lock().read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    match sink_lock().write() {
        Ok(mut guard) => *guard = sink,
        Err(poisoned) => *poisoned.into_inner() = sink,
    }
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent {
        name,
        value,
        labels,
    });
}

fn label(key: &'static str, value: impl ToString) -> MetricLabel {
    MetricLabel {
        key,
        value: value.to_string(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

pub fn events_delivered(n: usize) {
    if n > 0 {
        emit("session_events_delivered", MetricValue::Counter(count(n)), Vec::new());
    }
}

pub fn duplicate_dropped() {
    emit("session_duplicates_dropped", MetricValue::Counter(1), Vec::new());
}

pub fn out_of_order_buffered(buffered: usize) {
    emit("session_out_of_order_buffered", MetricValue::Counter(1), Vec::new());
    emit(
        "session_gap_buffer_depth",
        MetricValue::Gauge(count(buffered)),
        Vec::new(),
    );
}

pub fn events_resent(n: usize) {
    if n > 0 {
        emit("session_events_resent", MetricValue::Counter(count(n)), Vec::new());
    }
}

pub fn status_changed(status: SessionStatus) {
    emit(
        "session_status_changed",
        MetricValue::Counter(1),
        vec![label("status", status)],
    );
}

pub fn session_failed(code: ErrorCode) {
    emit(
        "session_failed",
        MetricValue::Counter(1),
        vec![label("code", code)],
    );
}

/// Gauges are per worker, so they carry the instance label.
pub fn sessions_active(instance: InstanceId, partition: PartitionId, n: usize) {
    emit(
        "sessions_active",
        MetricValue::Gauge(count(n)),
        vec![label("instance", instance), label("partition", partition)],
    );
}

pub fn sessions_evicted(n: usize) {
    if n > 0 {
        emit("sessions_evicted", MetricValue::Counter(count(n)), Vec::new());
    }
}

pub fn batch_processed(events: usize, duration: Duration) {
    emit(
        "session_batch_events",
        MetricValue::Counter(count(events)),
        Vec::new(),
    );
    emit(
        "session_batch_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn dedup_cleared(partition: PartitionId, reason: &'static str) {
    emit(
        "dedup_windows_cleared",
        MetricValue::Counter(1),
        vec![label("partition", partition), label("reason", reason)],
    );
}

pub fn dedup_stale_timer() {
    emit("dedup_stale_timers", MetricValue::Counter(1), Vec::new());
}

pub fn dedup_timers_active(instance: InstanceId, n: usize) {
    emit(
        "dedup_timers_active",
        MetricValue::Gauge(count(n)),
        vec![label("instance", instance)],
    );
}
