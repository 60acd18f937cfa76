//! Log bus seams: records, the publisher collaborator and rebalance commands.

use std::sync::Mutex;

use thiserror::Error;

use flowbus_core::{
    DedupWindow, Effect, PartitionId, RequestKey, SessionEvent, Transience, partition_for,
};

use crate::session::SessionError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PublishError {
    #[error("publish to `{topic}` failed: {reason}")]
    Unavailable { topic: String, reason: String },
    #[error("publish to `{topic}` timed out")]
    Timeout { topic: String },
}

impl PublishError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }

    pub fn effect(&self) -> Effect {
        match self {
            PublishError::Unavailable { .. } => Effect::None,
            PublishError::Timeout { .. } => Effect::Unknown,
        }
    }
}

/// Producer side of the log. A `None` value is a tombstone.
pub trait LogPublisher: Send + Sync {
    fn publish(&self, topic: &str, key: &str, value: Option<&[u8]>) -> Result<(), PublishError>;
}

/// A session event bound for a topic, keyed by session id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: String,
    pub event: SessionEvent,
}

impl OutboundRecord {
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(&self.event).map_err(|source| SessionError::Encode {
            session_id: self.event.session_id.clone(),
            source,
        })
    }

    pub fn publish(&self, publisher: &dyn LogPublisher) -> crate::Result<()> {
        let value = self.encode()?;
        publisher.publish(&self.topic, &self.key, Some(&value))?;
        Ok(())
    }
}

/// Publish records in order, stopping at the first failure.
pub fn publish_all(publisher: &dyn LogPublisher, records: &[OutboundRecord]) -> crate::Result<()> {
    for record in records {
        record.publish(publisher)?;
    }
    Ok(())
}

/// A session event consumed from a partition of the session topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundRecord {
    pub partition: PartitionId,
    pub key: String,
    pub event: SessionEvent,
}

impl InboundRecord {
    pub fn decode(partition: PartitionId, key: &str, value: &[u8]) -> Result<Self, SessionError> {
        let event: SessionEvent =
            serde_json::from_slice(value).map_err(|source| SessionError::Decode {
                key: key.to_string(),
                source,
            })?;
        Ok(Self {
            partition,
            key: key.to_string(),
            event,
        })
    }

    /// Record for an event published on a topic with `partition_count`
    /// partitions, placed by its key.
    pub fn placed(event: SessionEvent, partition_count: u32) -> Self {
        let key = event.session_id.as_str().to_string();
        Self {
            partition: partition_for(&key, partition_count),
            key,
            event,
        }
    }
}

/// Consumer-group rebalance and commit notifications for the dedup state topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionCommand {
    /// Partition synced: these windows are now owned by this worker.
    Assign {
        partition: PartitionId,
        windows: Vec<DedupWindow>,
    },
    /// Ownership lost; `keys` are the windows held for the partition.
    Revoke {
        partition: PartitionId,
        keys: Vec<RequestKey>,
    },
    /// Window state committed; `None` marks a cleared window.
    Committed {
        partition: PartitionId,
        updated: Vec<(RequestKey, Option<DedupWindow>)>,
    },
}

/// A record captured by `MemoryPublisher`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// In-process publisher that keeps every record, for single-process
/// deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    records: Mutex<Vec<PublishedRecord>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PublishedRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn drain(&self) -> Vec<PublishedRecord> {
        match self.records.lock() {
            Ok(mut records) => std::mem::take(&mut *records),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn tombstones(&self, topic: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|record| record.topic == topic && record.value.is_none())
            .map(|record| record.key)
            .collect()
    }
}

impl LogPublisher for MemoryPublisher {
    fn publish(&self, topic: &str, key: &str, value: Option<&[u8]>) -> Result<(), PublishError> {
        let record = PublishedRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            value: value.map(<[u8]>::to_vec),
        };
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}
