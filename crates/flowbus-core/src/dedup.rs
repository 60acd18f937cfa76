//! Bounded-lifetime dedup windows.

use serde::{Deserialize, Serialize};

use super::identity::{PartitionId, RequestKey, partition_for};
use super::time::WallClock;

/// A request key remembered until `expiry`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupWindow {
    pub request_key: RequestKey,
    pub expiry: WallClock,
    pub partition: PartitionId,
}

impl DedupWindow {
    pub fn new(request_key: RequestKey, expiry: WallClock, partition: PartitionId) -> Self {
        Self {
            request_key,
            expiry,
            partition,
        }
    }

    /// Build a window from its persisted form, deriving the partition from the key.
    pub fn from_record(
        request_key: RequestKey,
        record: &DedupWindowRecord,
        partition_count: u32,
    ) -> Self {
        let partition = partition_for(request_key.as_str(), partition_count);
        Self::new(request_key, WallClock(record.expiry_timestamp_millis), partition)
    }

    /// Strictly after expiry; a window is still live at its expiry instant.
    pub fn is_expired(&self, now: WallClock) -> bool {
        now > self.expiry
    }

    pub fn to_record(&self) -> DedupWindowRecord {
        DedupWindowRecord {
            request_key: self.request_key.clone(),
            expiry_timestamp_millis: self.expiry.as_millis(),
        }
    }
}

/// Persisted value of a dedup window on the dedup state topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupWindowRecord {
    pub request_key: RequestKey,
    pub expiry_timestamp_millis: u64,
}
