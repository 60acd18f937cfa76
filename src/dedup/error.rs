use thiserror::Error;

use flowbus_core::{Effect, PartitionId, RequestKey, Transience};

use crate::bus::PublishError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DedupError {
    #[error("dedup partition {partition} is not owned by this worker")]
    PartitionNotOwned { partition: PartitionId },
    #[error("failed to encode dedup window {request_key}: {source}")]
    Encode {
        request_key: RequestKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to start the dedup timer thread: {0}")]
    TimerThread(#[source] std::io::Error),
    #[error("dedup service has stopped")]
    Stopped,
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{} dedup clears on partition {partition} deferred for retry: {source}", .keys.len())]
    ClearsDeferred {
        partition: PartitionId,
        keys: Vec<RequestKey>,
        #[source]
        source: PublishError,
    },
}

impl DedupError {
    pub fn transience(&self) -> Transience {
        match self {
            DedupError::PartitionNotOwned { .. } => Transience::Retryable,
            DedupError::Publish(err) | DedupError::ClearsDeferred { source: err, .. } => {
                err.transience()
            }
            DedupError::Encode { .. } | DedupError::Stopped => Transience::Permanent,
            DedupError::TimerThread(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            DedupError::Publish(err) | DedupError::ClearsDeferred { source: err, .. } => err.effect(),
            DedupError::Stopped => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
