//! Session capability errors.

use thiserror::Error;

use flowbus_core::{
    CoreError, Effect, PartitionId, PartyId, SessionId, SessionKey, SessionStatus, Transience,
};

/// Protocol catalog lookups that can never succeed without new configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("party {party} has no protocol catalog entry")]
    UnknownInitiator { party: PartyId },
    #[error("flow `{flow}` of party {party} has no initiating protocol")]
    NoProtocol { party: PartyId, flow: String },
    #[error("flow `{flow}` of party {party} lists no protocol versions")]
    NoVersions { party: PartyId, flow: String },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("no session state for {key}")]
    UnknownSession { key: SessionKey },
    #[error("session {key} already exists")]
    SessionExists { key: SessionKey },
    #[error("session {session_id} cannot {operation} while {status}")]
    InvalidState {
        session_id: SessionId,
        status: SessionStatus,
        operation: &'static str,
    },
    #[error("session {session_id} already holds {limit} unacknowledged events")]
    UndeliveredOverflow { session_id: SessionId, limit: usize },
    #[error("payload of {bytes} bytes for session {session_id} exceeds {limit}")]
    PayloadTooLarge {
        session_id: SessionId,
        bytes: usize,
        limit: usize,
    },
    #[error("batch of {len} events exceeds {limit}")]
    BatchTooLarge { len: usize, limit: usize },
    #[error("partition {partition} is not owned by this worker")]
    PartitionNotOwned { partition: PartitionId },
    #[error("event for session {session_id} is malformed: {reason}")]
    Malformed { session_id: SessionId, reason: String },
    #[error("session {key} expected acknowledgement of {expected:?}, got {got}")]
    AckMismatch {
        key: SessionKey,
        expected: Option<u64>,
        got: u64,
    },
    #[error("failed to encode event for session {session_id}: {source}")]
    Encode {
        session_id: SessionId,
        #[source]
        source: serde_json::Error,
    },
    #[error("record `{key}` does not decode as a session event: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SessionError {
    pub fn transience(&self) -> Transience {
        match self {
            SessionError::PartitionNotOwned { .. } => Transience::Retryable,
            SessionError::Core(err) => err.transience(),
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            SessionError::Encode { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
