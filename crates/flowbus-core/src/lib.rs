//! Core domain types for flowbus sessions.
//!
//! Module hierarchy follows type dependency order:
//! - effect: Transience / Effect error classification
//! - time: wall clock milliseconds
//! - identity: PartyId, GroupId, SessionId, RequestKey, PartitionId
//! - seq: Seq0 / Seq1 sequence numbers
//! - event: SessionEvent envelope and payloads
//! - protocol: ProtocolRecord, negotiated protocol
//! - state: SessionState and per-direction tracker state
//! - dedup: DedupWindow and its persisted record
//! - limits: session and buffer limits

#![forbid(unsafe_code)]

#[macro_use]
mod enum_str;

pub mod dedup;
pub mod effect;
pub mod error;
pub mod event;
pub mod identity;
pub mod limits;
pub mod protocol;
pub mod seq;
pub mod state;
pub mod time;

pub use dedup::{DedupWindow, DedupWindowRecord};
pub use effect::{Effect, Transience};
pub use error::{CoreError, ErrorCode, InvalidId};
pub use event::{
    ContextProperties, ContextScope, Direction, PayloadKind, Property, SessionEvent,
    SessionPayload,
};
pub use identity::{
    GroupId, InstanceId, PartitionId, PartyId, RequestKey, SessionId, SessionKey, partition_for,
};
pub use limits::Limits;
pub use protocol::{NegotiatedProtocol, ProtocolName, ProtocolRecord};
pub use seq::{Seq0, Seq1};
pub use state::{
    ReceiveState, SendState, SessionCheckpoint, SessionRole, SessionState, SessionStatus,
    UndeliveredMessage,
};
pub use time::WallClock;
