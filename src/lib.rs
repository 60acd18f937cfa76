#![forbid(unsafe_code)]

pub mod bus;
pub mod config;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod router;
pub mod session;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use flowbus_core::{
    ContextProperties, ContextScope, DedupWindow, Direction, ErrorCode, GroupId, InstanceId,
    Limits, PartitionId, PartyId, PayloadKind, ProtocolName, RequestKey, Seq0, Seq1,
    SessionCheckpoint, SessionEvent, SessionId, SessionKey, SessionPayload, SessionState,
    SessionStatus, WallClock, partition_for,
};
