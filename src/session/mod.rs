//! Session reliability protocol: sequence tracking, lifecycle transitions,
//! protocol negotiation and the partition-aware facade over them.

mod error;
mod machine;
mod manager;
mod negotiator;
mod tracker;

pub use error::{ProtocolError, SessionError};
pub use machine::{LifecycleNotice, SessionStateMachine, Transition};
pub use manager::{EvictReason, EvictedSession, ProcessOutcome, RejectedRecord, SessionManager};
pub use negotiator::{FlowProtocol, Negotiation, PartyProtocols, ProtocolCatalog, ProtocolNegotiator};
pub use tracker::{GapRejection, InboundOutcome, SequenceTracker, UndeliveredFull};
