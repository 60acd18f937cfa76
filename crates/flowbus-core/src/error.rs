//! Core capability errors (parsing, validation) and stable session error codes.
//!
//! Core errors represent refusals of malformed input, never library details.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::effect::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("party id `{raw}` is invalid: {reason}")]
    Party { raw: String, reason: String },
    #[error("group id `{raw}` is invalid: {reason}")]
    Group { raw: String, reason: String },
    #[error("session id `{raw}` is invalid: {reason}")]
    Session { raw: String, reason: String },
    #[error("request key `{raw}` is invalid: {reason}")]
    RequestKey { raw: String, reason: String },
    #[error("protocol name `{raw}` is invalid: {reason}")]
    Protocol { raw: String, reason: String },
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error("sequence number {value} is invalid for {field}")]
    InvalidSequence { field: &'static str, value: u64 },
    #[error("checkpoint is malformed: {reason}")]
    MalformedCheckpoint { reason: String },
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

/// Stable codes carried by `Error` payloads sent to a session peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// An event referenced a session this party has no state for.
    UnknownSession,
    /// No protocol version is supported by both parties.
    VersionIncompatible,
    /// The responder hosts no flow for the requested protocol.
    ProtocolUnknown,
    /// An event arrived that the session's status does not allow.
    InvalidState,
    /// Too many out-of-order arrivals are buffered.
    GapOverflow,
    /// A sequence gap stayed open longer than the gap timeout.
    GapTimeout,
    /// The event itself is malformed.
    Malformed,
    /// The peer reported an error.
    PeerError,
    /// Local failure unrelated to the peer's input.
    Internal,
}

enum_str! {
    ErrorCode {
        UnknownSession => ["unknown_session"],
        VersionIncompatible => ["version_incompatible"],
        ProtocolUnknown => ["protocol_unknown"],
        InvalidState => ["invalid_state"],
        GapOverflow => ["gap_overflow"],
        GapTimeout => ["gap_timeout"],
        Malformed => ["malformed"],
        PeerError => ["peer_error"],
        Internal => ["internal"],
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ErrorCode::parse_str(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code `{raw}`")))
    }
}
