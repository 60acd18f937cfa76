//! Session event envelope and payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::ErrorCode;
use super::identity::{PartyId, SessionId};
use super::protocol::ProtocolName;
use super::seq::{Seq0, Seq1};
use super::time::WallClock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

enum_str! {
    Direction {
        Inbound => ["INBOUND", "inbound"],
        Outbound => ["OUTBOUND", "outbound"],
    }
}

/// Who may read or set a context property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    User,
    Platform,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
    pub scope: ContextScope,
}

/// Ordered key/value pairs carried with Init, Data and Error payloads.
///
/// Keys are unique; setting an existing key replaces its value and scope in
/// place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextProperties(Vec<Property>);

impl ContextProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, scope: ContextScope) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|p| p.key == key) {
            Some(existing) => {
                existing.value = value;
                existing.scope = scope;
            }
            None => self.0.push(Property { key, value, scope }),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>, scope: ContextScope) -> Self {
        self.set(key, value, scope);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    pub fn scoped(&self, scope: ContextScope) -> impl Iterator<Item = &Property> {
        self.0.iter().filter(move |p| p.scope == scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPayload {
    Init {
        protocol_name: ProtocolName,
        versions: Vec<u32>,
        #[serde(default)]
        context: ContextProperties,
    },
    Data {
        bytes: Bytes,
        #[serde(default)]
        context: ContextProperties,
    },
    Confirm {
        protocol_name: ProtocolName,
        version: u32,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default)]
        context: ContextProperties,
    },
    Close,
    /// Unsequenced acknowledgement carrying only `received_sequence`.
    Ack,
}

impl SessionPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            SessionPayload::Init { .. } => PayloadKind::Init,
            SessionPayload::Data { .. } => PayloadKind::Data,
            SessionPayload::Confirm { .. } => PayloadKind::Confirm,
            SessionPayload::Error { .. } => PayloadKind::Error,
            SessionPayload::Close => PayloadKind::Close,
            SessionPayload::Ack => PayloadKind::Ack,
        }
    }

    pub fn data(bytes: impl Into<Bytes>) -> Self {
        SessionPayload::Data {
            bytes: bytes.into(),
            context: ContextProperties::new(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        SessionPayload::Error {
            code,
            message: message.into(),
            context: ContextProperties::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Init,
    Data,
    Confirm,
    Error,
    Close,
    Ack,
}

enum_str! {
    PayloadKind {
        Init => ["init"],
        Data => ["data"],
        Confirm => ["confirm"],
        Error => ["error"],
        Close => ["close"],
        Ack => ["ack"],
    }
}

impl PayloadKind {
    /// Whether events of this kind take a slot in the sender's sequence.
    pub fn is_sequenced(self) -> bool {
        !matches!(self, PayloadKind::Ack)
    }
}

/// Wire unit exchanged between the two parties of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    /// Sender-assigned sequence, zero for unsequenced payloads.
    pub sequence: u64,
    pub direction: Direction,
    pub payload: SessionPayload,
    #[serde(rename = "timestamp_ms")]
    pub timestamp: WallClock,
    pub initiating_party: PartyId,
    pub initiated_party: PartyId,
    /// Whether the initiating party sent this event.
    pub from_initiator: bool,
    /// Cumulative acknowledgement of the sender's receive side.
    #[serde(default)]
    pub received_sequence: Seq0,
}

impl SessionEvent {
    /// Unsequenced outbound event; the state machine stamps `sequence` and
    /// `received_sequence`.
    pub fn outbound(
        session_id: SessionId,
        initiating_party: PartyId,
        initiated_party: PartyId,
        from_initiator: bool,
        payload: SessionPayload,
        timestamp: WallClock,
    ) -> Self {
        Self {
            session_id,
            sequence: 0,
            direction: Direction::Outbound,
            payload,
            timestamp,
            initiating_party,
            initiated_party,
            from_initiator,
            received_sequence: Seq0::ZERO,
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn seq1(&self) -> Option<Seq1> {
        Seq1::from_u64(self.sequence)
    }

    pub fn source(&self) -> &PartyId {
        if self.from_initiator {
            &self.initiating_party
        } else {
            &self.initiated_party
        }
    }

    pub fn destination(&self) -> &PartyId {
        if self.from_initiator {
            &self.initiated_party
        } else {
            &self.initiating_party
        }
    }

    /// Copy of this event as the receiving party sees it.
    pub fn into_inbound(mut self) -> Self {
        self.direction = Direction::Inbound;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party(raw: &str) -> PartyId {
        PartyId::parse(raw).unwrap()
    }

    #[test]
    fn context_set_replaces_in_place() {
        let mut ctx = ContextProperties::new()
            .with("a", "1", ContextScope::User)
            .with("b", "2", ContextScope::Platform);
        ctx.set("a", "3", ContextScope::Platform);
        let keys: Vec<_> = ctx.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(ctx.get("a"), Some("3"));
        assert_eq!(ctx.scoped(ContextScope::Platform).count(), 2);
    }

    #[test]
    fn source_and_destination_follow_sender() {
        let alice = party("alice@g1");
        let bob = party("bob@g2");
        let mut event = SessionEvent::outbound(
            SessionId::new("s1").unwrap(),
            alice.clone(),
            bob.clone(),
            true,
            SessionPayload::Close,
            WallClock(1),
        );
        assert_eq!(event.source(), &alice);
        assert_eq!(event.destination(), &bob);
        event.from_initiator = false;
        assert_eq!(event.source(), &bob);
        assert_eq!(event.destination(), &alice);
    }

    #[test]
    fn ack_is_the_only_unsequenced_kind() {
        assert!(!PayloadKind::Ack.is_sequenced());
        for kind in [
            PayloadKind::Init,
            PayloadKind::Data,
            PayloadKind::Confirm,
            PayloadKind::Error,
            PayloadKind::Close,
        ] {
            assert!(kind.is_sequenced(), "{kind}");
        }
    }

    #[test]
    fn event_wire_shape_uses_tagged_payload() {
        let event = SessionEvent::outbound(
            SessionId::new("s1").unwrap(),
            party("alice@g1"),
            party("bob@g2"),
            true,
            SessionPayload::Close,
            WallClock(42),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "close");
        assert_eq!(json["direction"], "OUTBOUND");
        assert_eq!(json["timestamp_ms"], 42);
        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
