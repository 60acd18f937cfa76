//! Per-session state and its checkpoint form.
//!
//! State is plain data. Every mutation goes through the session state
//! machine in the `flowbus` crate; the helpers here only enforce the
//! invariants that hold regardless of the transition being applied.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::error::CoreError;
use super::event::{ContextProperties, SessionEvent, SessionPayload};
use super::identity::{PartyId, SessionId, SessionKey};
use super::protocol::ProtocolName;
use super::seq::{Seq0, Seq1};
use super::time::WallClock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Confirmed,
    Closing,
    Closed,
    Error,
}

enum_str! {
    SessionStatus {
        Created => ["CREATED", "created"],
        Confirmed => ["CONFIRMED", "confirmed"],
        Closing => ["CLOSING", "closing"],
        Closed => ["CLOSED", "closed"],
        Error => ["ERROR", "error"],
    }
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::Confirmed => 1,
            SessionStatus::Closing => 2,
            SessionStatus::Closed => 3,
            SessionStatus::Error => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Error)
    }

    /// CREATED < CONFIRMED < CLOSING < CLOSED; ERROR from anywhere, and
    /// nothing leaves ERROR.
    pub fn can_become(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Error, _) => false,
            (_, SessionStatus::Error) => true,
            (current, next) => next.rank() >= current.rank(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiator,
    Responder,
}

enum_str! {
    SessionRole {
        Initiator => ["initiator"],
        Responder => ["responder"],
    }
}

/// A sent event not yet acknowledged by the peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndeliveredMessage {
    pub sequence: Seq1,
    pub event: SessionEvent,
    pub timestamp: WallClock,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendState {
    pub last_assigned: Seq0,
    pub peer_acknowledged: Seq0,
    /// Ascending by sequence.
    pub undelivered: VecDeque<UndeliveredMessage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiveState {
    pub last_processed: Seq0,
    pub buffered_out_of_order: BTreeMap<Seq1, SessionEvent>,
    /// In-order Data awaiting application consumption.
    pub pending: VecDeque<SessionEvent>,
    /// Set while `buffered_out_of_order` is non-empty.
    pub gap_started_at: Option<WallClock>,
}

impl ReceiveState {
    pub fn expected(&self) -> Seq1 {
        self.last_processed.next()
    }
}

/// One party's view of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: SessionId,
    pub local_party: PartyId,
    pub counterparty: PartyId,
    pub role: SessionRole,
    pub status: SessionStatus,
    pub protocol_name: ProtocolName,
    /// Agreed version; `None` until the initiator sees a Confirm.
    pub protocol_version: Option<u32>,
    /// Versions the initiator offered in its Init.
    pub offered_versions: Vec<u32>,
    pub send_state: SendState,
    pub receive_state: ReceiveState,
    pub last_received_timestamp: WallClock,
    pub context: ContextProperties,
    pub close_sent: bool,
    pub close_received: bool,
    pub error_sent: bool,
    pub created_at: WallClock,
}

impl SessionState {
    pub fn new(
        session_id: SessionId,
        local_party: PartyId,
        counterparty: PartyId,
        role: SessionRole,
        protocol_name: ProtocolName,
        now: WallClock,
    ) -> Self {
        Self {
            session_id,
            local_party,
            counterparty,
            role,
            status: SessionStatus::Created,
            protocol_name,
            protocol_version: None,
            offered_versions: Vec::new(),
            send_state: SendState::default(),
            receive_state: ReceiveState::default(),
            last_received_timestamp: now,
            context: ContextProperties::new(),
            close_sent: false,
            close_received: false,
            error_sent: false,
            created_at: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.local_party.clone(), self.session_id.clone())
    }

    pub fn is_initiator(&self) -> bool {
        self.role == SessionRole::Initiator
    }

    pub fn initiating_party(&self) -> &PartyId {
        match self.role {
            SessionRole::Initiator => &self.local_party,
            SessionRole::Responder => &self.counterparty,
        }
    }

    pub fn initiated_party(&self) -> &PartyId {
        match self.role {
            SessionRole::Initiator => &self.counterparty,
            SessionRole::Responder => &self.local_party,
        }
    }

    /// Move to `next`; returns false and leaves the status untouched when the
    /// move would go backwards or leave ERROR.
    pub fn advance(&mut self, next: SessionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Unsequenced outbound event from this party.
    pub fn outbound_event(&self, payload: SessionPayload, now: WallClock) -> SessionEvent {
        let mut event = SessionEvent::outbound(
            self.session_id.clone(),
            self.initiating_party().clone(),
            self.initiated_party().clone(),
            self.is_initiator(),
            payload,
            now,
        );
        event.received_sequence = self.receive_state.last_processed;
        event
    }

    /// Nothing left to send, resend or hand to the application.
    pub fn is_drained(&self) -> bool {
        self.send_state.undelivered.is_empty()
            && self.receive_state.pending.is_empty()
            && self.receive_state.buffered_out_of_order.is_empty()
    }

    pub fn idle_for(&self, now: WallClock) -> u64 {
        now.since(self.last_received_timestamp)
    }

    pub fn checkpoint(&self) -> SessionCheckpoint {
        SessionCheckpoint {
            session_id: self.session_id.clone(),
            status: self.status,
            last_processed_sequence_number: self.receive_state.last_processed,
            last_assigned_sequence_number: self.send_state.last_assigned,
            undelivered_messages: self.send_state.undelivered.iter().cloned().collect(),
            buffered_out_of_order: self
                .receive_state
                .buffered_out_of_order
                .values()
                .cloned()
                .collect(),
            local_party: self.local_party.clone(),
            counterparty: self.counterparty.clone(),
            role: self.role,
            protocol_name: self.protocol_name.clone(),
            protocol_version: self.protocol_version,
            offered_versions: self.offered_versions.clone(),
            peer_acknowledged_sequence_number: self.send_state.peer_acknowledged,
            pending_received: self.receive_state.pending.iter().cloned().collect(),
            gap_started_at: self.receive_state.gap_started_at,
            last_received_timestamp: self.last_received_timestamp,
            context: self.context.clone(),
            close_sent: self.close_sent,
            close_received: self.close_received,
            error_sent: self.error_sent,
            created_at: self.created_at,
        }
    }
}

/// Persisted form of a `SessionState`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCheckpoint {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub last_processed_sequence_number: Seq0,
    pub last_assigned_sequence_number: Seq0,
    pub undelivered_messages: Vec<UndeliveredMessage>,
    pub buffered_out_of_order: Vec<SessionEvent>,

    pub local_party: PartyId,
    pub counterparty: PartyId,
    pub role: SessionRole,
    pub protocol_name: ProtocolName,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub offered_versions: Vec<u32>,
    #[serde(default)]
    pub peer_acknowledged_sequence_number: Seq0,
    #[serde(default)]
    pub pending_received: Vec<SessionEvent>,
    #[serde(default)]
    pub gap_started_at: Option<WallClock>,
    pub last_received_timestamp: WallClock,
    #[serde(default)]
    pub context: ContextProperties,
    #[serde(default)]
    pub close_sent: bool,
    #[serde(default)]
    pub close_received: bool,
    #[serde(default)]
    pub error_sent: bool,
    pub created_at: WallClock,
}

impl SessionCheckpoint {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw).map_err(|err| CoreError::MalformedCheckpoint {
            reason: err.to_string(),
        })
    }

    /// Rebuild the session state, checking the sequence bookkeeping is
    /// consistent.
    pub fn into_state(self) -> Result<SessionState, CoreError> {
        let malformed = |reason: String| CoreError::MalformedCheckpoint { reason };

        if self.peer_acknowledged_sequence_number > self.last_assigned_sequence_number {
            return Err(malformed(format!(
                "peer acknowledged {} beyond last assigned {}",
                self.peer_acknowledged_sequence_number, self.last_assigned_sequence_number
            )));
        }

        let mut undelivered = VecDeque::with_capacity(self.undelivered_messages.len());
        let mut previous = self.peer_acknowledged_sequence_number;
        for message in self.undelivered_messages {
            let seq = message.sequence;
            if seq.get() <= previous.get() || seq.get() > self.last_assigned_sequence_number.get()
            {
                return Err(malformed(format!(
                    "undelivered sequence {seq} out of range ({previous}, {}]",
                    self.last_assigned_sequence_number
                )));
            }
            previous = Seq0::from(seq);
            undelivered.push_back(message);
        }

        let mut buffered = BTreeMap::new();
        for event in self.buffered_out_of_order {
            let Some(seq) = event.seq1() else {
                return Err(malformed("buffered event without a sequence".into()));
            };
            if self.last_processed_sequence_number.covers(seq) {
                return Err(malformed(format!(
                    "buffered sequence {seq} already processed ({})",
                    self.last_processed_sequence_number
                )));
            }
            buffered.insert(seq, event);
        }

        Ok(SessionState {
            session_id: self.session_id,
            local_party: self.local_party,
            counterparty: self.counterparty,
            role: self.role,
            status: self.status,
            protocol_name: self.protocol_name,
            protocol_version: self.protocol_version,
            offered_versions: self.offered_versions,
            send_state: SendState {
                last_assigned: self.last_assigned_sequence_number,
                peer_acknowledged: self.peer_acknowledged_sequence_number,
                undelivered,
            },
            receive_state: ReceiveState {
                last_processed: self.last_processed_sequence_number,
                gap_started_at: if buffered.is_empty() {
                    None
                } else {
                    self.gap_started_at
                },
                buffered_out_of_order: buffered,
                pending: self.pending_received.into(),
            },
            last_received_timestamp: self.last_received_timestamp,
            context: self.context,
            close_sent: self.close_sent,
            close_received: self.close_received,
            error_sent: self.error_sent,
            created_at: self.created_at,
        })
    }
}
