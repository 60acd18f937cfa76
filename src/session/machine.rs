//! Session lifecycle transitions.
//!
//! `SessionStateMachine::apply` takes the current state of one party's view
//! of a session plus one event and returns the next state together with the
//! events to publish, the Data newly available to the application and the
//! lifecycle notices for the workflow layer. It never mutates the state it
//! is given.

use std::sync::Arc;

use flowbus_core::{
    Direction, ErrorCode, Limits, NegotiatedProtocol, PartyId, PayloadKind, SessionEvent,
    SessionKey, SessionPayload, SessionRole, SessionState, SessionStatus, WallClock,
};

use super::error::SessionError;
use super::negotiator::{Negotiation, ProtocolNegotiator};
use super::tracker::{GapRejection, InboundOutcome, SequenceTracker};
use crate::metrics;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleNotice {
    /// A responder session was created for an inbound Init.
    Started {
        key: SessionKey,
        responder_flow: String,
        protocol: NegotiatedProtocol,
    },
    /// This party's own Init lost an initiation race and was abandoned.
    Superseded { key: SessionKey },
    Confirmed {
        key: SessionKey,
        protocol: NegotiatedProtocol,
    },
    Closing { key: SessionKey },
    Closed { key: SessionKey },
    Errored {
        key: SessionKey,
        code: ErrorCode,
        message: String,
        raised_by_peer: bool,
    },
}

impl LifecycleNotice {
    pub fn key(&self) -> &SessionKey {
        match self {
            LifecycleNotice::Started { key, .. }
            | LifecycleNotice::Superseded { key }
            | LifecycleNotice::Confirmed { key, .. }
            | LifecycleNotice::Closing { key }
            | LifecycleNotice::Closed { key }
            | LifecycleNotice::Errored { key, .. } => key,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub state: SessionState,
    pub outbound: Vec<SessionEvent>,
    /// In-order Data made available to the application by this transition.
    pub delivered: Vec<SessionEvent>,
    pub notices: Vec<LifecycleNotice>,
}

impl Transition {
    fn from_state(state: SessionState) -> Self {
        Self {
            state,
            outbound: Vec::new(),
            delivered: Vec::new(),
            notices: Vec::new(),
        }
    }

    fn key(&self) -> SessionKey {
        self.state.key()
    }

    fn notify_status(&mut self, status: SessionStatus) {
        metrics::status_changed(status);
        let key = self.key();
        match status {
            SessionStatus::Closing => self.notices.push(LifecycleNotice::Closing { key }),
            SessionStatus::Closed => self.notices.push(LifecycleNotice::Closed { key }),
            _ => {}
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionStateMachine {
    tracker: SequenceTracker,
    negotiator: Arc<ProtocolNegotiator>,
    max_payload_bytes: usize,
}

impl SessionStateMachine {
    pub fn new(limits: &Limits, negotiator: Arc<ProtocolNegotiator>) -> Self {
        Self {
            tracker: SequenceTracker::new(limits),
            negotiator,
            max_payload_bytes: limits.max_payload_bytes,
        }
    }

    pub fn negotiator(&self) -> &ProtocolNegotiator {
        &self.negotiator
    }

    pub fn apply(
        &self,
        current: Option<&SessionState>,
        event: SessionEvent,
        now: WallClock,
    ) -> Result<Transition, SessionError> {
        match event.direction {
            Direction::Inbound => self.apply_inbound(current, event, now),
            Direction::Outbound => self.apply_outbound(current, event, now),
        }
    }

    /// Retained events to publish again, with a fresh acknowledgement.
    pub fn resend(&self, state: &mut SessionState, now: WallClock) -> Vec<SessionEvent> {
        if state.status == SessionStatus::Error {
            return Vec::new();
        }
        let ack = state.receive_state.last_processed;
        let events: Vec<SessionEvent> = state
            .send_state
            .undelivered
            .iter_mut()
            .map(|message| {
                message.timestamp = now;
                let mut event = message.event.clone();
                event.received_sequence = ack;
                event.timestamp = now;
                event
            })
            .collect();
        metrics::events_resent(events.len());
        events
    }

    /// Fail the session if its receive gap has been open too long.
    pub fn check_gap(&self, state: &SessionState, now: WallClock) -> Option<Transition> {
        if state.status.is_terminal() {
            return None;
        }
        let rejection = self.tracker.gap_expired(&state.receive_state, now)?;
        let mut tx = Transition::from_state(state.clone());
        self.reject_gap(&mut tx, rejection, now);
        Some(tx)
    }

    fn apply_inbound(
        &self,
        current: Option<&SessionState>,
        event: SessionEvent,
        now: WallClock,
    ) -> Result<Transition, SessionError> {
        let local = event.destination().clone();
        let Some(state) = current else {
            return match event.payload {
                SessionPayload::Init { .. } => self.start_responder(local, event, now),
                _ => Err(SessionError::UnknownSession {
                    key: SessionKey::new(local, event.session_id.clone()),
                }),
            };
        };

        let mut tx = Transition::from_state(state.clone());
        if tx.state.status == SessionStatus::Error {
            tracing::debug!(
                session_id = %event.session_id,
                sequence = event.sequence,
                kind = %event.kind(),
                "ignoring event for failed session"
            );
            return Ok(tx);
        }
        if event.source() != &tx.state.counterparty {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: format!(
                    "sender {} is not the session counterparty {}",
                    event.source(),
                    tx.state.counterparty
                ),
            });
        }
        tx.state.last_received_timestamp = tx.state.last_received_timestamp.max(now);

        if let SessionPayload::Error { code, message, .. } = &event.payload {
            self.fail_from_peer(&mut tx, *code, message.clone(), now);
            return Ok(tx);
        }

        if is_init_race(&tx.state, &event) {
            return self.resolve_init_race(tx, event, now);
        }

        let released = self
            .tracker
            .acknowledge(&mut tx.state.send_state, event.received_sequence);
        if released > 0 {
            tracing::trace!(
                session_id = %event.session_id,
                released,
                acknowledged = %tx.state.send_state.peer_acknowledged,
                "peer acknowledged sent events"
            );
        }

        if event.kind() == PayloadKind::Ack {
            self.progress_close(&mut tx, now);
            return Ok(tx);
        }

        let session_id = event.session_id.clone();
        match self
            .tracker
            .record_inbound(&mut tx.state.receive_state, event, now)
        {
            InboundOutcome::Delivered(batch) => {
                for in_order in batch {
                    self.apply_in_order(&mut tx, in_order, now);
                    if tx.state.status == SessionStatus::Error {
                        return Ok(tx);
                    }
                }
                metrics::events_delivered(tx.delivered.len());
                self.progress_close(&mut tx, now);
                self.ensure_acknowledged(&mut tx, now);
            }
            InboundOutcome::Duplicate => {
                tracing::debug!(%session_id, "duplicate event, acknowledging again");
                metrics::duplicate_dropped();
                self.push_ack(&mut tx, now);
            }
            InboundOutcome::OutOfOrder { expected, buffered } => {
                tracing::debug!(%session_id, %expected, buffered, "buffered out-of-order event");
                metrics::out_of_order_buffered(buffered);
            }
            InboundOutcome::Rejected(rejection) => self.reject_gap(&mut tx, rejection, now),
        }
        Ok(tx)
    }

    fn start_responder(
        &self,
        local: PartyId,
        event: SessionEvent,
        now: WallClock,
    ) -> Result<Transition, SessionError> {
        let (protocol_name, versions, context) = match &event.payload {
            SessionPayload::Init {
                protocol_name,
                versions,
                context,
            } => (protocol_name.clone(), versions.clone(), context.clone()),
            _ => {
                return Err(SessionError::Malformed {
                    session_id: event.session_id.clone(),
                    reason: "responder sessions start from an Init".into(),
                });
            }
        };
        if !event.from_initiator || event.initiated_party != local {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: "Init must be sent by the initiating party".into(),
            });
        }
        if event.sequence != 1 {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: format!("Init carries sequence {}, expected 1", event.sequence),
            });
        }

        let mut state = SessionState::new(
            event.session_id.clone(),
            local.clone(),
            event.source().clone(),
            SessionRole::Responder,
            protocol_name.clone(),
            now,
        );
        state.offered_versions = versions.clone();
        state.context = context;

        let negotiation = self.negotiator.negotiate(&local, &protocol_name, &versions);
        let mut tx = Transition::from_state(state);
        // The Init occupies sequence 1 of the initiator's stream.
        match self
            .tracker
            .record_inbound(&mut tx.state.receive_state, event, now)
        {
            InboundOutcome::Delivered(_) => {}
            outcome => {
                return Err(SessionError::Malformed {
                    session_id: tx.state.session_id.clone(),
                    reason: format!("Init was not accepted as sequence 1: {outcome:?}"),
                });
            }
        }

        match negotiation {
            Negotiation::Agreed {
                protocol,
                responder_flow,
            } => {
                tx.state.protocol_version = Some(protocol.version);
                let confirm = tx.state.outbound_event(
                    SessionPayload::Confirm {
                        protocol_name: protocol.protocol_name.clone(),
                        version: protocol.version,
                    },
                    now,
                );
                match self
                    .tracker
                    .record_outbound(&mut tx.state.send_state, confirm, now)
                {
                    Ok(confirm) => tx.outbound.push(confirm),
                    Err(full) => {
                        self.fail(
                            &mut tx,
                            ErrorCode::Internal,
                            format!("undelivered limit {} reached", full.limit),
                            now,
                        );
                        return Ok(tx);
                    }
                }
                tx.state.advance(SessionStatus::Confirmed);
                metrics::status_changed(SessionStatus::Confirmed);
                tracing::info!(
                    session_id = %tx.state.session_id,
                    party = %tx.state.local_party,
                    protocol = %protocol.protocol_name,
                    version = protocol.version,
                    "responder session confirmed"
                );
                let key = tx.key();
                tx.notices.push(LifecycleNotice::Started {
                    key: key.clone(),
                    responder_flow,
                    protocol: protocol.clone(),
                });
                tx.notices.push(LifecycleNotice::Confirmed { key, protocol });
            }
            Negotiation::UnknownProtocol => {
                let message = format!("no responder for protocol {protocol_name}");
                self.fail(&mut tx, ErrorCode::ProtocolUnknown, message, now);
            }
            Negotiation::Incompatible { supported } => {
                let message = format!("offered versions {versions:?}, supported {supported:?}");
                self.fail(&mut tx, ErrorCode::VersionIncompatible, message, now);
            }
        }
        Ok(tx)
    }

    fn resolve_init_race(
        &self,
        mut tx: Transition,
        event: SessionEvent,
        now: WallClock,
    ) -> Result<Transition, SessionError> {
        let local = tx.state.local_party.clone();
        let winner = tx
            .state
            .session_id
            .initiation_winner(&local, &tx.state.counterparty)
            .clone();
        if winner == local {
            tracing::info!(
                session_id = %tx.state.session_id,
                party = %local,
                "initiation race won, ignoring peer Init"
            );
            return Ok(tx);
        }

        tracing::info!(
            session_id = %tx.state.session_id,
            party = %local,
            "initiation race lost, responding to peer Init"
        );
        let key = tx.key();
        let mut restarted = self.start_responder(local, event, now)?;
        restarted.state.created_at = tx.state.created_at;
        restarted
            .notices
            .insert(0, LifecycleNotice::Superseded { key });
        Ok(restarted)
    }

    fn apply_in_order(&self, tx: &mut Transition, event: SessionEvent, now: WallClock) {
        let status = tx.state.status;
        match &event.payload {
            SessionPayload::Confirm {
                protocol_name,
                version,
            } => {
                if !tx.state.is_initiator() || status != SessionStatus::Created {
                    self.fail(
                        tx,
                        ErrorCode::InvalidState,
                        format!("Confirm received while {status}"),
                        now,
                    );
                    return;
                }
                if protocol_name != &tx.state.protocol_name
                    || !tx.state.offered_versions.contains(version)
                {
                    let message = format!(
                        "Confirm for {protocol_name} v{version} does not match the offer {:?}",
                        tx.state.offered_versions
                    );
                    self.fail(tx, ErrorCode::VersionIncompatible, message, now);
                    return;
                }
                tx.state.protocol_version = Some(*version);
                tx.state.advance(SessionStatus::Confirmed);
                metrics::status_changed(SessionStatus::Confirmed);
                tracing::info!(
                    session_id = %tx.state.session_id,
                    party = %tx.state.local_party,
                    version,
                    "initiator session confirmed"
                );
                let key = tx.key();
                tx.notices.push(LifecycleNotice::Confirmed {
                    key,
                    protocol: NegotiatedProtocol {
                        protocol_name: protocol_name.clone(),
                        version: *version,
                    },
                });
            }
            SessionPayload::Data { .. } => {
                let accepting = status == SessionStatus::Confirmed
                    || (status == SessionStatus::Closing && !tx.state.close_received);
                if !accepting {
                    self.fail(
                        tx,
                        ErrorCode::InvalidState,
                        format!("Data received while {status}"),
                        now,
                    );
                    return;
                }
                tx.state.receive_state.pending.push_back(event.clone());
                tx.delivered.push(event);
            }
            SessionPayload::Close => {
                let accepting = matches!(status, SessionStatus::Confirmed | SessionStatus::Closing)
                    && !tx.state.close_received;
                if !accepting {
                    self.fail(
                        tx,
                        ErrorCode::InvalidState,
                        format!("Close received while {status}"),
                        now,
                    );
                    return;
                }
                tx.state.close_received = true;
                if status != SessionStatus::Closing && tx.state.advance(SessionStatus::Closing) {
                    tx.notify_status(SessionStatus::Closing);
                }
            }
            SessionPayload::Init { .. } => {
                self.fail(
                    tx,
                    ErrorCode::InvalidState,
                    format!("Init received while {status}"),
                    now,
                );
            }
            SessionPayload::Error { code, message, .. } => {
                self.fail_from_peer(tx, *code, message.clone(), now);
            }
            SessionPayload::Ack => {}
        }
    }

    /// Emit our Close once the peer has closed and our sends drained; finish
    /// once both Closes are exchanged and acknowledged.
    fn progress_close(&self, tx: &mut Transition, now: WallClock) {
        if tx.state.status.is_terminal() {
            return;
        }
        if tx.state.close_received
            && !tx.state.close_sent
            && tx.state.send_state.undelivered.is_empty()
        {
            let close = tx.state.outbound_event(SessionPayload::Close, now);
            match self
                .tracker
                .record_outbound(&mut tx.state.send_state, close, now)
            {
                Ok(close) => {
                    tx.outbound.push(close);
                    tx.state.close_sent = true;
                }
                Err(full) => {
                    let message = format!("undelivered limit {} reached", full.limit);
                    self.fail(tx, ErrorCode::Internal, message, now);
                    return;
                }
            }
        }
        if tx.state.close_sent
            && tx.state.close_received
            && tx.state.send_state.undelivered.is_empty()
            && tx.state.advance(SessionStatus::Closed)
        {
            tracing::info!(
                session_id = %tx.state.session_id,
                party = %tx.state.local_party,
                "session closed"
            );
            tx.notify_status(SessionStatus::Closed);
        }
    }

    fn ensure_acknowledged(&self, tx: &mut Transition, now: WallClock) {
        let processed = tx.state.receive_state.last_processed;
        let carried = tx
            .outbound
            .iter()
            .any(|event| event.received_sequence >= processed);
        if !carried {
            self.push_ack(tx, now);
        }
    }

    fn push_ack(&self, tx: &mut Transition, now: WallClock) {
        let ack = tx.state.outbound_event(SessionPayload::Ack, now);
        tx.outbound.push(ack);
    }

    fn reject_gap(&self, tx: &mut Transition, rejection: GapRejection, now: WallClock) {
        let (code, message) = match rejection {
            GapRejection::Overflow { limit } => (
                ErrorCode::GapOverflow,
                format!("more than {limit} out-of-order events buffered"),
            ),
            GapRejection::Timeout {
                open_for_ms,
                limit_ms,
            } => (
                ErrorCode::GapTimeout,
                format!("sequence gap open for {open_for_ms}ms (limit {limit_ms}ms)"),
            ),
            GapRejection::Unsequenced => (
                ErrorCode::Malformed,
                "sequenced payload without a sequence number".to_string(),
            ),
        };
        self.fail(tx, code, message, now);
    }

    fn fail_from_peer(&self, tx: &mut Transition, code: ErrorCode, message: String, now: WallClock) {
        self.enter_error(tx, ErrorCode::PeerError, code, message, true, now);
    }

    fn fail(&self, tx: &mut Transition, code: ErrorCode, message: String, now: WallClock) {
        self.enter_error(tx, code, code, message, false, now);
    }

    fn enter_error(
        &self,
        tx: &mut Transition,
        sent_code: ErrorCode,
        noticed_code: ErrorCode,
        message: String,
        raised_by_peer: bool,
        now: WallClock,
    ) {
        if !tx.state.advance(SessionStatus::Error) {
            tracing::debug!(
                session_id = %tx.state.session_id,
                status = %tx.state.status,
                "not failing session in terminal status"
            );
            return;
        }
        tracing::warn!(
            session_id = %tx.state.session_id,
            party = %tx.state.local_party,
            code = %noticed_code,
            raised_by_peer,
            "session failed: {message}"
        );
        metrics::session_failed(noticed_code);

        tx.state.send_state.undelivered.clear();
        tx.state.receive_state.buffered_out_of_order.clear();
        tx.state.receive_state.gap_started_at = None;

        if !tx.state.error_sent {
            let mut error = tx
                .state
                .outbound_event(SessionPayload::error(sent_code, message.clone()), now);
            self.tracker
                .assign_unretained(&mut tx.state.send_state, &mut error);
            tx.outbound.push(error);
            tx.state.error_sent = true;
        }

        let key = tx.key();
        tx.notices.push(LifecycleNotice::Errored {
            key,
            code: noticed_code,
            message,
            raised_by_peer,
        });
    }

    fn apply_outbound(
        &self,
        current: Option<&SessionState>,
        event: SessionEvent,
        now: WallClock,
    ) -> Result<Transition, SessionError> {
        let key = SessionKey::new(event.source().clone(), event.session_id.clone());
        let state = match (current, &event.payload) {
            (None, SessionPayload::Init { .. }) => return self.start_initiator(event, now),
            (Some(_), SessionPayload::Init { .. }) => {
                return Err(SessionError::SessionExists { key });
            }
            (None, _) => return Err(SessionError::UnknownSession { key }),
            (Some(state), _) => state,
        };
        if event.destination() != &state.counterparty {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: format!(
                    "event addressed to {}, session counterparty is {}",
                    event.destination(),
                    state.counterparty
                ),
            });
        }

        let mut tx = Transition::from_state(state.clone());
        match event.payload {
            SessionPayload::Data { bytes, context } => {
                self.send_data(&mut tx, SessionPayload::Data { bytes, context }, now)?;
            }
            SessionPayload::Close => self.send_close(&mut tx, now)?,
            SessionPayload::Error { code, message, .. } => {
                if tx.state.status == SessionStatus::Error {
                    return Ok(tx);
                }
                self.fail(&mut tx, code, message, now);
            }
            SessionPayload::Confirm { .. } | SessionPayload::Ack => {
                return Err(SessionError::Malformed {
                    session_id: tx.state.session_id.clone(),
                    reason: "Confirm and Ack are produced by the session itself".into(),
                });
            }
            SessionPayload::Init { .. } => return Err(SessionError::SessionExists { key }),
        }
        Ok(tx)
    }

    fn start_initiator(
        &self,
        event: SessionEvent,
        now: WallClock,
    ) -> Result<Transition, SessionError> {
        let SessionPayload::Init {
            protocol_name,
            versions,
            context,
        } = &event.payload
        else {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: "initiator sessions start from an Init".into(),
            });
        };
        if !event.from_initiator || event.source() != &event.initiating_party {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: "Init must be sent by the initiating party".into(),
            });
        }
        if event.initiating_party == event.initiated_party {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: "a party cannot open a session with itself".into(),
            });
        }
        if versions.is_empty() {
            return Err(SessionError::Malformed {
                session_id: event.session_id.clone(),
                reason: "Init offers no protocol versions".into(),
            });
        }

        let mut state = SessionState::new(
            event.session_id.clone(),
            event.initiating_party.clone(),
            event.initiated_party.clone(),
            SessionRole::Initiator,
            protocol_name.clone(),
            now,
        );
        state.offered_versions = versions.clone();
        state.context = context.clone();

        let init = state.outbound_event(event.payload.clone(), now);
        let mut tx = Transition::from_state(state);
        let init = self
            .tracker
            .record_outbound(&mut tx.state.send_state, init, now)
            .map_err(|full| SessionError::UndeliveredOverflow {
                session_id: tx.state.session_id.clone(),
                limit: full.limit,
            })?;
        tracing::info!(
            session_id = %tx.state.session_id,
            party = %tx.state.local_party,
            counterparty = %tx.state.counterparty,
            protocol = %tx.state.protocol_name,
            "session initiated"
        );
        tx.outbound.push(init);
        Ok(tx)
    }

    fn send_data(
        &self,
        tx: &mut Transition,
        payload: SessionPayload,
        now: WallClock,
    ) -> Result<(), SessionError> {
        let status = tx.state.status;
        let sending = status == SessionStatus::Confirmed
            || (status == SessionStatus::Closing && !tx.state.close_sent);
        if !sending {
            return Err(invalid_state(&tx.state, "send data"));
        }
        if let SessionPayload::Data { bytes, .. } = &payload
            && bytes.len() > self.max_payload_bytes
        {
            return Err(SessionError::PayloadTooLarge {
                session_id: tx.state.session_id.clone(),
                bytes: bytes.len(),
                limit: self.max_payload_bytes,
            });
        }
        let data = tx.state.outbound_event(payload, now);
        let data = self
            .tracker
            .record_outbound(&mut tx.state.send_state, data, now)
            .map_err(|full| SessionError::UndeliveredOverflow {
                session_id: tx.state.session_id.clone(),
                limit: full.limit,
            })?;
        tx.outbound.push(data);
        Ok(())
    }

    fn send_close(&self, tx: &mut Transition, now: WallClock) -> Result<(), SessionError> {
        let status = tx.state.status;
        if !matches!(status, SessionStatus::Confirmed | SessionStatus::Closing) {
            return Err(invalid_state(&tx.state, "close"));
        }
        if tx.state.close_sent {
            return Ok(());
        }
        let close = tx.state.outbound_event(SessionPayload::Close, now);
        let close = self
            .tracker
            .record_outbound(&mut tx.state.send_state, close, now)
            .map_err(|full| SessionError::UndeliveredOverflow {
                session_id: tx.state.session_id.clone(),
                limit: full.limit,
            })?;
        tx.outbound.push(close);
        tx.state.close_sent = true;
        if status != SessionStatus::Closing && tx.state.advance(SessionStatus::Closing) {
            tx.notify_status(SessionStatus::Closing);
        }
        self.progress_close(tx, now);
        Ok(())
    }
}

fn is_init_race(state: &SessionState, event: &SessionEvent) -> bool {
    matches!(event.payload, SessionPayload::Init { .. })
        && state.is_initiator()
        && state.status == SessionStatus::Created
        && event.from_initiator
        && event.initiating_party == state.counterparty
}

fn invalid_state(state: &SessionState, operation: &'static str) -> SessionError {
    SessionError::InvalidState {
        session_id: state.session_id.clone(),
        status: state.status,
        operation,
    }
}
