//! Partition-aware session facade.
//!
//! The manager owns the session states of the partitions assigned to this
//! worker, feeds inbound records and application requests through the state
//! machine, and routes whatever the machine emits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use flowbus_core::{
    ContextProperties, Direction, ErrorCode, InstanceId, Limits, PartitionId, PartyId,
    PayloadKind, Seq0, SessionCheckpoint, SessionEvent, SessionId, SessionKey, SessionPayload,
    SessionState, SessionStatus, WallClock, partition_for,
};

use super::error::SessionError;
use super::machine::{LifecycleNotice, SessionStateMachine, Transition};
use super::negotiator::ProtocolNegotiator;
use crate::bus::{InboundRecord, OutboundRecord};
use crate::config::Config;
use crate::metrics;
use crate::router::{Router, Topology};

/// A record that could not be applied.
#[derive(Debug)]
pub struct RejectedRecord {
    pub partition: PartitionId,
    pub key: String,
    pub error: SessionError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictReason {
    /// Closed or failed with nothing left for the application.
    Finished,
    /// Quiet past the inactivity timeout before finishing.
    Idle,
}

/// A session dropped from memory by `SessionManager::evict`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictedSession {
    pub key: SessionKey,
    pub status: SessionStatus,
    pub reason: EvictReason,
}

/// What processing one or more events produced.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// Routed records the caller must publish, in order.
    pub records: Vec<OutboundRecord>,
    /// Data newly available through `get_next_received_event`.
    pub delivered: Vec<SessionEvent>,
    pub notices: Vec<LifecycleNotice>,
    pub rejected: Vec<RejectedRecord>,
}

impl ProcessOutcome {
    fn extend(&mut self, other: ProcessOutcome) {
        self.records.extend(other.records);
        self.delivered.extend(other.delivered);
        self.notices.extend(other.notices);
        self.rejected.extend(other.rejected);
    }
}

pub struct SessionManager {
    instance: InstanceId,
    machine: SessionStateMachine,
    router: Router,
    topology: Arc<dyn Topology>,
    limits: Limits,
    partition_count: u32,
    owned: BTreeSet<PartitionId>,
    sessions: BTreeMap<PartitionId, BTreeMap<SessionKey, SessionState>>,
}

impl SessionManager {
    pub fn new(config: &Config, topology: Arc<dyn Topology>) -> Self {
        let negotiator = Arc::new(ProtocolNegotiator::new(&config.protocols));
        Self {
            instance: config.instance.instance_id(),
            machine: SessionStateMachine::new(&config.limits, negotiator),
            router: Router::new(&config.topics),
            topology,
            limits: config.limits.clone(),
            partition_count: config.instance.partition_count.max(1),
            owned: BTreeSet::new(),
            sessions: BTreeMap::new(),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn partition_of(&self, session_id: &SessionId) -> PartitionId {
        partition_for(session_id.as_str(), self.partition_count)
    }

    pub fn owns(&self, partition: PartitionId) -> bool {
        self.owned.contains(&partition)
    }

    /// Take ownership of `partition`, restore its checkpointed sessions and
    /// resend whatever they still hold undelivered.
    pub fn assign(
        &mut self,
        partition: PartitionId,
        checkpoints: Vec<SessionCheckpoint>,
        now: WallClock,
    ) -> Result<Vec<OutboundRecord>, SessionError> {
        let mut restored = BTreeMap::new();
        for checkpoint in checkpoints {
            let state = checkpoint.into_state()?;
            let placed = self.partition_of(&state.session_id);
            if placed != partition {
                return Err(SessionError::Malformed {
                    session_id: state.session_id,
                    reason: format!("checkpoint belongs to partition {placed}, not {partition}"),
                });
            }
            restored.insert(state.key(), state);
        }

        let mut records = Vec::new();
        for state in restored.values_mut() {
            let resent = self.machine.resend(state, now);
            records.extend(self.router.route_all(resent, self.topology.as_ref()));
        }

        tracing::info!(
            instance = %self.instance,
            %partition,
            sessions = restored.len(),
            resent = records.len(),
            "partition assigned"
        );
        metrics::sessions_active(self.instance, partition, restored.len());
        self.owned.insert(partition);
        self.sessions.insert(partition, restored);
        Ok(records)
    }

    /// Give up `partition`, returning checkpoints of the sessions it held.
    pub fn revoke(&mut self, partition: PartitionId) -> Vec<SessionCheckpoint> {
        self.owned.remove(&partition);
        let sessions = self.sessions.remove(&partition).unwrap_or_default();
        tracing::info!(
            instance = %self.instance,
            %partition,
            sessions = sessions.len(),
            "partition revoked"
        );
        metrics::sessions_active(self.instance, partition, 0);
        sessions.values().map(SessionState::checkpoint).collect()
    }

    pub fn session(&self, key: &SessionKey) -> Option<&SessionState> {
        self.sessions
            .get(&self.partition_of(&key.session))?
            .get(key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.values().map(BTreeMap::len).sum()
    }

    /// Apply one record from the session topic.
    ///
    /// Protocol violations by the sender are answered with an Error and
    /// reported in `rejected`; failures of the caller's own request are
    /// returned as errors.
    pub fn process_event(
        &mut self,
        record: InboundRecord,
        now: WallClock,
    ) -> Result<ProcessOutcome, SessionError> {
        let partition = self.partition_of(&record.event.session_id);
        if partition != record.partition {
            return Err(SessionError::Malformed {
                session_id: record.event.session_id,
                reason: format!(
                    "record consumed from partition {}, session lives on {partition}",
                    record.partition
                ),
            });
        }
        if !self.owns(partition) {
            return Err(SessionError::PartitionNotOwned { partition });
        }

        let event = record.event;
        let local = match event.direction {
            Direction::Inbound => event.destination().clone(),
            Direction::Outbound => event.source().clone(),
        };
        let key = SessionKey::new(local, event.session_id.clone());
        let _span = tracing::debug_span!(
            "process_event",
            session_id = %key.session,
            party = %key.party,
            %partition,
            sequence = event.sequence
        )
        .entered();

        let inbound = event.direction == Direction::Inbound;
        let reply_to = inbound.then(|| event.clone());
        match self.apply(partition, &key, event, now) {
            Ok(outcome) => Ok(outcome),
            Err(err @ (SessionError::UnknownSession { .. } | SessionError::Malformed { .. }))
                if inbound =>
            {
                let mut outcome = ProcessOutcome::default();
                if let Some(offending) = reply_to
                    && let Some(reply) = error_reply(&offending, &err, now)
                {
                    outcome
                        .records
                        .push(self.router.route(reply, self.topology.as_ref()));
                }
                tracing::warn!("rejected inbound event: {err}");
                outcome.rejected.push(RejectedRecord {
                    partition,
                    key: key.session.as_str().to_string(),
                    error: err,
                });
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply a batch in log order. Records that fail are collected in
    /// `rejected` and do not stop the batch.
    pub fn process_events(
        &mut self,
        records: Vec<InboundRecord>,
        now: WallClock,
    ) -> Result<ProcessOutcome, SessionError> {
        if records.len() > self.limits.max_batch_events {
            return Err(SessionError::BatchTooLarge {
                len: records.len(),
                limit: self.limits.max_batch_events,
            });
        }
        let started = Instant::now();
        let total = records.len();
        let mut outcome = ProcessOutcome::default();
        for record in records {
            let partition = record.partition;
            let key = record.key.clone();
            match self.process_event(record, now) {
                Ok(processed) => outcome.extend(processed),
                Err(error) => {
                    tracing::warn!(%partition, key, "record rejected: {error}");
                    outcome.rejected.push(RejectedRecord {
                        partition,
                        key,
                        error,
                    });
                }
            }
        }
        metrics::batch_processed(total, started.elapsed());
        Ok(outcome)
    }

    /// Open a session from `local` to `counterparty` for an initiating flow.
    pub fn initiate(
        &mut self,
        local: &PartyId,
        counterparty: &PartyId,
        flow: &str,
        session_id: SessionId,
        context: ContextProperties,
        now: WallClock,
    ) -> Result<ProcessOutcome, SessionError> {
        let record = self.machine.negotiator().resolve(local, flow)?;
        let partition = self.owned_partition(&session_id)?;
        let key = SessionKey::new(local.clone(), session_id.clone());
        let init = SessionEvent::outbound(
            session_id,
            local.clone(),
            counterparty.clone(),
            true,
            SessionPayload::Init {
                protocol_name: record.protocol_name.clone(),
                versions: record.offer(),
                context,
            },
            now,
        );
        self.apply(partition, &key, init, now)
    }

    pub fn send_data(
        &mut self,
        key: &SessionKey,
        bytes: impl Into<Bytes>,
        context: ContextProperties,
        now: WallClock,
    ) -> Result<ProcessOutcome, SessionError> {
        self.send(
            key,
            SessionPayload::Data {
                bytes: bytes.into(),
                context,
            },
            now,
        )
    }

    pub fn close(&mut self, key: &SessionKey, now: WallClock) -> Result<ProcessOutcome, SessionError> {
        self.send(key, SessionPayload::Close, now)
    }

    /// Fail the session locally; the peer is told once.
    pub fn fail(
        &mut self,
        key: &SessionKey,
        code: ErrorCode,
        message: impl Into<String>,
        now: WallClock,
    ) -> Result<ProcessOutcome, SessionError> {
        self.send(key, SessionPayload::error(code, message), now)
    }

    /// Oldest in-order Data not yet acknowledged by the application.
    pub fn get_next_received_event(
        &self,
        key: &SessionKey,
    ) -> Result<Option<&SessionEvent>, SessionError> {
        let state = self.owned_session(key)?;
        Ok(state.receive_state.pending.front())
    }

    /// The application consumed the Data with `sequence`; it must be the
    /// oldest pending one.
    pub fn acknowledge_received_event(
        &mut self,
        key: &SessionKey,
        sequence: u64,
    ) -> Result<(), SessionError> {
        let state = self.owned_session_mut(key)?;
        let front = state.receive_state.pending.front().map(|event| event.sequence);
        if front != Some(sequence) {
            return Err(SessionError::AckMismatch {
                key: key.clone(),
                expected: front,
                got: sequence,
            });
        }
        state.receive_state.pending.pop_front();
        tracing::trace!(session_id = %key.session, sequence, "application consumed event");
        Ok(())
    }

    /// Resend everything the peer has not acknowledged yet.
    pub fn resend_undelivered(
        &mut self,
        key: &SessionKey,
        now: WallClock,
    ) -> Result<Vec<OutboundRecord>, SessionError> {
        let partition = self.owned_partition(&key.session)?;
        let state = self
            .sessions
            .get_mut(&partition)
            .and_then(|sessions| sessions.get_mut(key))
            .ok_or_else(|| SessionError::UnknownSession { key: key.clone() })?;
        let resent = self.machine.resend(state, now);
        Ok(self.router.route_all(resent, self.topology.as_ref()))
    }

    pub fn checkpoint(&self, key: &SessionKey) -> Result<SessionCheckpoint, SessionError> {
        Ok(self.owned_session(key)?.checkpoint())
    }

    pub fn checkpoints(&self, partition: PartitionId) -> Vec<SessionCheckpoint> {
        self.sessions
            .get(&partition)
            .map(|sessions| sessions.values().map(SessionState::checkpoint).collect())
            .unwrap_or_default()
    }

    /// Fail sessions whose receive gap stayed open past the gap timeout.
    pub fn check_gap_timeouts(&mut self, now: WallClock) -> ProcessOutcome {
        let mut expired = Vec::new();
        for (partition, sessions) in &self.sessions {
            for state in sessions.values() {
                if let Some(tx) = self.machine.check_gap(state, now) {
                    expired.push((*partition, tx));
                }
            }
        }
        let mut outcome = ProcessOutcome::default();
        for (partition, tx) in expired {
            outcome.extend(self.commit(partition, tx));
        }
        outcome
    }

    /// Drop finished and idle sessions, reporting each one dropped.
    pub fn evict(&mut self, now: WallClock) -> Vec<EvictedSession> {
        let inactivity_ms = self.limits.session_inactivity_timeout_ms;
        let mut evicted = Vec::new();
        for (partition, sessions) in self.sessions.iter_mut() {
            let before = evicted.len();
            sessions.retain(|key, state| {
                let finished = match state.status {
                    SessionStatus::Closed => state.is_drained(),
                    SessionStatus::Error => state.receive_state.pending.is_empty(),
                    _ => false,
                };
                let reason = if finished {
                    EvictReason::Finished
                } else if state.idle_for(now) > inactivity_ms {
                    tracing::warn!(
                        session_id = %key.session,
                        party = %key.party,
                        status = %state.status,
                        idle_ms = state.idle_for(now),
                        "evicting unfinished idle session"
                    );
                    EvictReason::Idle
                } else {
                    return true;
                };
                tracing::debug!(
                    session_id = %key.session,
                    party = %key.party,
                    status = %state.status,
                    "session evicted"
                );
                evicted.push(EvictedSession {
                    key: key.clone(),
                    status: state.status,
                    reason,
                });
                false
            });
            if evicted.len() > before {
                metrics::sessions_active(self.instance, *partition, sessions.len());
            }
        }
        metrics::sessions_evicted(evicted.len());
        evicted
    }

    fn send(
        &mut self,
        key: &SessionKey,
        payload: SessionPayload,
        now: WallClock,
    ) -> Result<ProcessOutcome, SessionError> {
        let event = self.owned_session(key)?.outbound_event(payload, now);
        let partition = self.partition_of(&key.session);
        self.apply(partition, key, event, now)
    }

    fn apply(
        &mut self,
        partition: PartitionId,
        key: &SessionKey,
        event: SessionEvent,
        now: WallClock,
    ) -> Result<ProcessOutcome, SessionError> {
        let current = self
            .sessions
            .get(&partition)
            .and_then(|sessions| sessions.get(key));
        let tx = self.machine.apply(current, event, now)?;
        Ok(self.commit(partition, tx))
    }

    fn commit(&mut self, partition: PartitionId, tx: Transition) -> ProcessOutcome {
        let Transition {
            state,
            outbound,
            delivered,
            notices,
        } = tx;
        let records = self.router.route_all(outbound, self.topology.as_ref());
        self.sessions
            .entry(partition)
            .or_default()
            .insert(state.key(), state);
        ProcessOutcome {
            records,
            delivered,
            notices,
            rejected: Vec::new(),
        }
    }

    fn owned_partition(&self, session_id: &SessionId) -> Result<PartitionId, SessionError> {
        let partition = self.partition_of(session_id);
        if self.owns(partition) {
            Ok(partition)
        } else {
            Err(SessionError::PartitionNotOwned { partition })
        }
    }

    fn owned_session(&self, key: &SessionKey) -> Result<&SessionState, SessionError> {
        let partition = self.owned_partition(&key.session)?;
        self.sessions
            .get(&partition)
            .and_then(|sessions| sessions.get(key))
            .ok_or_else(|| SessionError::UnknownSession { key: key.clone() })
    }

    fn owned_session_mut(&mut self, key: &SessionKey) -> Result<&mut SessionState, SessionError> {
        let partition = self.owned_partition(&key.session)?;
        self.sessions
            .get_mut(&partition)
            .and_then(|sessions| sessions.get_mut(key))
            .ok_or_else(|| SessionError::UnknownSession { key: key.clone() })
    }
}

/// One-off Error answering an inbound event that has no session to land in.
/// Errors and Acks are never answered, so two parties without state cannot
/// bounce errors back and forth.
fn error_reply(offending: &SessionEvent, err: &SessionError, now: WallClock) -> Option<SessionEvent> {
    if matches!(offending.kind(), PayloadKind::Error | PayloadKind::Ack) {
        return None;
    }
    let code = match err {
        SessionError::UnknownSession { .. } => ErrorCode::UnknownSession,
        _ => ErrorCode::Malformed,
    };
    Some(SessionEvent {
        session_id: offending.session_id.clone(),
        sequence: 0,
        direction: Direction::Outbound,
        payload: SessionPayload::error(code, err.to_string()),
        timestamp: now,
        initiating_party: offending.initiating_party.clone(),
        initiated_party: offending.initiated_party.clone(),
        from_initiator: !offending.from_initiator,
        received_sequence: Seq0::ZERO,
    })
}
