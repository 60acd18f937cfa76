//! Send and receive sequence bookkeeping.
//!
//! The tracker owns no state of its own; it applies one contract to the
//! `SendState` and `ReceiveState` halves of a session so the send and receive
//! paths cannot drift apart.

use flowbus_core::{
    Limits, ReceiveState, SendState, Seq0, Seq1, SessionEvent, UndeliveredMessage, WallClock,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Contiguous events now processed, in sequence order. Includes any
    /// buffered arrivals the new event made contiguous.
    Delivered(Vec<SessionEvent>),
    /// Already processed or already buffered; acknowledge again.
    Duplicate,
    /// Ahead of the expected sequence; buffered with the acknowledgement withheld.
    OutOfOrder { expected: Seq1, buffered: usize },
    Rejected(GapRejection),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapRejection {
    Overflow { limit: usize },
    Timeout { open_for_ms: u64, limit_ms: u64 },
    Unsequenced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UndeliveredFull {
    pub limit: usize,
}

#[derive(Clone, Debug)]
pub struct SequenceTracker {
    max_buffered: usize,
    gap_timeout_ms: u64,
    max_undelivered: usize,
}

impl SequenceTracker {
    pub fn new(limits: &Limits) -> Self {
        Self {
            max_buffered: limits.max_buffered_events,
            gap_timeout_ms: limits.gap_timeout_ms,
            max_undelivered: limits.max_undelivered_events,
        }
    }

    /// Assign the next send sequence to `event` and retain it for resend.
    pub fn record_outbound(
        &self,
        send: &mut SendState,
        mut event: SessionEvent,
        now: WallClock,
    ) -> Result<SessionEvent, UndeliveredFull> {
        if send.undelivered.len() >= self.max_undelivered {
            return Err(UndeliveredFull {
                limit: self.max_undelivered,
            });
        }
        let sequence = send.last_assigned.next();
        send.last_assigned = Seq0::from(sequence);
        event.sequence = sequence.get();
        send.undelivered.push_back(UndeliveredMessage {
            sequence,
            event: event.clone(),
            timestamp: now,
        });
        Ok(event)
    }

    /// Assign the next send sequence without retaining the event.
    pub fn assign_unretained(&self, send: &mut SendState, event: &mut SessionEvent) -> Seq1 {
        let sequence = send.last_assigned.next();
        send.last_assigned = Seq0::from(sequence);
        event.sequence = sequence.get();
        sequence
    }

    /// Drop every retained event up to and including `upto`. Returns how many
    /// were released; stale and future acknowledgements release nothing new.
    pub fn acknowledge(&self, send: &mut SendState, upto: Seq0) -> usize {
        if upto <= send.peer_acknowledged {
            return 0;
        }
        // The peer cannot acknowledge what was never sent.
        let upto = upto.min(send.last_assigned);
        send.peer_acknowledged = upto;
        let before = send.undelivered.len();
        while send
            .undelivered
            .front()
            .is_some_and(|msg| upto.covers(msg.sequence))
        {
            send.undelivered.pop_front();
        }
        before - send.undelivered.len()
    }

    pub fn record_inbound(
        &self,
        recv: &mut ReceiveState,
        event: SessionEvent,
        now: WallClock,
    ) -> InboundOutcome {
        let Some(seq) = event.seq1() else {
            return InboundOutcome::Rejected(GapRejection::Unsequenced);
        };
        if recv.last_processed.covers(seq) || recv.buffered_out_of_order.contains_key(&seq) {
            return InboundOutcome::Duplicate;
        }

        let expected = recv.expected();
        if seq != expected {
            return self.buffer_gap(recv, seq, event, now);
        }

        let mut batch = vec![event];
        recv.last_processed = Seq0::from(seq);
        let mut next = seq.next();
        while let Some(buffered) = recv.buffered_out_of_order.remove(&next) {
            batch.push(buffered);
            recv.last_processed = Seq0::from(next);
            next = next.next();
        }
        // Whatever is still buffered sits behind a new gap that opens now.
        recv.gap_started_at = if recv.buffered_out_of_order.is_empty() {
            None
        } else {
            Some(now)
        };
        InboundOutcome::Delivered(batch)
    }

    /// Whether the receive gap has been open longer than the gap timeout.
    pub fn gap_expired(&self, recv: &ReceiveState, now: WallClock) -> Option<GapRejection> {
        let started = recv.gap_started_at?;
        let open_for_ms = now.since(started);
        (open_for_ms > self.gap_timeout_ms).then_some(GapRejection::Timeout {
            open_for_ms,
            limit_ms: self.gap_timeout_ms,
        })
    }

    fn buffer_gap(
        &self,
        recv: &mut ReceiveState,
        seq: Seq1,
        event: SessionEvent,
        now: WallClock,
    ) -> InboundOutcome {
        match recv.gap_started_at {
            Some(_) => {
                if let Some(rejection) = self.gap_expired(recv, now) {
                    return InboundOutcome::Rejected(rejection);
                }
            }
            None => recv.gap_started_at = Some(now),
        }

        if recv.buffered_out_of_order.len() >= self.max_buffered {
            return InboundOutcome::Rejected(GapRejection::Overflow {
                limit: self.max_buffered,
            });
        }

        recv.buffered_out_of_order.insert(seq, event);
        InboundOutcome::OutOfOrder {
            expected: recv.expected(),
            buffered: recv.buffered_out_of_order.len(),
        }
    }
}
