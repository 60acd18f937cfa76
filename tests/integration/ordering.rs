//! In-order delivery, gap buffering and the duplicate law.

use proptest::prelude::*;

use flowbus::session::{InboundOutcome, LifecycleNotice, SequenceTracker};
use flowbus::{
    ContextProperties, ErrorCode, Limits, PartyId, Seq0, SessionEvent, SessionId, SessionPayload,
    SessionStatus, WallClock,
};
use flowbus_core::ReceiveState;

use crate::fixtures::network::Network;
use crate::fixtures::parties::{CHAT_FLOW, alice, bob, key, session_id};

fn data(sequence: u64) -> SessionEvent {
    SessionEvent {
        sequence,
        ..SessionEvent::outbound(
            SessionId::new("ordering").expect("session id"),
            PartyId::parse("alice@g1").expect("party"),
            PartyId::parse("bob@g2").expect("party"),
            true,
            SessionPayload::data(sequence.to_be_bytes().to_vec()),
            WallClock(sequence),
        )
        .into_inbound()
    }
}

/// Feed `arrivals` to a fresh receive state; returns delivered sequences in
/// delivery order and the final state.
fn receive(arrivals: &[u64]) -> (Vec<u64>, ReceiveState) {
    let tracker = SequenceTracker::new(&Limits::default());
    let mut recv = ReceiveState::default();
    let mut delivered = Vec::new();
    for &sequence in arrivals {
        if let InboundOutcome::Delivered(batch) =
            tracker.record_inbound(&mut recv, data(sequence), WallClock(sequence))
        {
            delivered.extend(batch.iter().map(|event| event.sequence));
        }
    }
    (delivered, recv)
}

#[test]
fn two_one_three_delivers_one_two_three() {
    let (delivered, recv) = receive(&[2, 1, 3]);
    assert_eq!(delivered, vec![1, 2, 3]);
    assert_eq!(recv.last_processed, Seq0::new(3));
    assert!(recv.buffered_out_of_order.is_empty());
    assert!(recv.gap_started_at.is_none());
}

proptest! {
    #[test]
    fn any_arrival_order_delivers_each_sequence_once_in_order(
        order in (1usize..12).prop_flat_map(|n| Just((1..=n as u64).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let (delivered, recv) = receive(&order);
        let expected: Vec<u64> = (1..=order.len() as u64).collect();
        prop_assert_eq!(delivered, expected);
        prop_assert_eq!(recv.last_processed, Seq0::new(order.len() as u64));
    }

    #[test]
    fn processed_sequences_are_never_delivered_again(
        arrivals in prop::collection::vec(1u64..10, 0..40)
    ) {
        let (delivered, recv) = receive(&arrivals);
        // Deliveries form the contiguous prefix 1..=last_processed.
        let expected: Vec<u64> = (1..=delivered.len() as u64).collect();
        prop_assert_eq!(&delivered, &expected);
        prop_assert_eq!(recv.last_processed, Seq0::new(delivered.len() as u64));
        for sequence in recv.buffered_out_of_order.keys() {
            prop_assert!(sequence.get() > delivered.len() as u64 + 1);
        }
    }
}

#[test]
fn data_ahead_of_a_gap_waits_for_the_gap_to_fill() {
    let mut net = Network::two_groups();
    let sid = session_id(10);
    let init = net
        .node(&alice())
        .manager
        .initiate(&alice(), &bob(), CHAT_FLOW, sid.clone(), ContextProperties::new(), WallClock(1))
        .expect("initiate");
    net.publish(&alice(), &init);
    net.settle(WallClock(2));

    let alice_key = key(alice(), &sid);
    let bob_key = key(bob(), &sid);
    let mut sent = Vec::new();
    for n in 0u8..4 {
        let outcome = net
            .node(&alice())
            .manager
            .send_data(&alice_key, vec![n], ContextProperties::new(), WallClock(3))
            .expect("send data");
        sent.extend(outcome.records);
    }
    let sequences: Vec<u64> = sent.iter().map(|record| record.event.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4, 5]);

    net.deliver(&sent[..2], WallClock(4));
    net.settle(WallClock(4));
    assert_eq!(net.session(&bob_key).receive_state.last_processed, Seq0::new(3));

    let ahead = net.deliver(&sent[3..], WallClock(5));
    assert!(ahead.delivered.is_empty());
    let recv = &net.session(&bob_key).receive_state;
    assert_eq!(recv.last_processed, Seq0::new(3));
    assert_eq!(recv.buffered_out_of_order.len(), 1);
    assert_eq!(recv.gap_started_at, Some(WallClock(5)));
    // The acknowledgement is withheld while the gap is open.
    assert_eq!(net.drop_in_flight(), 0);

    let filled = net.deliver(&sent[2..3], WallClock(6));
    assert_eq!(filled.delivered_sequences(), vec![4, 5]);
    let recv = &net.session(&bob_key).receive_state;
    assert_eq!(recv.last_processed, Seq0::new(5));
    assert!(recv.buffered_out_of_order.is_empty());

    net.settle(WallClock(7));
    assert!(net.session(&alice_key).send_state.undelivered.is_empty());
}

#[test]
fn redelivered_data_is_acknowledged_but_not_delivered() {
    let mut net = Network::two_groups();
    let sid = session_id(11);
    let init = net
        .node(&alice())
        .manager
        .initiate(&alice(), &bob(), CHAT_FLOW, sid.clone(), ContextProperties::new(), WallClock(1))
        .expect("initiate");
    net.publish(&alice(), &init);
    net.settle(WallClock(2));

    let sent = net
        .node(&alice())
        .manager
        .send_data(&key(alice(), &sid), &b"once"[..], ContextProperties::new(), WallClock(3))
        .expect("send data");
    let first = net.deliver(&sent.records, WallClock(4));
    assert_eq!(first.delivered_sequences(), vec![2]);
    net.drop_in_flight();

    let again = net.deliver(&sent.records, WallClock(5));
    assert!(again.delivered.is_empty());
    assert_eq!(net.node(&bob()).log.records().len(), 1, "duplicate is acknowledged");
    net.settle(WallClock(6));

    assert_eq!(net.session(&key(bob(), &sid)).receive_state.pending.len(), 1);
    assert!(net.session(&key(alice(), &sid)).send_state.undelivered.is_empty());
}

#[test]
fn gap_that_never_closes_fails_both_sides() {
    let mut net = Network::two_groups();
    let sid = session_id(12);
    let init = net
        .node(&alice())
        .manager
        .initiate(&alice(), &bob(), CHAT_FLOW, sid.clone(), ContextProperties::new(), WallClock(1))
        .expect("initiate");
    net.publish(&alice(), &init);
    net.settle(WallClock(2));

    let alice_key = key(alice(), &sid);
    let bob_key = key(bob(), &sid);
    let mut sent = Vec::new();
    for n in 0u8..2 {
        let outcome = net
            .node(&alice())
            .manager
            .send_data(&alice_key, vec![n], ContextProperties::new(), WallClock(3))
            .expect("send data");
        sent.extend(outcome.records);
    }
    // Sequence 2 is lost on the way; only 3 arrives.
    net.deliver(&sent[1..], WallClock(5));
    assert_eq!(net.session(&bob_key).receive_state.gap_started_at, Some(WallClock(5)));

    let limit = net.node(&bob()).config.limits.gap_timeout_ms;
    let bob_node = net.node(&bob());
    assert!(bob_node.manager.check_gap_timeouts(WallClock(5 + limit)).notices.is_empty());
    let expired = bob_node.manager.check_gap_timeouts(WallClock(6 + limit));
    assert_eq!(expired.records.len(), 1);
    assert!(matches!(
        expired.records[0].event.payload,
        SessionPayload::Error {
            code: ErrorCode::GapTimeout,
            ..
        }
    ));
    assert!(matches!(
        expired.notices.as_slice(),
        [LifecycleNotice::Errored {
            code: ErrorCode::GapTimeout,
            raised_by_peer: false,
            ..
        }]
    ));
    net.publish(&bob(), &expired);
    let settled = net.settle(WallClock(7 + limit));

    assert_eq!(net.session(&bob_key).status, SessionStatus::Error);
    assert_eq!(net.session(&alice_key).status, SessionStatus::Error);
    assert!(net.session(&alice_key).send_state.undelivered.is_empty());
    let errored: Vec<&LifecycleNotice> = settled
        .notices
        .iter()
        .filter(|notice| matches!(notice, LifecycleNotice::Errored { .. }))
        .collect();
    assert!(matches!(
        errored.as_slice(),
        [LifecycleNotice::Errored {
            code: ErrorCode::GapTimeout,
            raised_by_peer: true,
            ..
        }]
    ));
}
