//! Session lifecycle across instances and within one instance.

use flowbus::session::{EvictReason, LifecycleNotice, ProcessOutcome};
use flowbus::{
    ContextProperties, Direction, ErrorCode, PayloadKind, SessionId, SessionPayload, SessionStatus,
    WallClock,
};

use crate::fixtures::network::Network;
use crate::fixtures::parties::{CHAT_FLOW, alice, bob, carol, key, session_id};

fn initiate(net: &mut Network, to: &flowbus::PartyId, sid: &SessionId) -> ProcessOutcome {
    net.node(&alice())
        .manager
        .initiate(
            &alice(),
            to,
            CHAT_FLOW,
            sid.clone(),
            ContextProperties::new(),
            WallClock(1),
        )
        .expect("initiate")
}

fn confirmed(net: &mut Network, sid: &SessionId) {
    let init = initiate(net, &bob(), sid);
    net.publish(&alice(), &init);
    net.settle(WallClock(2));
    assert_eq!(net.session(&key(alice(), sid)).status, SessionStatus::Confirmed);
    assert_eq!(net.session(&key(bob(), sid)).status, SessionStatus::Confirmed);
}

#[test]
fn init_negotiates_the_common_version_across_groups() {
    let mut net = Network::two_groups();
    let sid = session_id(1);

    let init = initiate(&mut net, &bob(), &sid);
    assert_eq!(net.session(&key(alice(), &sid)).status, SessionStatus::Created);
    assert_eq!(init.records.len(), 1);
    assert_eq!(init.records[0].topic, "p2p.out");
    assert_eq!(init.records[0].key, sid.as_str());
    assert_eq!(init.records[0].event.direction, Direction::Outbound);
    assert_eq!(init.records[0].event.kind(), PayloadKind::Init);

    net.publish(&alice(), &init);
    let settled = net.settle(WallClock(2));

    let initiator = net.session(&key(alice(), &sid));
    assert_eq!(initiator.status, SessionStatus::Confirmed);
    assert_eq!(initiator.protocol_version, Some(1));
    let responder = net.session(&key(bob(), &sid));
    assert_eq!(responder.status, SessionStatus::Confirmed);
    assert_eq!(responder.protocol_version, Some(1));

    assert!(settled.notices.iter().any(|notice| matches!(
        notice,
        LifecycleNotice::Started { key, responder_flow, .. }
            if key.party == bob() && responder_flow == "ChatResponder"
    )));
    assert!(settled.notices.iter().any(|notice| matches!(
        notice,
        LifecycleNotice::Confirmed { key, protocol }
            if key.party == alice() && protocol.version == 1
    )));
    assert_eq!(settled.rejected, 0);
}

#[test]
fn local_counterparties_stay_on_the_session_topic() {
    let mut net = Network::two_groups();
    let sid = SessionId::for_pair(&alice(), &carol(), 1);

    let init = initiate(&mut net, &carol(), &sid);
    assert_eq!(init.records.len(), 1);
    assert_eq!(init.records[0].topic, "flow.session.event");
    assert_eq!(init.records[0].event.direction, Direction::Inbound);

    net.publish(&alice(), &init);
    net.settle(WallClock(2));
    assert_eq!(net.session(&key(carol(), &sid)).status, SessionStatus::Confirmed);
    assert!(
        net.node(&bob()).manager.session_count() == 0,
        "nothing crossed to the other group"
    );
}

#[test]
fn data_is_delivered_once_and_released_by_acknowledgement() {
    let mut net = Network::two_groups();
    let sid = session_id(2);
    confirmed(&mut net, &sid);

    for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        let sent = net
            .node(&alice())
            .manager
            .send_data(&key(alice(), &sid), payload, ContextProperties::new(), WallClock(3))
            .expect("send data");
        net.publish(&alice(), &sent);
    }
    let settled = net.settle(WallClock(4));
    assert_eq!(settled.delivered_sequences(), vec![2, 3, 4]);
    assert!(net.session(&key(alice(), &sid)).send_state.undelivered.is_empty());

    let bob_key = key(bob(), &sid);
    let bob_node = net.node(&bob());
    let mut received = Vec::new();
    while let Some(event) = bob_node
        .manager
        .get_next_received_event(&bob_key)
        .expect("owned session")
    {
        let SessionPayload::Data { bytes, .. } = &event.payload else {
            panic!("expected data, got {:?}", event.kind());
        };
        received.push(bytes.to_vec());
        let sequence = event.sequence;
        bob_node
            .manager
            .acknowledge_received_event(&bob_key, sequence)
            .expect("acknowledge");
    }
    assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}

#[test]
fn close_handshake_finishes_both_sides() {
    let mut net = Network::two_groups();
    let sid = session_id(3);
    confirmed(&mut net, &sid);

    let close = net
        .node(&alice())
        .manager
        .close(&key(alice(), &sid), WallClock(5))
        .expect("close");
    assert_eq!(net.session(&key(alice(), &sid)).status, SessionStatus::Closing);
    net.publish(&alice(), &close);
    let settled = net.settle(WallClock(6));

    assert_eq!(net.session(&key(alice(), &sid)).status, SessionStatus::Closed);
    assert_eq!(net.session(&key(bob(), &sid)).status, SessionStatus::Closed);
    let closed = settled
        .notices
        .iter()
        .filter(|notice| matches!(notice, LifecycleNotice::Closed { .. }))
        .count();
    assert_eq!(closed, 2);

    for party in [alice(), bob()] {
        let evicted = net.node(&party).manager.evict(WallClock(7));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, key(party, &sid));
        assert_eq!(evicted[0].reason, EvictReason::Finished);
    }
}

#[test]
fn local_failure_is_reported_to_the_peer_once() {
    let mut net = Network::two_groups();
    let sid = session_id(4);
    confirmed(&mut net, &sid);

    let failed = net
        .node(&alice())
        .manager
        .fail(&key(alice(), &sid), ErrorCode::Internal, "flow crashed", WallClock(5))
        .expect("fail");
    assert_eq!(failed.records.len(), 1);
    net.publish(&alice(), &failed);
    let settled = net.settle(WallClock(6));

    assert_eq!(net.session(&key(alice(), &sid)).status, SessionStatus::Error);
    assert_eq!(net.session(&key(bob(), &sid)).status, SessionStatus::Error);
    assert!(settled.notices.iter().any(|notice| matches!(
        notice,
        LifecycleNotice::Errored { key, raised_by_peer: true, .. } if key.party == bob()
    )));
    // Bob's own Error reaches Alice after she already failed and is ignored.
    let errored = settled
        .notices
        .iter()
        .filter(|notice| matches!(notice, LifecycleNotice::Errored { .. }))
        .count();
    assert_eq!(errored, 1);
}

#[test]
fn stray_events_are_answered_without_echo() {
    let mut net = Network::two_groups();
    let sid = session_id(5);
    confirmed(&mut net, &sid);

    let sent = net
        .node(&alice())
        .manager
        .send_data(&key(alice(), &sid), &b"late"[..], ContextProperties::new(), WallClock(3))
        .expect("send data");
    // Bob's instance forgets the session before the Data arrives.
    let bob_partition = net.node(&bob()).manager.partition_of(&sid);
    net.node(&bob()).manager.revoke(bob_partition);
    net.node(&bob())
        .manager
        .assign(bob_partition, Vec::new(), WallClock(3))
        .expect("assign");

    net.publish(&alice(), &sent);
    let settled = net.settle(WallClock(4));
    assert!(settled.delivered.is_empty());
    // Bob rejects the Data and then Alice's PeerError, which gets no reply.
    assert_eq!(settled.rejected, 2);
    assert_eq!(net.session(&key(alice(), &sid)).status, SessionStatus::Error);
}
