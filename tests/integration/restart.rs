//! Checkpoint, restart and resend.

use proptest::prelude::*;

use flowbus::{ContextProperties, SessionId, SessionStatus, WallClock};

use crate::fixtures::network::Network;
use crate::fixtures::parties::{CHAT_FLOW, alice, bob, key, session_id};

fn confirmed(net: &mut Network, sid: &SessionId) {
    let init = net
        .node(&alice())
        .manager
        .initiate(&alice(), &bob(), CHAT_FLOW, sid.clone(), ContextProperties::new(), WallClock(1))
        .expect("initiate");
    net.publish(&alice(), &init);
    net.settle(WallClock(2));
}

fn pending_sequences(net: &Network, sid: &SessionId) -> Vec<u64> {
    net.session(&key(bob(), sid))
        .receive_state
        .pending
        .iter()
        .map(|event| event.sequence)
        .collect()
}

#[test]
fn restart_resends_what_the_peer_never_acknowledged() {
    let mut net = Network::two_groups();
    let sid = session_id(20);
    confirmed(&mut net, &sid);

    let alice_key = key(alice(), &sid);
    let mut sent = Vec::new();
    for n in 0u8..3 {
        let outcome = net
            .node(&alice())
            .manager
            .send_data(&alice_key, vec![n], ContextProperties::new(), WallClock(3))
            .expect("send data");
        sent.extend(outcome.records);
    }
    net.deliver(&sent, WallClock(4));
    // Bob's acknowledgements are lost with Alice's consumer.
    assert_eq!(net.drop_in_flight(), 3);
    assert_eq!(net.session(&alice_key).send_state.undelivered.len(), 3);

    assert_eq!(net.node(&alice()).restart(WallClock(10)), 3);
    let restored = net.session(&alice_key);
    assert_eq!(restored.status, SessionStatus::Confirmed);
    assert_eq!(restored.send_state.undelivered.len(), 3);

    let settled = net.settle(WallClock(11));
    assert!(settled.delivered.is_empty());
    assert_eq!(pending_sequences(&net, &sid), vec![2, 3, 4]);
    assert!(net.session(&alice_key).send_state.undelivered.is_empty());
}

#[test]
fn restart_of_the_receiver_keeps_pending_data() {
    let mut net = Network::two_groups();
    let sid = session_id(21);
    confirmed(&mut net, &sid);

    let sent = net
        .node(&alice())
        .manager
        .send_data(&key(alice(), &sid), &b"kept"[..], ContextProperties::new(), WallClock(3))
        .expect("send data");
    net.publish(&alice(), &sent);
    net.settle(WallClock(4));

    assert_eq!(net.node(&bob()).restart(WallClock(5)), 0);
    assert_eq!(pending_sequences(&net, &sid), vec![2]);
    let bob_key = key(bob(), &sid);
    net.node(&bob())
        .manager
        .acknowledge_received_event(&bob_key, 2)
        .expect("acknowledge after restart");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn resending_never_changes_what_was_delivered(
        (sent, reached) in (1usize..6).prop_flat_map(|n| (Just(n), 0..=n)),
        resends in 1usize..4,
        restart in any::<bool>(),
    ) {
        let mut net = Network::two_groups();
        let sid = session_id(30);
        confirmed(&mut net, &sid);

        let alice_key = key(alice(), &sid);
        let mut records = Vec::new();
        for n in 0..sent {
            let outcome = net
                .node(&alice())
                .manager
                .send_data(&alice_key, vec![n as u8], ContextProperties::new(), WallClock(3))
                .expect("send data");
            records.extend(outcome.records);
        }
        net.deliver(&records[..reached], WallClock(4));
        net.drop_in_flight();

        if restart {
            net.node(&alice()).restart(WallClock(5));
        }
        for _ in 0..resends {
            let resent = net
                .node(&alice())
                .manager
                .resend_undelivered(&alice_key, WallClock(6))
                .expect("resend");
            prop_assert_eq!(resent.len(), sent);
            net.node(&alice()).publish(&resent);
        }
        net.settle(WallClock(7));

        let expected: Vec<u64> = (2..2 + sent as u64).collect();
        prop_assert_eq!(pending_sequences(&net, &sid), expected);
        prop_assert!(net.session(&alice_key).send_state.undelivered.is_empty());
    }
}
