//! Dedup window expiry across partition ownership changes.

use std::sync::Arc;

use flowbus::bus::MemoryPublisher;
use flowbus::config::Config;
use flowbus::dedup::{ClearReason, DedupExpiryManager, ManualScheduler};
use flowbus::{DedupWindow, RequestKey, WallClock};

const STATE_TOPIC: &str = "flow.dedup.state";

fn worker() -> (DedupExpiryManager<ManualScheduler>, Arc<MemoryPublisher>) {
    let mut config = Config::default();
    config.instance.partition_count = 4;
    config.dedup.window_ms = 1000;
    let publisher = Arc::new(MemoryPublisher::new());
    let manager = DedupExpiryManager::new(&config, ManualScheduler::new(), publisher.clone());
    (manager, publisher)
}

fn k1() -> RequestKey {
    RequestKey::new("k1").expect("request key")
}

/// Fire due timers the way the service loop does.
fn advance(manager: &mut DedupExpiryManager<ManualScheduler>, now: WallClock) -> usize {
    let fired = manager.scheduler_mut().advance_to(now);
    let mut cleared = 0;
    for token in fired {
        if manager.on_timer_fired(token, now).expect("timer").is_some() {
            cleared += 1;
        }
    }
    cleared
}

#[test]
fn losing_the_partition_before_expiry_prevents_the_clear() {
    let (mut manager, publisher) = worker();
    let partition = manager.partition_of(&k1());
    let window = DedupWindow::new(k1(), WallClock(1000), partition);

    let cleared = manager
        .on_partition_acquired(partition, vec![window], WallClock(0))
        .expect("acquire");
    assert!(cleared.is_empty());
    assert_eq!(manager.timers_active(), 1);

    assert_eq!(manager.on_partition_lost(partition, &[k1()]), 1);
    assert_eq!(advance(&mut manager, WallClock(1000)), 0);
    assert!(publisher.tombstones(STATE_TOPIC).is_empty());
}

#[test]
fn a_timer_fired_before_the_loss_is_stale_afterwards() {
    let (mut manager, publisher) = worker();
    let partition = manager.partition_of(&k1());
    manager
        .on_partition_acquired(
            partition,
            vec![DedupWindow::new(k1(), WallClock(1000), partition)],
            WallClock(0),
        )
        .expect("acquire");

    let fired = manager.scheduler_mut().advance_to(WallClock(1000));
    assert_eq!(fired.len(), 1);
    manager.on_partition_lost(partition, &[k1()]);
    for token in fired {
        assert_eq!(manager.on_timer_fired(token, WallClock(1000)).expect("timer"), None);
    }
    assert!(publisher.tombstones(STATE_TOPIC).is_empty());
}

#[test]
fn the_next_owner_clears_on_schedule() {
    let (mut losing, losing_log) = worker();
    let (mut next, next_log) = worker();
    let partition = losing.partition_of(&k1());
    let window = DedupWindow::new(k1(), WallClock(1000), partition);

    losing
        .on_partition_acquired(partition, vec![window.clone()], WallClock(0))
        .expect("acquire");
    losing.on_partition_lost(partition, &[k1()]);
    next.on_partition_acquired(partition, vec![window], WallClock(500))
        .expect("acquire");

    assert_eq!(advance(&mut losing, WallClock(1000)), 0);
    assert_eq!(advance(&mut next, WallClock(999)), 0);
    assert_eq!(advance(&mut next, WallClock(1000)), 1);
    assert!(losing_log.tombstones(STATE_TOPIC).is_empty());
    assert_eq!(next_log.tombstones(STATE_TOPIC), vec!["k1".to_string()]);
}

#[test]
fn windows_synced_after_expiry_are_cleared_on_acquisition() {
    let (mut manager, publisher) = worker();
    let partition = manager.partition_of(&k1());
    let cleared = manager
        .on_partition_acquired(
            partition,
            vec![DedupWindow::new(k1(), WallClock(1000), partition)],
            WallClock(1001),
        )
        .expect("acquire");
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].reason, ClearReason::Expired);
    assert_eq!(manager.timers_active(), 0);
    assert_eq!(publisher.tombstones(STATE_TOPIC), vec!["k1".to_string()]);
}

#[test]
fn retracking_replaces_the_pending_timer() {
    let (mut manager, publisher) = worker();
    let partition = manager.partition_of(&k1());
    manager
        .on_partition_acquired(partition, Vec::new(), WallClock(0))
        .expect("acquire");

    let first = manager.track(k1(), WallClock(0)).expect("track");
    let second = manager.track(k1(), WallClock(600)).expect("track again");
    assert_eq!(first.expiry, WallClock(1000));
    assert_eq!(second.expiry, WallClock(1600));
    assert_eq!(manager.timers_active(), 1);

    assert_eq!(advance(&mut manager, WallClock(1000)), 0);
    assert!(manager.is_tracked(&k1()));
    assert_eq!(advance(&mut manager, WallClock(1600)), 1);
    assert!(!manager.is_tracked(&k1()));
    assert_eq!(publisher.tombstones(STATE_TOPIC), vec!["k1".to_string()]);
}
