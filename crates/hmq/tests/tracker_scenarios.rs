// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acknowledgment scenarios and properties of the unacknowledged-delivery
//! tracker, exercised through the public API.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

use hmq::delivery::{DeliveryTag, Session, UnackedTracker};

fn tags(tracker: &UnackedTracker<u64>) -> Vec<DeliveryTag> {
    tracker.delivery_tags()
}

#[test]
fn test_cumulative_then_single_ack_scenario() {
    let tracker: UnackedTracker<u64> = UnackedTracker::new();
    for tag in 1..=4 {
        tracker.add(tag, tag * 100).unwrap();
    }

    let removed = tracker.acknowledge(2, true);
    assert_eq!(removed.iter().map(|e| e.tag).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(tags(&tracker), vec![3, 4]);

    assert!(tracker.acknowledge(2, false).is_empty());
    assert_eq!(tags(&tracker), vec![3, 4]);

    let removed = tracker.acknowledge(4, false);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].tag, 4);
    assert_eq!(removed[0].message, 400);
    assert_eq!(tags(&tracker), vec![3]);
}

#[test]
fn test_size_matches_distinct_adds() {
    let mut rng = fastrand::Rng::with_seed(7);
    let tracker: UnackedTracker<u64> = UnackedTracker::new();
    let mut expected = BTreeSet::new();

    for _ in 0..500 {
        let tag = rng.u64(1..200);
        let fresh = expected.insert(tag);
        assert_eq!(tracker.add(tag, tag).is_ok(), fresh);
    }

    assert_eq!(tracker.size(), expected.len());
    assert_eq!(
        tracker.delivery_tags(),
        expected.into_iter().collect::<Vec<_>>()
    );
}

#[test]
fn test_cumulative_ack_removes_exactly_lower_tags() {
    let mut rng = fastrand::Rng::with_seed(0xACC);

    for _ in 0..100 {
        let tracker: UnackedTracker<u64> = UnackedTracker::new();
        let mut present = BTreeSet::new();
        for _ in 0..rng.usize(0..40) {
            let tag = rng.u64(1..100);
            if tracker.add(tag, tag).is_ok() {
                present.insert(tag);
            }
        }

        let cut = rng.u64(0..110);
        let removed: Vec<_> = tracker.acknowledge(cut, true).into_iter().map(|e| e.tag).collect();
        let expected: Vec<_> = present.iter().copied().filter(|t| *t <= cut).collect();

        assert_eq!(removed, expected);
        assert!(tracker.delivery_tags().iter().all(|t| *t > cut));
        assert_eq!(tracker.size(), present.len() - expected.len());
    }
}

#[test]
fn test_collect_agrees_with_acknowledge() {
    let mut rng = fastrand::Rng::with_seed(42);

    for _ in 0..100 {
        let tracker: UnackedTracker<u64> = UnackedTracker::new();
        for tag in 1..=30u64 {
            if rng.bool() {
                tracker.add(tag, tag).unwrap();
            }
        }
        let tag = rng.u64(0..35);
        let multiple = rng.bool();

        let mut once = BTreeMap::new();
        tracker.collect(tag, multiple, &mut once);
        let mut twice = BTreeMap::new();
        tracker.collect(tag, multiple, &mut twice);
        assert_eq!(once, twice);

        let acked: Vec<_> = tracker
            .acknowledge(tag, multiple)
            .into_iter()
            .map(|e| e.tag)
            .collect();
        assert_eq!(once.into_keys().collect::<Vec<_>>(), acked);
    }
}

#[test]
fn test_cancel_returns_everything() {
    let tracker: UnackedTracker<Vec<u8>> = UnackedTracker::new();
    for tag in [5u64, 2, 9, 1] {
        tracker.add(tag, vec![0u8; tag as usize]).unwrap();
    }
    let size = tracker.size();
    assert_eq!(tracker.unacknowledged_bytes(), 17);

    let cancelled = tracker.cancel_all_messages();
    assert_eq!(cancelled.len(), size);
    assert_eq!(
        cancelled.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![1, 2, 5, 9]
    );
    assert!(tracker.is_empty());
    assert_eq!(tracker.unacknowledged_bytes(), 0);
}

#[test]
fn test_session_ack_from_many_threads() {
    let mut session: Session<u64> = Session::new(None);
    for message in 0..1000u64 {
        session.deliver(message).unwrap();
    }
    let tracker = Arc::clone(session.tracker());

    // Disjoint single acks from several threads plus a concurrent observer
    let workers: Vec<_> = (0..4u64)
        .map(|lane| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let mut acked = 0usize;
                for tag in (1..=1000u64).filter(|t| t % 4 == lane) {
                    acked += tracker.acknowledge(tag, false).len();
                }
                acked
            })
        })
        .collect();

    let observer = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            for _ in 0..100 {
                let snapshot = tracker.delivery_tags();
                assert!(snapshot.windows(2).all(|w| w[0] < w[1]));
            }
        })
    };

    let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    observer.join().unwrap();

    assert_eq!(total, 1000);
    assert!(tracker.is_empty());
    assert_eq!(session.deliver(1).unwrap(), 1001);
}
