//! Collector stress: a long linked structure survives collection intact
//! while interleaved garbage is reclaimed, and the post-collection
//! footprint stays within expectations.

use core_heap::{format_value, Heap, PromiseState, NIL};
use num_bigint::BigInt;

const LIVE: usize = 5_000;

// Node layout: record with 3 slots (value, weight, next).
const NODE_PADS: usize = (2 + 3) + 2 + 2; // record + integer + double

fn slot(heap: &Heap, rec: usize, i: usize) -> usize {
    match heap.promise_state(rec, heap.record_slot(i)) {
        PromiseState::Fulfilled(v) => v,
        PromiseState::Waiting(_) => panic!("unfulfilled list field"),
    }
}

#[test]
fn linked_list_survives_collection() {
    let mut heap = Heap::new(2.0, 1);
    let head = heap.root(NIL);

    // 10 000 records: each live node is followed by an unreachable twin, so
    // half of everything allocated is garbage by construction.
    for i in (0..LIVE).rev() {
        let need = 2 * (Heap::reserve_record(3) + Heap::reserve_double())
            + Heap::reserve_integer(&BigInt::from(i))
            + Heap::reserve_integer(&BigInt::from(i + 1_000_000));
        if heap.reserve(need).is_err() {
            heap.gc(need);
        }
        let value = heap.claim_integer(&BigInt::from(i));
        let weight = heap.claim_double(i as f64 / 2.0);
        let node = heap.claim_record(1, 3);
        heap.instant_fulfill(node, heap.record_slot(0), value);
        heap.instant_fulfill(node, heap.record_slot(1), weight);
        let next = heap.get_root(head);
        if next != NIL {
            heap.instant_fulfill(node, heap.record_slot(2), next);
        }

        // The twin references the same value but nothing references it.
        let twin_value = heap.claim_integer(&BigInt::from(i + 1_000_000));
        let twin = heap.claim_record(2, 3);
        heap.instant_fulfill(twin, heap.record_slot(0), twin_value);
        let twin_weight = heap.claim_double(0.0);
        heap.instant_fulfill(twin, heap.record_slot(1), twin_weight);

        heap.set_root(head, node);
    }

    heap.gc(0);

    // Walk the whole list checking the field contents survived the copy.
    let mut cursor = heap.get_root(head);
    for i in 0..LIVE {
        let value = slot(&heap, cursor, 0);
        assert_eq!(heap.integer_value(value), BigInt::from(i));
        let weight = slot(&heap, cursor, 1);
        assert_eq!(heap.double_value(weight), i as f64 / 2.0);
        if i + 1 == LIVE {
            assert!(matches!(
                heap.promise_state(cursor, heap.record_slot(2)),
                PromiseState::Waiting(_)
            ));
        } else {
            cursor = slot(&heap, cursor, 2);
        }
    }

    // Live set stays within 1.5x of the ideal packed footprint.
    assert!(heap.used() <= LIVE * NODE_PADS * 8 * 3 / 2);
    assert!(heap.used() >= LIVE * (2 + 3) * 8);

    // Smoke the formatter against the survivors.
    let rendered = format_value(&heap, heap.get_root(head));
    assert!(rendered.starts_with("Con#1 0"));
}
