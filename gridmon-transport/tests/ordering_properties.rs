//! Property-based tests for the sequence reordering buffer.

use gridmon_transport::{Envelope, SequenceBuffer};
use proptest::prelude::*;
use std::time::Duration;

fn envelope(sequence: i64) -> Envelope {
    Envelope::new(
        sequence.to_string().into_bytes(),
        "gridmon.features.prop",
        sequence,
    )
}

/// A shuffled permutation of 1..=n, driven by proptest's index shuffling.
fn permutation(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
    (1..=max_len).prop_flat_map(|len| {
        let ordered: Vec<i64> = (1..=len as i64).collect();
        Just(ordered).prop_shuffle()
    })
}

proptest! {
    /// Any permutation of 1..=N comes back out in strictly ascending
    /// sequence order once everything has been put.
    #[test]
    fn order_is_preserved_for_any_permutation(sequences in permutation(48)) {
        let len = sequences.len();
        // Capacity comfortably above N: no evictions, pure reordering.
        let mut buffer = SequenceBuffer::new("prop", len + 1, Duration::from_secs(60));
        let mut emitted = Vec::new();
        for sequence in sequences {
            buffer.put(envelope(sequence));
            emitted.extend(buffer.get(false).iter().map(|e| e.sequence));
        }
        emitted.extend(buffer.get(false).iter().map(|e| e.sequence));

        let expected: Vec<i64> = (1..=len as i64).collect();
        prop_assert_eq!(emitted, expected);
    }

    /// However messages arrive, the buffer never holds more than its
    /// capacity.
    #[test]
    fn memory_stays_bounded(
        sequences in proptest::collection::vec(1..200i64, 1..120),
        capacity in 1..16usize,
    ) {
        let mut buffer = SequenceBuffer::new("prop", capacity, Duration::from_secs(60));
        for sequence in sequences {
            buffer.put(envelope(sequence));
            prop_assert!(buffer.len() <= capacity.max(1));
        }
    }

    /// Whatever was put in, draining with `force` plus the held remainder
    /// never yields a duplicate sequence.
    #[test]
    fn no_sequence_is_emitted_twice(sequences in proptest::collection::vec(1..60i64, 1..80)) {
        let mut buffer = SequenceBuffer::new("prop", 128, Duration::from_secs(60));
        let mut emitted = Vec::new();
        for sequence in sequences {
            buffer.put(envelope(sequence));
            emitted.extend(buffer.get(false).iter().map(|e| e.sequence));
        }
        emitted.extend(buffer.get(true).iter().map(|e| e.sequence));

        let mut deduped = emitted.clone();
        deduped.sort_unstable();
        deduped.dedup();
        prop_assert_eq!(emitted.len(), deduped.len());
    }
}

#[test]
fn missing_sequence_is_skipped_after_the_tolerance_window() {
    let mut buffer = SequenceBuffer::new("gap", 16, Duration::from_millis(20));
    buffer.put(envelope(1));
    buffer.put(envelope(3));
    buffer.put(envelope(4));

    let first: Vec<i64> = buffer.get(false).iter().map(|e| e.sequence).collect();
    assert_eq!(first, vec![1]);

    // Sequence 2 never arrives; once the window elapses the buffer gives
    // up waiting and moves on.
    std::thread::sleep(Duration::from_millis(40));
    let rest: Vec<i64> = buffer.get(false).iter().map(|e| e.sequence).collect();
    assert_eq!(rest, vec![3, 4]);
    assert!(buffer.current_sequence() >= 3);
    assert_eq!(buffer.forced_skips(), 1);
}
