//! Per-stream sequence reordering buffer.
//!
//! Device monitors publish over concurrent broker channels, so messages for
//! one logical stream can arrive out of sequence order. Each
//! [`SequenceBuffer`] turns that arrival order back into ascending sequence
//! order within bounded memory and bounded wait:
//!
//! - **Bounded memory**: `pending + ready` never exceeds the configured
//!   capacity. When a new message would breach it, the lowest-sequence
//!   pending message is evicted to the ready lane (the gap below it is
//!   accepted permanently) and, if the total still overflows, the oldest
//!   ready message is dropped. Both events are warned, never silent.
//! - **Bounded wait**: a gap is only waited on for the tolerance window;
//!   after that the next pending message is emitted anyway (forced skip).
//!   A zero tolerance window means wait forever.
//!
//! The baseline starts at zero, so a stream is expected to count up from
//! sequence one. A sequence at or below zero signals a producer restart:
//! everything pending is flushed to the ready lane and the baseline rebases
//! to the incoming sequence.
//!
//! Emitted order is strictly ascending except across a stream reset or a
//! forced skip, both of which are observable in the logs. Reordering state
//! is keyed purely on the sequence integer.

use crate::message::Envelope;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Incoming sequences at or below this value reset the stream baseline.
const RESET_MARK: i64 = 0;

/// Reorders tagged messages for one logical stream.
#[derive(Debug)]
pub struct SequenceBuffer {
    /// Stream name, used only for observability
    stream: String,
    /// Joint bound on `pending` + `ready`
    capacity: usize,
    /// Gap patience; zero = wait forever
    tolerance: Duration,
    /// Highest sequence emitted (or skipped past); next in-order is
    /// `current + 1`
    current: i64,
    /// Out-of-order messages waiting for their turn, sorted by sequence
    pending: BTreeMap<i64, Envelope>,
    /// Reset flushes and overflow evictions, emitted at the head of the
    /// next `get` batch
    ready: VecDeque<Envelope>,
    /// When the current gap stops being tolerated; `None` while not waiting
    deadline: Option<Instant>,
    /// Messages discarded as late/duplicate
    late_discards: u64,
    /// Gaps skipped because the tolerance window elapsed
    forced_skips: u64,
    /// Ready messages dropped to hold the capacity bound
    overflow_drops: u64,
}

impl SequenceBuffer {
    /// Create a buffer for `stream` with the given capacity (clamped to
    /// ≥ 1) and gap tolerance.
    pub fn new(stream: impl Into<String>, capacity: usize, tolerance: Duration) -> Self {
        Self {
            stream: stream.into(),
            capacity: capacity.max(1),
            tolerance,
            current: RESET_MARK,
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            deadline: None,
            late_discards: 0,
            forced_skips: 0,
            overflow_drops: 0,
        }
    }

    /// Accept an envelope in arrival order.
    ///
    /// A sequence at or below zero resets the stream: everything pending is
    /// flushed straight to the ready lane (no ordering guarantee across the
    /// reset boundary) and the baseline becomes `sequence - 1`. Late or
    /// duplicate sequences are discarded with a warning.
    pub fn put(&mut self, envelope: Envelope) {
        let sequence = envelope.sequence;

        if sequence <= RESET_MARK {
            if !self.pending.is_empty() {
                warn!(
                    stream = %self.stream,
                    flushed = self.pending.len(),
                    sequence,
                    "stream reset, flushing pending messages without reordering"
                );
                let flushed = std::mem::take(&mut self.pending);
                self.ready.extend(flushed.into_values());
            }
            self.current = sequence - 1;
            self.deadline = None;
        }

        if sequence <= self.current {
            self.late_discards += 1;
            warn!(
                stream = %self.stream,
                sequence,
                current = self.current,
                "discarding late or duplicate message"
            );
            return;
        }

        if self.pending.contains_key(&sequence) {
            self.late_discards += 1;
            warn!(
                stream = %self.stream,
                sequence,
                "discarding duplicate of a pending sequence"
            );
            return;
        }

        self.pending.insert(sequence, envelope);

        // Accept a permanent gap rather than grow without bound.
        if self.pending.len() >= self.capacity
            && let Some((evicted, envelope)) = self.pending.pop_first()
        {
            self.current = self
                .pending
                .keys()
                .next()
                .map(|next| next - 1)
                .unwrap_or(evicted);
            warn!(
                stream = %self.stream,
                sequence = evicted,
                current = self.current,
                "buffer full, releasing lowest pending and accepting the gap below it"
            );
            self.ready.push_back(envelope);
        }

        while self.pending.len() + self.ready.len() > self.capacity {
            match self.ready.pop_front() {
                Some(dropped) => {
                    self.overflow_drops += 1;
                    warn!(
                        stream = %self.stream,
                        sequence = dropped.sequence,
                        "capacity exceeded, dropping oldest ready message"
                    );
                }
                None => break,
            }
        }
    }

    /// Emit every message that is cleared to leave the buffer.
    ///
    /// Ready-lane messages (reset flushes, overflow evictions) lead the
    /// batch; pending messages then pop while they are next-in-sequence,
    /// while `force` is set, or while the gap in front of them has outlived
    /// the tolerance window. Every emission refreshes the tolerance
    /// deadline; an empty pending set disarms it.
    pub fn get(&mut self, force: bool) -> Vec<Envelope> {
        let mut batch: Vec<Envelope> = self.ready.drain(..).collect();

        loop {
            let Some((&lowest, _)) = self.pending.first_key_value() else {
                self.deadline = None;
                break;
            };

            if force || lowest == self.current + 1 {
                self.emit(lowest, &mut batch);
                continue;
            }

            if self.tolerance.is_zero() {
                // Configured to wait forever on gaps.
                break;
            }

            match self.deadline {
                None => {
                    // A gap just appeared at the head; start the clock.
                    self.deadline = Some(Instant::now() + self.tolerance);
                    break;
                }
                Some(deadline) if Instant::now() >= deadline => {
                    self.forced_skips += 1;
                    warn!(
                        stream = %self.stream,
                        sequence = lowest,
                        expected = self.current + 1,
                        "gap outlived tolerance window, skipping ahead"
                    );
                    self.emit(lowest, &mut batch);
                }
                Some(_) => break,
            }
        }

        if !batch.is_empty() {
            debug!(stream = %self.stream, emitted = batch.len(), "sequence buffer emitted batch");
        }
        batch
    }

    fn emit(&mut self, sequence: i64, batch: &mut Vec<Envelope>) {
        if let Some(envelope) = self.pending.remove(&sequence) {
            self.current = sequence;
            batch.push(envelope);
        }
        if !self.tolerance.is_zero() {
            self.deadline = Some(Instant::now() + self.tolerance);
        }
    }

    /// Stream this buffer reorders.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Highest sequence emitted or skipped past so far.
    pub fn current_sequence(&self) -> i64 {
        self.current
    }

    /// Messages currently held (pending + ready).
    pub fn len(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    /// Whether the buffer holds no messages.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    /// Configured joint capacity bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Count of late/duplicate discards.
    pub fn late_discards(&self) -> u64 {
        self.late_discards
    }

    /// Count of tolerance-window forced skips.
    pub fn forced_skips(&self) -> u64 {
        self.forced_skips
    }

    /// Count of ready messages dropped on overflow.
    pub fn overflow_drops(&self) -> u64 {
        self.overflow_drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(sequence: i64) -> Envelope {
        Envelope::new(
            sequence.to_string().into_bytes(),
            "gridmon.features.t",
            sequence,
        )
    }

    fn sequences(batch: &[Envelope]) -> Vec<i64> {
        batch.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn in_order_messages_flow_straight_through() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        buffer.put(envelope(1));
        buffer.put(envelope(2));
        assert_eq!(sequences(&buffer.get(false)), vec![1, 2]);
        assert_eq!(buffer.current_sequence(), 2);
    }

    #[test]
    fn scrambled_arrivals_come_out_ascending() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        buffer.put(envelope(3));
        buffer.put(envelope(1));
        buffer.put(envelope(2));
        assert_eq!(sequences(&buffer.get(false)), vec![1, 2, 3]);
    }

    #[test]
    fn gap_holds_back_later_sequences() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        buffer.put(envelope(1));
        buffer.put(envelope(3));
        assert_eq!(sequences(&buffer.get(false)), vec![1]);
        // 3 stays parked behind the missing 2.
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn late_sequences_are_discarded() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        for sequence in 1..=3 {
            buffer.put(envelope(sequence));
        }
        buffer.get(false);
        buffer.put(envelope(2));
        assert!(buffer.is_empty());
        assert_eq!(buffer.late_discards(), 1);
    }

    #[test]
    fn duplicate_of_a_pending_sequence_is_discarded() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        buffer.put(envelope(4));
        buffer.put(envelope(7));
        buffer.put(envelope(7));
        assert_eq!(buffer.late_discards(), 1);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn high_first_sequence_waits_on_the_opening_gap() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        buffer.put(envelope(42));
        // Sequences 1..=41 are still owed; nothing emits unforced.
        assert!(buffer.get(false).is_empty());
        assert_eq!(sequences(&buffer.get(true)), vec![42]);
        assert_eq!(buffer.current_sequence(), 42);
    }

    #[test]
    fn sequence_at_or_below_zero_restarts_the_stream() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        buffer.put(envelope(1));
        assert_eq!(sequences(&buffer.get(false)), vec![1]);
        buffer.put(envelope(5));
        buffer.put(envelope(7));
        // 5 and 7 park behind the gaps at 2..=4 and 6.
        assert!(buffer.get(false).is_empty());

        buffer.put(envelope(0));
        let batch = buffer.get(false);
        // The flushed backlog leads, then the restart message in order.
        assert_eq!(sequences(&batch), vec![5, 7, 0]);
        assert_eq!(buffer.current_sequence(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn forced_get_drains_across_gaps() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_secs(5));
        buffer.put(envelope(1));
        buffer.put(envelope(4));
        buffer.put(envelope(8));
        assert_eq!(sequences(&buffer.get(true)), vec![1, 4, 8]);
        assert_eq!(buffer.current_sequence(), 8);
    }

    #[test]
    fn tolerance_window_skips_a_stuck_gap() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::from_millis(20));
        buffer.put(envelope(1));
        buffer.put(envelope(3));
        assert_eq!(sequences(&buffer.get(false)), vec![1]);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(sequences(&buffer.get(false)), vec![3]);
        assert_eq!(buffer.forced_skips(), 1);
        assert!(buffer.current_sequence() >= 3);
    }

    #[test]
    fn zero_tolerance_waits_forever() {
        let mut buffer = SequenceBuffer::new("t", 10, Duration::ZERO);
        buffer.put(envelope(1));
        buffer.put(envelope(3));
        assert_eq!(sequences(&buffer.get(false)), vec![1]);
        std::thread::sleep(Duration::from_millis(30));
        assert!(buffer.get(false).is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn overflow_releases_lowest_pending_and_accepts_the_gap() {
        let mut buffer = SequenceBuffer::new("t", 3, Duration::from_secs(5));
        buffer.put(envelope(2));
        buffer.put(envelope(5));
        buffer.put(envelope(9));
        // Third pending arrival hits capacity: 2 moves to the ready lane and
        // the baseline jumps to just below the new lowest pending.
        assert_eq!(buffer.current_sequence(), 4);
        let batch = buffer.get(false);
        // The evicted 2 leads, then 5 pops in order behind it.
        assert_eq!(sequences(&batch), vec![2, 5]);
        assert!(buffer.len() <= 3);
    }

    #[test]
    fn capacity_bounds_pending_plus_ready() {
        let mut buffer = SequenceBuffer::new("t", 4, Duration::from_secs(5));
        for sequence in [2, 9, 4, 12, 6, 15, 8, 20] {
            buffer.put(envelope(sequence));
            assert!(buffer.len() <= 4, "len {} exceeded capacity", buffer.len());
        }
        assert!(buffer.overflow_drops() > 0);
    }

    #[test]
    fn current_sequence_is_monotonic_outside_resets() {
        let mut buffer = SequenceBuffer::new("t", 8, Duration::from_secs(5));
        buffer.put(envelope(1));
        buffer.get(false);
        let mut previous = buffer.current_sequence();
        for sequence in [3, 7, 2, 11, 5, 9, 4] {
            buffer.put(envelope(sequence));
            buffer.get(false);
            assert!(buffer.current_sequence() >= previous);
            previous = buffer.current_sequence();
        }
    }
}
