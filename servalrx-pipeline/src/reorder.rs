//! Chunk-aware reordering of sequenced SPIDR packets.
//!
//! SPIDR packet-id words (top byte 0x50) carry a 48-bit counter that is
//! monotonic within a chunk and resets at chunk boundaries. The buffer
//! restores monotonic order within a bounded window around the next
//! expected id: in-window stragglers are held and released consecutively,
//! too-old ids are dropped, and anything arriving while the buffer is full
//! is released immediately and tallied as an overflow.

use std::collections::HashMap;

/// Default window size, matching the `--reorder-window` CLI default.
pub const DEFAULT_WINDOW: usize = 1000;

/// Counters kept by the reorder buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Every packet submitted.
    pub total_packets: u64,
    /// Packets released on arrival because they matched the expected id.
    pub packets_in_order: u64,
    /// Packets that had to be buffered.
    pub packets_reordered: u64,
    /// Largest observed gap from the expected id.
    pub max_reorder_distance: u64,
    /// Packets released out of band because the buffer was full.
    pub buffer_overflows: u64,
    /// Packets below the window, dropped.
    pub packets_dropped_too_old: u64,
}

/// Outcome of a single submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Released through the callback (possibly together with buffered
    /// successors).
    Released,
    /// Held in the buffer.
    Buffered,
    /// Below the window; the word was discarded.
    DroppedTooOld,
    /// Buffer was full; released immediately, out of sequence.
    OverflowReleased,
}

/// Bounded reorder buffer for sequenced packets.
pub struct ReorderBuffer {
    buffer: HashMap<u64, u64>,
    next_expected: u64,
    oldest_allowed: u64,
    current_chunk: u64,
    first_seen: bool,
    max_size: usize,
    chunk_aware: bool,
    stats: ReorderStats,
}

impl ReorderBuffer {
    /// Creates a buffer holding at most `max_size` out-of-order packets.
    /// With `chunk_aware`, a new chunk id flushes and resets the sequence
    /// (the SPIDR counter restarts per chunk).
    #[must_use]
    pub fn new(max_size: usize, chunk_aware: bool) -> Self {
        Self {
            buffer: HashMap::with_capacity(max_size.min(4096)),
            next_expected: 0,
            oldest_allowed: 0,
            current_chunk: 0,
            first_seen: false,
            max_size: max_size.max(1),
            chunk_aware,
            stats: ReorderStats::default(),
        }
    }

    /// Number of packets currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Counters accumulated so far (survive flushes and chunk resets).
    #[must_use]
    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Submits a packet; `release` is invoked zero or more times with words
    /// in release order.
    pub fn submit(
        &mut self,
        word: u64,
        packet_id: u64,
        chunk_id: u64,
        release: &mut dyn FnMut(u64),
    ) -> SubmitOutcome {
        self.stats.total_packets += 1;

        if self.chunk_aware && chunk_id != self.current_chunk && chunk_id > 0 {
            self.flush(release);
            self.reset_for_new_chunk(chunk_id);
        }

        if packet_id == self.next_expected {
            release(word);
            self.first_seen = true;
            self.next_expected = packet_id + 1;
            self.update_oldest_allowed();
            self.release_consecutive(release);
            self.stats.packets_in_order += 1;
            return SubmitOutcome::Released;
        }

        if self.first_seen && packet_id < self.oldest_allowed {
            self.stats.packets_dropped_too_old += 1;
            return SubmitOutcome::DroppedTooOld;
        }

        let distance = if packet_id > self.next_expected {
            packet_id - self.next_expected
        } else {
            // Late arrival inside the window: mirrored distance.
            self.next_expected - packet_id - 1
        };
        self.stats.max_reorder_distance = self.stats.max_reorder_distance.max(distance);

        if self.buffer.len() >= self.max_size {
            self.stats.buffer_overflows += 1;
            release(word);
            return SubmitOutcome::OverflowReleased;
        }

        self.buffer.insert(packet_id, word);
        self.stats.packets_reordered += 1;
        self.release_consecutive(release);
        SubmitOutcome::Buffered
    }

    /// Releases everything buffered in ascending id order, then resets the
    /// sequence state. Counters are preserved.
    pub fn flush(&mut self, release: &mut dyn FnMut(u64)) {
        if !self.buffer.is_empty() {
            let mut ids: Vec<u64> = self.buffer.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                if let Some(word) = self.buffer.remove(&id) {
                    release(word);
                }
            }
        }
        self.first_seen = false;
        self.next_expected = 0;
        self.oldest_allowed = 0;
    }

    /// Discards buffered packets and restarts the sequence for `chunk_id`.
    pub fn reset_for_new_chunk(&mut self, chunk_id: u64) {
        self.buffer.clear();
        self.current_chunk = chunk_id;
        self.first_seen = false;
        self.next_expected = 0;
        self.oldest_allowed = 0;
    }

    fn release_consecutive(&mut self, release: &mut dyn FnMut(u64)) {
        while let Some(word) = self.buffer.remove(&self.next_expected) {
            release(word);
            self.next_expected += 1;
            self.update_oldest_allowed();
        }
    }

    fn update_oldest_allowed(&mut self) {
        self.oldest_allowed = self.next_expected.saturating_sub(self.max_size as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_all(buf: &mut ReorderBuffer, ids: &[u64]) -> Vec<u64> {
        let mut released = Vec::new();
        for &id in ids {
            buf.submit(id, id, 1, &mut |w| released.push(w));
        }
        released
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buf = ReorderBuffer::new(8, true);
        let released = submit_all(&mut buf, &[0, 1, 2, 3]);
        assert_eq!(released, vec![0, 1, 2, 3]);
        assert_eq!(buf.stats().packets_in_order, 4);
        assert_eq!(buf.stats().packets_reordered, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reorder_under_window() {
        // Shuffled ids inside the window come out monotonic.
        let mut buf = ReorderBuffer::new(4, true);
        let released = submit_all(&mut buf, &[2, 0, 1, 3]);
        assert_eq!(released, vec![0, 1, 2, 3]);
        assert!(buf.stats().packets_reordered > 0);
        assert_eq!(buf.stats().max_reorder_distance, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_too_old_dropped() {
        // An id below the window is dropped, not re-released.
        let mut buf = ReorderBuffer::new(2, true);
        let mut released = Vec::new();
        for &id in &[0u64, 1, 2, 3, 4] {
            buf.submit(id, id, 1, &mut |w| released.push(w));
        }
        let outcome = buf.submit(0, 0, 1, &mut |w| released.push(w));
        assert_eq!(outcome, SubmitOutcome::DroppedTooOld);
        assert_eq!(released, vec![0, 1, 2, 3, 4]);
        assert_eq!(buf.stats().packets_dropped_too_old, 1);
    }

    #[test]
    fn test_all_permutations_of_five_release_in_order() {
        // Any permutation within the window releases 0..N in order.
        let ids = [0u64, 1, 2, 3, 4];
        let mut perm = ids;
        permute(&mut perm, 0, &mut |p| {
            let mut buf = ReorderBuffer::new(8, true);
            let released = submit_all(&mut buf, p);
            assert_eq!(released, vec![0, 1, 2, 3, 4], "permutation {p:?}");
            assert!(buf.is_empty());
        });
    }

    fn permute(arr: &mut [u64; 5], k: usize, visit: &mut impl FnMut(&[u64])) {
        if k == arr.len() {
            visit(arr);
            return;
        }
        for i in k..arr.len() {
            arr.swap(k, i);
            permute(arr, k + 1, visit);
            arr.swap(k, i);
        }
    }

    #[test]
    fn test_bounded_memory_under_adversarial_input() {
        // The buffer never exceeds its window.
        let mut buf = ReorderBuffer::new(4, false);
        let mut released = Vec::new();
        for id in (0..100u64).rev() {
            buf.submit(id, id, 0, &mut |w| released.push(w));
            assert!(buf.len() <= 4);
        }
        assert!(buf.stats().buffer_overflows > 0);
    }

    #[test]
    fn test_overflow_releases_immediately() {
        let mut buf = ReorderBuffer::new(2, true);
        let mut released = Vec::new();
        // Fill the window with far-ahead ids, then overflow it.
        for &id in &[10u64, 11, 12] {
            buf.submit(id, id, 1, &mut |w| released.push(w));
        }
        assert_eq!(released, vec![12]);
        assert_eq!(buf.stats().buffer_overflows, 1);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_flush_releases_sorted_and_resets() {
        let mut buf = ReorderBuffer::new(8, true);
        let mut released = Vec::new();
        for &id in &[5u64, 3, 9] {
            buf.submit(id, id, 1, &mut |w| released.push(w));
        }
        assert!(released.is_empty());
        buf.flush(&mut |w| released.push(w));
        assert_eq!(released, vec![3, 5, 9]);
        assert!(buf.is_empty());

        // After the flush the sequence restarts at 0.
        released.clear();
        buf.submit(0, 0, 1, &mut |w| released.push(w));
        assert_eq!(released, vec![0]);
    }

    #[test]
    fn test_chunk_boundary_flushes_and_resets() {
        let mut buf = ReorderBuffer::new(8, true);
        let mut released = Vec::new();
        buf.submit(100, 1, 1, &mut |w| released.push(w));
        assert!(released.is_empty());

        // First packet of chunk 2 flushes the straggler from chunk 1.
        buf.submit(200, 0, 2, &mut |w| released.push(w));
        assert_eq!(released, vec![100, 200]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunk_unaware_ignores_chunk_ids() {
        let mut buf = ReorderBuffer::new(8, false);
        let mut released = Vec::new();
        buf.submit(10, 0, 1, &mut |w| released.push(w));
        buf.submit(20, 1, 7, &mut |w| released.push(w));
        assert_eq!(released, vec![10, 20]);
    }

    #[test]
    fn test_late_duplicate_buffered_until_flush() {
        let mut buf = ReorderBuffer::new(4, true);
        let mut released = Vec::new();
        for &id in &[0u64, 1, 2] {
            buf.submit(id * 10, id, 1, &mut |w| released.push(w));
        }
        // Duplicate of id 1, still inside the window.
        let outcome = buf.submit(99, 1, 1, &mut |w| released.push(w));
        assert_eq!(outcome, SubmitOutcome::Buffered);
        assert_eq!(buf.stats().max_reorder_distance, 1);
        assert_eq!(released, vec![0, 10, 20]);
    }
}
