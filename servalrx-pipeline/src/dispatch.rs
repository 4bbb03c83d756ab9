//! Sharded decode worker pool.
//!
//! Bit-level decoding and statistics accumulation run off the parser
//! thread so a single receive/parse pair can keep up with a saturated
//! link. Work is sharded by `chip_index % workers`: submissions from the
//! single-threaded parser are FIFO and each chip lands on exactly one
//! worker, so per-chip decode order matches submission order. Across
//! chips no order is guaranteed; event timestamps are the ordering key.

use crate::report::ErrorReporter;
use crate::sink::EventSink;
use crate::stats::{Aggregator, PartialStats};
use servalrx_core::extension::extend_pixel_toa;
use servalrx_core::packet::{classify, decode_word, Packet, PacketClass};
use servalrx_core::ChunkMetadata;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Wait timeout for idle workers, so they observe the stop flag promptly.
const WORKER_WAIT: Duration = Duration::from_millis(100);

/// A batch of words to decode under one chunk context.
///
/// The metadata is copied by value at flush time so later chunk-tail
/// mutations never retro-apply to words already in flight.
#[derive(Debug, Clone)]
pub struct DecodeTask {
    /// Raw data words in submission order.
    pub words: Vec<u64>,
    /// Chip the owning chunk belongs to.
    pub chip_index: u8,
    /// Chunk metadata in effect when the batch was flushed.
    pub meta: ChunkMetadata,
}

struct WorkerState {
    queue: Mutex<VecDeque<DecodeTask>>,
    available: Condvar,
    partial: Mutex<PartialStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker pool decoding word batches into per-shard partial statistics.
pub struct DecodeDispatcher {
    workers: Vec<Arc<WorkerState>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    pending_tasks: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    aggregator: Arc<Aggregator>,
}

impl DecodeDispatcher {
    /// Spawns `worker_count` decode workers merging into `aggregator`.
    #[must_use]
    pub fn new(worker_count: usize, aggregator: Arc<Aggregator>) -> Self {
        let worker_count = worker_count.max(1);
        let pending_tasks = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let reporter = aggregator.reporter();

        let mut workers = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for shard in 0..worker_count {
            let state = Arc::new(WorkerState {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                partial: Mutex::new(PartialStats::new(aggregator.recent_capacity())),
            });
            workers.push(Arc::clone(&state));

            let stop = Arc::clone(&stop);
            let pending = Arc::clone(&pending_tasks);
            let reporter = Arc::clone(&reporter);
            let sink: Arc<dyn EventSink> = aggregator.clone();
            let handle = std::thread::Builder::new()
                .name(format!("decode-{shard}"))
                .spawn(move || worker_loop(&state, &stop, &pending, &reporter, sink.as_ref()))
                .expect("failed to spawn decode worker");
            handles.push(handle);
        }

        Self {
            workers,
            handles: Mutex::new(handles),
            pending_tasks,
            stop,
            aggregator,
        }
    }

    /// Default pool size: one worker for offline file decoding, otherwise
    /// enough to keep up with a saturated stream.
    #[must_use]
    pub fn default_worker_count(file_mode: bool) -> usize {
        if file_mode {
            1
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
                .max(4)
        }
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Tasks submitted but not yet fully decoded.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }

    /// Queues a batch on its chip's shard.
    pub fn submit(&self, task: DecodeTask) {
        let shard = usize::from(task.chip_index) % self.workers.len();
        self.pending_tasks.fetch_add(1, Ordering::AcqRel);
        let worker = &self.workers[shard];
        lock(&worker.queue).push_back(task);
        worker.available.notify_one();
    }

    /// Blocks until every submitted task has been decoded, then merges all
    /// worker partials into the aggregator.
    pub fn wait_until_idle(&self) {
        while self.pending_tasks.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.flush_all();
    }

    /// Merges every worker's partial statistics into the aggregator.
    pub fn flush_all(&self) {
        for worker in &self.workers {
            let mut partial = lock(&worker.partial);
            self.aggregator.merge_partial(&mut partial);
        }
    }

    /// Stops the pool: workers drain their queues, exit, and the remaining
    /// partials are merged so no counts are lost.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.available.notify_all();
        }
        for handle in lock(&self.handles).drain(..) {
            let _ = handle.join();
        }
        self.flush_all();
    }
}

impl Drop for DecodeDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    state: &WorkerState,
    stop: &AtomicBool,
    pending: &AtomicUsize,
    reporter: &ErrorReporter,
    sink: &dyn EventSink,
) {
    loop {
        let task = {
            let mut queue = lock(&state.queue);
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if stop.load(Ordering::Acquire) {
                    break None;
                }
                let (guard, _timeout) = state
                    .available
                    .wait_timeout(queue, WORKER_WAIT)
                    .unwrap_or_else(PoisonError::into_inner);
                queue = guard;
            }
        };

        let Some(task) = task else {
            // Stop requested and the queue is drained.
            return;
        };

        {
            let mut partial = lock(&state.partial);
            for &word in &task.words {
                decode_word_into_partial(
                    word,
                    task.chip_index,
                    &task.meta,
                    &mut partial,
                    reporter,
                    sink,
                );
            }
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Decodes one data word into a worker partial. Control and global-time
/// packets are rare and go straight to the sink, matching the inline path.
pub(crate) fn decode_word_into_partial(
    word: u64,
    chip_index: u8,
    meta: &ChunkMetadata,
    partial: &mut PartialStats,
    reporter: &ErrorReporter,
    sink: &dyn EventSink,
) {
    let class = classify(word);
    partial.account(class, 8);
    if class == PacketClass::Unknown {
        partial.record_unknown();
        reporter.report_unknown(word);
        return;
    }
    match decode_word(word, chip_index) {
        Ok(Packet::Hit(mut hit)) => {
            if meta.has_extras {
                extend_pixel_toa(&mut hit, meta.min_ticks);
            }
            partial.record_hit(hit);
        }
        Ok(Packet::Tdc(tdc)) => partial.record_tdc(tdc, chip_index),
        Ok(Packet::SpidrControl(ctrl)) => sink.on_spidr_control(ctrl),
        Ok(Packet::Tpx3Control(cmd)) => sink.on_tpx3_control(cmd),
        Ok(Packet::GlobalTime(gt)) => sink.on_global_time(gt),
        // Packet ids and stray extras are covered by byte accounting.
        Ok(Packet::SpidrPacketId(_) | Packet::ExtraTimestamp(_)) => {}
        Err(err) => {
            partial.record_error(&err);
            reporter.report(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel_word() -> u64 {
        0xB000_0000_0000_0000
    }

    #[test]
    fn test_dispatcher_decodes_and_merges() {
        let agg = Arc::new(Aggregator::new(10));
        let dispatcher = DecodeDispatcher::new(4, Arc::clone(&agg));

        for chip in 0..4u8 {
            dispatcher.submit(DecodeTask {
                words: vec![pixel_word(); 50],
                chip_index: chip,
                meta: ChunkMetadata::default(),
            });
        }
        dispatcher.wait_until_idle();

        let snap = agg.snapshot();
        assert_eq!(snap.total_hits, 200);
        for chip in 0..4 {
            assert_eq!(snap.chips[chip].hits, 50);
        }
        assert_eq!(snap.total_bytes_accounted, 200 * 8);
        dispatcher.shutdown();
    }

    #[test]
    fn test_metadata_copy_applies_extension() {
        let agg = Arc::new(Aggregator::new(10));
        let dispatcher = DecodeDispatcher::new(2, Arc::clone(&agg));

        let meta = ChunkMetadata {
            packet_gen_ticks: 0,
            min_ticks: 500,
            max_ticks: 1500,
            has_extras: true,
        };
        dispatcher.submit(DecodeTask {
            words: vec![pixel_word()],
            chip_index: 0,
            meta,
        });
        dispatcher.wait_until_idle();

        let snap = agg.snapshot();
        assert_eq!(snap.total_hits, 1);
        assert_eq!(
            snap.recent_hits[0].toa_ticks,
            500 + (0u64.wrapping_sub(500) & ((1 << 30) - 1))
        );
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_merges_remaining_partials() {
        let agg = Arc::new(Aggregator::new(0));
        let dispatcher = DecodeDispatcher::new(1, Arc::clone(&agg));
        dispatcher.submit(DecodeTask {
            words: vec![pixel_word(); 10],
            chip_index: 2,
            meta: ChunkMetadata::default(),
        });
        // No explicit idle wait: shutdown drains, joins, and merges.
        dispatcher.shutdown();
        assert_eq!(agg.snapshot().total_hits, 10);
    }

    #[test]
    fn test_single_thread_reference_equivalence() {
        // Parallel decode + merge matches a
        // single-threaded reference over the same words.
        let words: Vec<u64> = (0..1000u64)
            .map(|i| pixel_word() | ((i % 4) << 44) | (i << 30 & 0x0000_3FFF_C000_0000))
            .collect();

        let reference = Arc::new(Aggregator::new(0));
        {
            let reporter = reference.reporter();
            let mut partial = PartialStats::new(0);
            for &w in &words {
                decode_word_into_partial(
                    w,
                    1,
                    &ChunkMetadata::default(),
                    &mut partial,
                    &reporter,
                    reference.as_ref(),
                );
            }
            reference.merge_partial(&mut partial);
        }

        let parallel = Arc::new(Aggregator::new(0));
        let dispatcher = DecodeDispatcher::new(4, Arc::clone(&parallel));
        for batch in words.chunks(64) {
            dispatcher.submit(DecodeTask {
                words: batch.to_vec(),
                chip_index: 1,
                meta: ChunkMetadata::default(),
            });
        }
        dispatcher.wait_until_idle();
        dispatcher.shutdown();

        let a = reference.snapshot();
        let b = parallel.snapshot();
        assert_eq!(a.total_hits, b.total_hits);
        assert_eq!(a.earliest_hit_ticks, b.earliest_hit_ticks);
        assert_eq!(a.latest_hit_ticks, b.latest_hit_ticks);
        assert_eq!(a.chips[1].hits, b.chips[1].hits);
        assert_eq!(a.total_bytes_accounted, b.total_bytes_accounted);
    }
}
