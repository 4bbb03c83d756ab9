//! Thread-safe statistics aggregation.
//!
//! Counters live behind one plain mutex. Hot decode paths never touch it
//! directly: workers accumulate into their own [`PartialStats`] and merge
//! at explicit points (idle drain, periodic print, shutdown), so no lock
//! recursion is possible and readers only ever copy a snapshot out.

use crate::report::ErrorReporter;
use crate::reorder::ReorderStats;
use crate::sink::EventSink;
use servalrx_core::{ChunkMetadata, DecodeError, PacketClass, PixelHit, TdcEvent, TICK_NS};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of chips a SERVAL stream multiplexes.
pub const NUM_CHIPS: usize = 4;

/// Default capacity of the recent-hit ring.
pub const DEFAULT_RECENT_HITS: usize = 10;

/// Hit additions between instantaneous-rate updates.
const RATE_UPDATE_HITS: u64 = 1000;

/// Minimum wall-clock gap between instantaneous-rate updates.
const RATE_UPDATE_WALL: Duration = Duration::from_secs(1);

/// Seconds per 1.5625 ns tick.
const TICK_SECONDS: f64 = TICK_NS * 1e-9;

/// Per-chip counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChipStats {
    /// Pixel hits attributed to the chip.
    pub hits: u64,
    /// TDC1 events attributed to the chip.
    pub tdc1: u64,
    /// Earliest TDC1 tick seen on the chip.
    pub tdc1_min_ticks: u64,
    /// Latest TDC1 tick seen on the chip.
    pub tdc1_max_ticks: u64,
    /// True once any event was attributed to the chip.
    pub seen: bool,
}

impl ChipStats {
    fn record_tdc1(&mut self, ticks: u64) {
        if self.tdc1 == 0 {
            self.tdc1_min_ticks = ticks;
            self.tdc1_max_ticks = ticks;
        } else {
            self.tdc1_min_ticks = self.tdc1_min_ticks.min(ticks);
            self.tdc1_max_ticks = self.tdc1_max_ticks.max(ticks);
        }
        self.tdc1 += 1;
        self.seen = true;
    }

    fn merge(&mut self, other: &ChipStats) {
        if other.tdc1 > 0 {
            if self.tdc1 == 0 {
                self.tdc1_min_ticks = other.tdc1_min_ticks;
                self.tdc1_max_ticks = other.tdc1_max_ticks;
            } else {
                self.tdc1_min_ticks = self.tdc1_min_ticks.min(other.tdc1_min_ticks);
                self.tdc1_max_ticks = self.tdc1_max_ticks.max(other.tdc1_max_ticks);
            }
        }
        self.hits += other.hits;
        self.tdc1 += other.tdc1;
        self.seen |= other.seen;
    }
}

/// Worker-local statistics, accumulated without any shared lock and merged
/// into the [`Aggregator`] at drain points.
#[derive(Debug, Clone)]
pub struct PartialStats {
    /// Pixel hits decoded.
    pub hits: u64,
    /// TDC1 events decoded.
    pub tdc1: u64,
    /// TDC2 events decoded.
    pub tdc2: u64,
    /// Decode failures.
    pub decode_errors: u64,
    /// TDC fractional-range failures (subset of `decode_errors`).
    pub fractional_errors: u64,
    /// Words matching no dispatch.
    pub unknown_packets: u64,
    /// Packet count per class.
    pub packet_counts: [u64; PacketClass::COUNT],
    /// Byte total per class.
    pub packet_bytes: [u64; PacketClass::COUNT],
    /// Earliest pixel ToA tick.
    pub earliest_hit_ticks: Option<u64>,
    /// Latest pixel ToA tick.
    pub latest_hit_ticks: Option<u64>,
    /// Earliest TDC1 tick.
    pub earliest_tdc1_ticks: Option<u64>,
    /// Latest TDC1 tick.
    pub latest_tdc1_ticks: Option<u64>,
    /// Per-chip breakdown.
    pub chips: [ChipStats; NUM_CHIPS],
    /// Most recent hits, bounded at the global ring capacity.
    pub recent_hits: VecDeque<PixelHit>,
    recent_capacity: usize,
}

impl PartialStats {
    /// Creates an empty partial whose recent-hit buffer matches the global
    /// ring capacity.
    #[must_use]
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            hits: 0,
            tdc1: 0,
            tdc2: 0,
            decode_errors: 0,
            fractional_errors: 0,
            unknown_packets: 0,
            packet_counts: [0; PacketClass::COUNT],
            packet_bytes: [0; PacketClass::COUNT],
            earliest_hit_ticks: None,
            latest_hit_ticks: None,
            earliest_tdc1_ticks: None,
            latest_tdc1_ticks: None,
            chips: [ChipStats::default(); NUM_CHIPS],
            recent_hits: VecDeque::with_capacity(recent_capacity),
            recent_capacity,
        }
    }

    /// True if nothing has been accumulated since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits == 0
            && self.tdc1 == 0
            && self.tdc2 == 0
            && self.decode_errors == 0
            && self.unknown_packets == 0
            && self.packet_counts.iter().all(|&c| c == 0)
    }

    /// Attributes `bytes` of stream data to `class`.
    pub fn account(&mut self, class: PacketClass, bytes: u64) {
        self.packet_counts[class as usize] += 1;
        self.packet_bytes[class as usize] += bytes;
    }

    /// Records a decoded pixel hit.
    pub fn record_hit(&mut self, hit: PixelHit) {
        self.hits += 1;
        let t = hit.toa_ticks;
        self.earliest_hit_ticks = Some(self.earliest_hit_ticks.map_or(t, |e| e.min(t)));
        self.latest_hit_ticks = Some(self.latest_hit_ticks.map_or(t, |l| l.max(t)));

        let chip = &mut self.chips[usize::from(hit.chip_index) % NUM_CHIPS];
        chip.hits += 1;
        chip.seen = true;

        if self.recent_capacity > 0 {
            if self.recent_hits.len() == self.recent_capacity {
                self.recent_hits.pop_front();
            }
            self.recent_hits.push_back(hit);
        }
    }

    /// Records a decoded TDC event on behalf of `chip_index`.
    pub fn record_tdc(&mut self, tdc: TdcEvent, chip_index: u8) {
        if tdc.kind.is_tdc1() {
            self.tdc1 += 1;
            let t = tdc.timestamp_ticks;
            self.earliest_tdc1_ticks = Some(self.earliest_tdc1_ticks.map_or(t, |e| e.min(t)));
            self.latest_tdc1_ticks = Some(self.latest_tdc1_ticks.map_or(t, |l| l.max(t)));
            self.chips[usize::from(chip_index) % NUM_CHIPS].record_tdc1(t);
        } else {
            self.tdc2 += 1;
        }
    }

    /// Records a decode failure.
    pub fn record_error(&mut self, err: &DecodeError) {
        self.decode_errors += 1;
        if err.is_fractional() {
            self.fractional_errors += 1;
        }
    }

    /// Records a word that matched no dispatch.
    pub fn record_unknown(&mut self) {
        self.unknown_packets += 1;
    }

    fn reset(&mut self) {
        let capacity = self.recent_capacity;
        *self = Self::new(capacity);
    }
}

/// Rolling-window state for the instantaneous rates.
#[derive(Debug, Clone)]
struct RateWindow {
    start: Instant,
    hits: u64,
    tdc1: u64,
    tdc2: u64,
    latest_hit_ticks: Option<u64>,
    latest_tdc1_ticks: Option<u64>,
}

#[derive(Debug)]
struct StatsInner {
    total_hits: u64,
    total_chunks: u64,
    chunks_with_metadata: u64,
    total_tdc1: u64,
    total_tdc2: u64,
    total_decode_errors: u64,
    total_fractional_errors: u64,
    total_unknown_packets: u64,
    packet_counts: [u64; PacketClass::COUNT],
    packet_bytes: [u64; PacketClass::COUNT],
    total_bytes_accounted: u64,
    reorder: ReorderStats,
    earliest_hit_ticks: Option<u64>,
    latest_hit_ticks: Option<u64>,
    earliest_tdc1_ticks: Option<u64>,
    latest_tdc1_ticks: Option<u64>,
    chips: [ChipStats; NUM_CHIPS],
    recent_hits: VecDeque<PixelHit>,
    started_mid_stream: bool,

    hit_rate_hz: f64,
    tdc1_rate_hz: f64,
    tdc2_rate_hz: f64,
    cumulative_hit_rate_hz: f64,
    cumulative_tdc1_rate_hz: f64,
    chip_hit_rates_hz: [f64; NUM_CHIPS],
    chip_tdc1_rates_hz: [f64; NUM_CHIPS],

    hits_since_rate_update: u64,
    window: RateWindow,
}

impl StatsInner {
    fn new(now: Instant) -> Self {
        Self {
            total_hits: 0,
            total_chunks: 0,
            chunks_with_metadata: 0,
            total_tdc1: 0,
            total_tdc2: 0,
            total_decode_errors: 0,
            total_fractional_errors: 0,
            total_unknown_packets: 0,
            packet_counts: [0; PacketClass::COUNT],
            packet_bytes: [0; PacketClass::COUNT],
            total_bytes_accounted: 0,
            reorder: ReorderStats::default(),
            earliest_hit_ticks: None,
            latest_hit_ticks: None,
            earliest_tdc1_ticks: None,
            latest_tdc1_ticks: None,
            chips: [ChipStats::default(); NUM_CHIPS],
            recent_hits: VecDeque::new(),
            started_mid_stream: false,
            hit_rate_hz: 0.0,
            tdc1_rate_hz: 0.0,
            tdc2_rate_hz: 0.0,
            cumulative_hit_rate_hz: 0.0,
            cumulative_tdc1_rate_hz: 0.0,
            chip_hit_rates_hz: [0.0; NUM_CHIPS],
            chip_tdc1_rates_hz: [0.0; NUM_CHIPS],
            hits_since_rate_update: 0,
            window: RateWindow {
                start: now,
                hits: 0,
                tdc1: 0,
                tdc2: 0,
                latest_hit_ticks: None,
                latest_tdc1_ticks: None,
            },
        }
    }

    fn push_recent(&mut self, hit: PixelHit, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.recent_hits.len() == capacity {
            self.recent_hits.pop_front();
        }
        self.recent_hits.push_back(hit);
    }

    fn record_hit(&mut self, hit: PixelHit, capacity: usize) {
        self.total_hits += 1;
        let t = hit.toa_ticks;
        self.earliest_hit_ticks = Some(self.earliest_hit_ticks.map_or(t, |e| e.min(t)));
        self.latest_hit_ticks = Some(self.latest_hit_ticks.map_or(t, |l| l.max(t)));
        let chip = &mut self.chips[usize::from(hit.chip_index) % NUM_CHIPS];
        chip.hits += 1;
        chip.seen = true;
        self.push_recent(hit, capacity);
        self.hits_since_rate_update += 1;
    }

    fn record_tdc(&mut self, tdc: TdcEvent, chip_index: u8) {
        if tdc.kind.is_tdc1() {
            self.total_tdc1 += 1;
            let t = tdc.timestamp_ticks;
            self.earliest_tdc1_ticks = Some(self.earliest_tdc1_ticks.map_or(t, |e| e.min(t)));
            self.latest_tdc1_ticks = Some(self.latest_tdc1_ticks.map_or(t, |l| l.max(t)));
            self.chips[usize::from(chip_index) % NUM_CHIPS].record_tdc1(t);
        } else {
            self.total_tdc2 += 1;
        }
    }

    /// Instantaneous rates over the window since the last update; data-time
    /// span preferred, wall-clock fallback. TDC2 carries no data timestamp
    /// here, so it always uses wall time.
    fn update_rates(&mut self, now: Instant, start: Instant) {
        let wall_span = now.duration_since(self.window.start).as_secs_f64();

        let d_hits = self.total_hits - self.window.hits;
        let hit_span = match (self.window.latest_hit_ticks, self.latest_hit_ticks) {
            (Some(prev), Some(cur)) if cur > prev => (cur - prev) as f64 * TICK_SECONDS,
            _ => wall_span,
        };
        if hit_span > 0.0 {
            self.hit_rate_hz = d_hits as f64 / hit_span;
        }

        let d_tdc1 = self.total_tdc1 - self.window.tdc1;
        let tdc1_span = match (self.window.latest_tdc1_ticks, self.latest_tdc1_ticks) {
            (Some(prev), Some(cur)) if cur > prev => (cur - prev) as f64 * TICK_SECONDS,
            _ => wall_span,
        };
        if tdc1_span > 0.0 {
            self.tdc1_rate_hz = d_tdc1 as f64 / tdc1_span;
        }

        let d_tdc2 = self.total_tdc2 - self.window.tdc2;
        if wall_span > 0.0 {
            self.tdc2_rate_hz = d_tdc2 as f64 / wall_span;
        }

        self.update_cumulative_rates(now, start);

        self.window = RateWindow {
            start: now,
            hits: self.total_hits,
            tdc1: self.total_tdc1,
            tdc2: self.total_tdc2,
            latest_hit_ticks: self.latest_hit_ticks,
            latest_tdc1_ticks: self.latest_tdc1_ticks,
        };
        self.hits_since_rate_update = 0;
    }

    /// Cumulative rates over the full data span, falling back to wall time
    /// until the data span is defined so a value is reported from the first
    /// event on.
    fn update_cumulative_rates(&mut self, now: Instant, start: Instant) {
        let wall_elapsed = now.duration_since(start).as_secs_f64();

        let hit_span = match (self.earliest_hit_ticks, self.latest_hit_ticks) {
            (Some(e), Some(l)) if l > e => (l - e) as f64 * TICK_SECONDS,
            _ => wall_elapsed,
        };
        if hit_span > 0.0 {
            self.cumulative_hit_rate_hz = self.total_hits as f64 / hit_span;
            for i in 0..NUM_CHIPS {
                self.chip_hit_rates_hz[i] = self.chips[i].hits as f64 / hit_span;
            }
        }

        let tdc1_span = match (self.earliest_tdc1_ticks, self.latest_tdc1_ticks) {
            (Some(e), Some(l)) if l > e => (l - e) as f64 * TICK_SECONDS,
            _ => wall_elapsed,
        };
        if tdc1_span > 0.0 {
            self.cumulative_tdc1_rate_hz = self.total_tdc1 as f64 / tdc1_span;
        }

        for i in 0..NUM_CHIPS {
            let chip = self.chips[i];
            let span = if chip.tdc1_max_ticks > chip.tdc1_min_ticks {
                (chip.tdc1_max_ticks - chip.tdc1_min_ticks) as f64 * TICK_SECONDS
            } else {
                wall_elapsed
            };
            if span > 0.0 {
                self.chip_tdc1_rates_hz[i] = chip.tdc1 as f64 / span;
            }
        }
    }

    fn maybe_update_rates(&mut self, now: Instant, start: Instant) {
        if self.hits_since_rate_update >= RATE_UPDATE_HITS
            && now.duration_since(self.window.start) >= RATE_UPDATE_WALL
        {
            self.update_rates(now, start);
        }
    }
}

/// Point-in-time copy of every statistic, handed to printers.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Total pixel hits.
    pub total_hits: u64,
    /// Total chunk headers accepted.
    pub total_chunks: u64,
    /// Chunks whose three extra-timestamp packets were all seen.
    pub chunks_with_metadata: u64,
    /// TDC1 + TDC2 events.
    pub total_tdc_events: u64,
    /// TDC1 events.
    pub total_tdc1: u64,
    /// TDC2 events.
    pub total_tdc2: u64,
    /// Decode failures.
    pub total_decode_errors: u64,
    /// TDC fractional failures.
    pub total_fractional_errors: u64,
    /// Words matching no dispatch.
    pub total_unknown_packets: u64,
    /// Packet count per class, indexed by `PacketClass as usize`.
    pub packet_counts: [u64; PacketClass::COUNT],
    /// Byte total per class.
    pub packet_bytes: [u64; PacketClass::COUNT],
    /// Sum of all accounted bytes.
    pub total_bytes_accounted: u64,
    /// Reorder-buffer statistics as last published.
    pub reorder: ReorderStats,
    /// Earliest pixel ToA tick, if any hit was seen.
    pub earliest_hit_ticks: Option<u64>,
    /// Latest pixel ToA tick.
    pub latest_hit_ticks: Option<u64>,
    /// Earliest TDC1 tick.
    pub earliest_tdc1_ticks: Option<u64>,
    /// Latest TDC1 tick.
    pub latest_tdc1_ticks: Option<u64>,
    /// Per-chip breakdown.
    pub chips: [ChipStats; NUM_CHIPS],
    /// Most recent hits, oldest first.
    pub recent_hits: Vec<PixelHit>,
    /// True if the first word of the stream was not a chunk header.
    pub started_mid_stream: bool,
    /// Instantaneous hit rate (rolling window).
    pub hit_rate_hz: f64,
    /// Instantaneous TDC1 rate.
    pub tdc1_rate_hz: f64,
    /// Instantaneous TDC2 rate (wall clock).
    pub tdc2_rate_hz: f64,
    /// Cumulative hit rate over the data span.
    pub cumulative_hit_rate_hz: f64,
    /// Cumulative TDC1 rate over the data span.
    pub cumulative_tdc1_rate_hz: f64,
    /// Cumulative per-chip hit rates.
    pub chip_hit_rates_hz: [f64; NUM_CHIPS],
    /// Cumulative per-chip TDC1 rates.
    pub chip_tdc1_rates_hz: [f64; NUM_CHIPS],
    /// Wall time since the aggregator was created.
    pub uptime: Duration,
}

/// Thread-safe statistics aggregator.
///
/// Implements [`EventSink`] for the inline decode path; worker shards merge
/// their [`PartialStats`] through [`Aggregator::merge_partial`].
#[derive(Debug)]
pub struct Aggregator {
    inner: Mutex<StatsInner>,
    reporter: Arc<ErrorReporter>,
    recent_capacity: usize,
    start: Instant,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_HITS)
    }
}

impl Aggregator {
    /// Creates an aggregator keeping `recent_capacity` hits in the ring
    /// (0 disables the ring).
    #[must_use]
    pub fn new(recent_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(StatsInner::new(now)),
            reporter: Arc::new(ErrorReporter::default()),
            recent_capacity,
            start: now,
        }
    }

    /// Ring capacity configured at construction.
    #[must_use]
    pub fn recent_capacity(&self) -> usize {
        self.recent_capacity
    }

    /// The shared decode-error reporter.
    #[must_use]
    pub fn reporter(&self) -> Arc<ErrorReporter> {
        Arc::clone(&self.reporter)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Merges a worker partial and resets it to zero.
    pub fn merge_partial(&self, partial: &mut PartialStats) {
        if partial.is_empty() {
            return;
        }
        let mut inner = self.lock();

        inner.total_hits += partial.hits;
        inner.total_tdc1 += partial.tdc1;
        inner.total_tdc2 += partial.tdc2;
        inner.total_decode_errors += partial.decode_errors;
        inner.total_fractional_errors += partial.fractional_errors;
        inner.total_unknown_packets += partial.unknown_packets;
        for i in 0..PacketClass::COUNT {
            inner.packet_counts[i] += partial.packet_counts[i];
            inner.packet_bytes[i] += partial.packet_bytes[i];
            inner.total_bytes_accounted += partial.packet_bytes[i];
        }

        merge_min(&mut inner.earliest_hit_ticks, partial.earliest_hit_ticks);
        merge_max(&mut inner.latest_hit_ticks, partial.latest_hit_ticks);
        merge_min(&mut inner.earliest_tdc1_ticks, partial.earliest_tdc1_ticks);
        merge_max(&mut inner.latest_tdc1_ticks, partial.latest_tdc1_ticks);

        for i in 0..NUM_CHIPS {
            let other = partial.chips[i];
            inner.chips[i].merge(&other);
        }

        let capacity = self.recent_capacity;
        for hit in partial.recent_hits.drain(..) {
            inner.push_recent(hit, capacity);
        }

        inner.hits_since_rate_update += partial.hits;
        if partial.tdc1 > 0 || partial.tdc2 > 0 {
            inner.update_rates(Instant::now(), self.start);
        } else {
            inner.maybe_update_rates(Instant::now(), self.start);
        }

        partial.reset();
    }

    /// Publishes the reorder buffer's counters.
    pub fn set_reorder_stats(&self, stats: ReorderStats) {
        self.lock().reorder = stats;
    }

    /// Forces a final rate computation; call once at shutdown before the
    /// last print so cumulative and per-chip rates are never left at their
    /// startup zeros.
    pub fn finalize_rates(&self) {
        let mut inner = self.lock();
        inner.update_rates(Instant::now(), self.start);
    }

    /// Copies the current statistics out.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            total_hits: inner.total_hits,
            total_chunks: inner.total_chunks,
            chunks_with_metadata: inner.chunks_with_metadata,
            total_tdc_events: inner.total_tdc1 + inner.total_tdc2,
            total_tdc1: inner.total_tdc1,
            total_tdc2: inner.total_tdc2,
            total_decode_errors: inner.total_decode_errors,
            total_fractional_errors: inner.total_fractional_errors,
            total_unknown_packets: inner.total_unknown_packets,
            packet_counts: inner.packet_counts,
            packet_bytes: inner.packet_bytes,
            total_bytes_accounted: inner.total_bytes_accounted,
            reorder: inner.reorder,
            earliest_hit_ticks: inner.earliest_hit_ticks,
            latest_hit_ticks: inner.latest_hit_ticks,
            earliest_tdc1_ticks: inner.earliest_tdc1_ticks,
            latest_tdc1_ticks: inner.latest_tdc1_ticks,
            chips: inner.chips,
            recent_hits: inner.recent_hits.iter().copied().collect(),
            started_mid_stream: inner.started_mid_stream,
            hit_rate_hz: inner.hit_rate_hz,
            tdc1_rate_hz: inner.tdc1_rate_hz,
            tdc2_rate_hz: inner.tdc2_rate_hz,
            cumulative_hit_rate_hz: inner.cumulative_hit_rate_hz,
            cumulative_tdc1_rate_hz: inner.cumulative_tdc1_rate_hz,
            chip_hit_rates_hz: inner.chip_hit_rates_hz,
            chip_tdc1_rates_hz: inner.chip_tdc1_rates_hz,
            uptime: self.start.elapsed(),
        }
    }
}

impl EventSink for Aggregator {
    fn on_hit(&self, hit: PixelHit) {
        let mut inner = self.lock();
        inner.record_hit(hit, self.recent_capacity);
        inner.maybe_update_rates(Instant::now(), self.start);
    }

    fn on_tdc(&self, tdc: TdcEvent, chip_index: u8) {
        let mut inner = self.lock();
        inner.record_tdc(tdc, chip_index);
        // TDC events are rare; update unconditionally.
        inner.update_rates(Instant::now(), self.start);
    }

    fn on_chunk_start(&self, chip_index: u8) {
        let mut inner = self.lock();
        inner.total_chunks += 1;
        inner.chips[usize::from(chip_index) % NUM_CHIPS].seen = true;
    }

    fn on_chunk_meta(&self, meta: ChunkMetadata) {
        if meta.has_extras {
            self.lock().chunks_with_metadata += 1;
        }
    }

    fn on_packet_bytes(&self, class: PacketClass, bytes: u64) {
        let mut inner = self.lock();
        inner.packet_counts[class as usize] += 1;
        inner.packet_bytes[class as usize] += bytes;
        inner.total_bytes_accounted += bytes;
    }

    fn on_decode_error(&self, err: &DecodeError) {
        {
            let mut inner = self.lock();
            inner.total_decode_errors += 1;
            if err.is_fractional() {
                inner.total_fractional_errors += 1;
            }
        }
        self.reporter.report(err);
    }

    fn on_unknown_packet(&self, word: u64) {
        self.lock().total_unknown_packets += 1;
        self.reporter.report_unknown(word);
    }

    fn on_started_mid_stream(&self) {
        self.lock().started_mid_stream = true;
    }
}

fn merge_min(dst: &mut Option<u64>, src: Option<u64>) {
    if let Some(s) = src {
        *dst = Some(dst.map_or(s, |d| d.min(s)));
    }
}

fn merge_max(dst: &mut Option<u64>, src: Option<u64>) {
    if let Some(s) = src {
        *dst = Some(dst.map_or(s, |d| d.max(s)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servalrx_core::{PixelMode, TdcKind};

    fn hit(chip: u8, ticks: u64) -> PixelHit {
        PixelHit {
            x: 1,
            y: 2,
            toa_ticks: ticks,
            tot_ns: 25,
            chip_index: chip,
            mode: PixelMode::Standard,
        }
    }

    fn tdc1(ticks: u64) -> TdcEvent {
        TdcEvent {
            kind: TdcKind::Tdc1Rise,
            trigger_count: 0,
            timestamp_ticks: ticks,
            fine: 1,
        }
    }

    #[test]
    fn test_hit_counters_and_ticks() {
        let agg = Aggregator::new(10);
        agg.on_hit(hit(0, 500));
        agg.on_hit(hit(1, 100));
        agg.on_hit(hit(0, 900));

        let snap = agg.snapshot();
        assert_eq!(snap.total_hits, 3);
        assert_eq!(snap.earliest_hit_ticks, Some(100));
        assert_eq!(snap.latest_hit_ticks, Some(900));
        assert_eq!(snap.chips[0].hits, 2);
        assert_eq!(snap.chips[1].hits, 1);
        assert_eq!(snap.recent_hits.len(), 3);
    }

    #[test]
    fn test_recent_ring_overwrites_fifo() {
        let agg = Aggregator::new(2);
        agg.on_hit(hit(0, 1));
        agg.on_hit(hit(0, 2));
        agg.on_hit(hit(0, 3));
        let snap = agg.snapshot();
        assert_eq!(snap.recent_hits.len(), 2);
        assert_eq!(snap.recent_hits[0].toa_ticks, 2);
        assert_eq!(snap.recent_hits[1].toa_ticks, 3);
    }

    #[test]
    fn test_recent_ring_disabled() {
        let agg = Aggregator::new(0);
        agg.on_hit(hit(0, 1));
        assert!(agg.snapshot().recent_hits.is_empty());
    }

    #[test]
    fn test_tdc_split_and_per_chip() {
        let agg = Aggregator::new(10);
        agg.on_tdc(tdc1(100), 2);
        agg.on_tdc(tdc1(400), 2);
        agg.on_tdc(
            TdcEvent {
                kind: TdcKind::Tdc2Rise,
                trigger_count: 1,
                timestamp_ticks: 7,
                fine: 3,
            },
            0,
        );

        let snap = agg.snapshot();
        assert_eq!(snap.total_tdc1, 2);
        assert_eq!(snap.total_tdc2, 1);
        assert_eq!(snap.total_tdc_events, 3);
        assert_eq!(snap.earliest_tdc1_ticks, Some(100));
        assert_eq!(snap.latest_tdc1_ticks, Some(400));
        assert_eq!(snap.chips[2].tdc1, 2);
        assert_eq!(snap.chips[2].tdc1_min_ticks, 100);
        assert_eq!(snap.chips[2].tdc1_max_ticks, 400);
    }

    #[test]
    fn test_byte_accounting_totals() {
        let agg = Aggregator::new(10);
        agg.on_packet_bytes(PacketClass::ChunkHeader, 8);
        agg.on_packet_bytes(PacketClass::PixelStandard, 8);
        agg.on_packet_bytes(PacketClass::OutsideChunk, 8);
        let snap = agg.snapshot();
        assert_eq!(snap.total_bytes_accounted, 24);
        assert_eq!(snap.packet_counts[PacketClass::ChunkHeader as usize], 1);
        assert_eq!(snap.packet_bytes[PacketClass::OutsideChunk as usize], 8);
    }

    #[test]
    fn test_merge_partial_matches_direct() {
        let direct = Aggregator::new(4);
        let merged = Aggregator::new(4);

        let mut partial = PartialStats::new(4);
        for i in 0..20u64 {
            let h = hit((i % 3) as u8, i * 10);
            direct.on_hit(h);
            partial.record_hit(h);
        }
        partial.record_tdc(tdc1(55), 1);
        direct.on_tdc(tdc1(55), 1);

        merged.merge_partial(&mut partial);
        assert!(partial.is_empty());

        let a = direct.snapshot();
        let b = merged.snapshot();
        assert_eq!(a.total_hits, b.total_hits);
        assert_eq!(a.earliest_hit_ticks, b.earliest_hit_ticks);
        assert_eq!(a.latest_hit_ticks, b.latest_hit_ticks);
        assert_eq!(a.total_tdc1, b.total_tdc1);
        for i in 0..NUM_CHIPS {
            assert_eq!(a.chips[i].hits, b.chips[i].hits);
            assert_eq!(a.chips[i].tdc1, b.chips[i].tdc1);
        }
        assert_eq!(
            a.recent_hits.iter().map(|h| h.toa_ticks).collect::<Vec<_>>(),
            b.recent_hits.iter().map(|h| h.toa_ticks).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_cumulative_rate_uses_data_span() {
        let agg = Aggregator::new(0);
        // 641 hits spread over 640_000 ticks = 1 ms of data time.
        for i in 0..=640u64 {
            agg.on_hit(hit(0, i * 1000));
        }
        agg.finalize_rates();
        let snap = agg.snapshot();
        // span = 640_000 * 1.5625 ns = 1 ms; 641 hits / 1 ms = 641 kHz.
        assert!((snap.cumulative_hit_rate_hz - 641_000.0).abs() < 1.0);
        assert!(snap.hit_rate_hz >= 0.0);
        assert!((snap.chip_hit_rates_hz[0] - snap.cumulative_hit_rate_hz).abs() < 1e-6);
    }

    #[test]
    fn test_cumulative_rate_wall_fallback() {
        let agg = Aggregator::new(0);
        agg.on_hit(hit(0, 42));
        std::thread::sleep(Duration::from_millis(5));
        agg.finalize_rates();
        // Single hit: data span undefined, wall fallback still yields a value.
        assert!(agg.snapshot().cumulative_hit_rate_hz > 0.0);
    }

    #[test]
    fn test_decode_error_counters() {
        let agg = Aggregator::new(0);
        agg.on_decode_error(&DecodeError::TdcFractionalOutOfRange(13));
        agg.on_decode_error(&DecodeError::NotAPixelPacket(0));
        agg.on_unknown_packet(0x1);
        let snap = agg.snapshot();
        assert_eq!(snap.total_decode_errors, 2);
        assert_eq!(snap.total_fractional_errors, 1);
        assert_eq!(snap.total_unknown_packets, 1);
    }

    #[test]
    fn test_mid_stream_flag() {
        let agg = Aggregator::new(0);
        assert!(!agg.snapshot().started_mid_stream);
        agg.on_started_mid_stream();
        assert!(agg.snapshot().started_mid_stream);
    }
}
