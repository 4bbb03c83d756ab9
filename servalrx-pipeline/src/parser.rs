//! Frame-synchronised chunk parsing over an unaligned word stream.
//!
//! The parser consumes 8-byte words in arrival order, resynchronises on the
//! TPX3 magic, enforces the chunk-length contract, and routes each data
//! word: extra-timestamp packets in the chunk tail update the chunk
//! metadata, sequenced SPIDR packets go through the reorder buffer, and
//! everything else is batched for the decode path (dispatcher or inline).
//!
//! The chunk size field counts the header word itself, so a well-formed
//! chunk's last data word leaves `chunk_words_remaining` at 1 and the next
//! header re-syncs; only a malformed stream lets the counter reach 0 and
//! absorb one surplus word.

use crate::dispatch::{DecodeDispatcher, DecodeTask};
use crate::reorder::{ReorderBuffer, ReorderStats, SubmitOutcome};
use crate::sink::EventSink;
use servalrx_core::bits::top_byte;
use servalrx_core::extension::extend_pixel_toa;
use servalrx_core::packet::{
    classify, decode_extra_timestamp, decode_spidr_packet_id, decode_word, ChunkHeader, Packet,
    PacketClass,
};
use servalrx_core::{ChunkMetadata, ExtraTimestamp};
use std::sync::Arc;

/// Words held before a batch is handed to the decode path.
pub const BATCH_CAPACITY: usize = 128;

/// Number of extra-timestamp packets that close a chunk.
const EXTRA_PACKETS_PER_CHUNK: usize = 3;

/// Streaming frame parser.
pub struct FrameParser {
    sink: Arc<dyn EventSink>,
    dispatcher: Option<Arc<DecodeDispatcher>>,
    reorder: Option<ReorderBuffer>,
    in_chunk: bool,
    chunk_words_remaining: u32,
    chip_index: u8,
    local_chunk_id: u64,
    chunk_meta: ChunkMetadata,
    extras: Vec<ExtraTimestamp>,
    saw_first_header: bool,
    mid_stream_flagged: bool,
    batch: Vec<u64>,
}

impl FrameParser {
    /// Creates a parser decoding inline into `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            dispatcher: None,
            reorder: None,
            in_chunk: false,
            chunk_words_remaining: 0,
            chip_index: 0,
            local_chunk_id: 0,
            chunk_meta: ChunkMetadata::default(),
            extras: Vec::with_capacity(EXTRA_PACKETS_PER_CHUNK),
            saw_first_header: false,
            mid_stream_flagged: false,
            batch: Vec::with_capacity(BATCH_CAPACITY),
        }
    }

    /// Routes decode batches to `dispatcher` instead of decoding inline.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<DecodeDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Enables reordering of sequenced SPIDR packets with the given window.
    #[must_use]
    pub fn with_reorder(mut self, window: usize, chunk_aware: bool) -> Self {
        self.reorder = Some(ReorderBuffer::new(window, chunk_aware));
        self
    }

    /// Reorder counters, when reordering is enabled.
    #[must_use]
    pub fn reorder_stats(&self) -> Option<ReorderStats> {
        self.reorder.as_ref().map(ReorderBuffer::stats)
    }

    /// Chunk metadata currently in effect.
    #[must_use]
    pub fn chunk_meta(&self) -> ChunkMetadata {
        self.chunk_meta
    }

    /// Feeds whole 8-byte words from `bytes`; the ingress collaborator must
    /// carry any unaligned tail across calls. Returns the number of words
    /// consumed.
    pub fn process(&mut self, bytes: &[u8]) -> usize {
        let mut words = 0;
        for chunk in bytes.chunks_exact(8) {
            let word = u64::from_le_bytes(chunk.try_into().expect("chunks_exact yields 8 bytes"));
            self.process_word(word);
            words += 1;
        }
        words
    }

    /// Processes a single word in arrival order.
    pub fn process_word(&mut self, word: u64) {
        if let Some(header) = ChunkHeader::parse(word) {
            if header.is_well_formed() {
                self.start_chunk(&header);
                return;
            }
            // Bad geometry: not recognised as a chunk start.
        }

        if !self.in_chunk || self.chunk_words_remaining == 0 {
            if !self.saw_first_header && !self.mid_stream_flagged {
                self.mid_stream_flagged = true;
                self.sink.on_started_mid_stream();
            }
            self.sink.on_packet_bytes(PacketClass::OutsideChunk, 8);
            return;
        }

        self.chunk_words_remaining -= 1;
        let near_end = self.chunk_words_remaining <= EXTRA_PACKETS_PER_CHUNK as u32;
        let byte = top_byte(word);

        if near_end && (byte == 0x51 || byte == 0x21) {
            self.flush_batch();
            self.sink.on_packet_bytes(PacketClass::ExtraTimestamp, 8);
            self.take_extra(decode_extra_timestamp(word));
        } else if byte == 0x50 && self.reorder.is_some() {
            self.flush_batch();
            self.submit_sequenced(word);
            if self.batch.len() >= BATCH_CAPACITY {
                self.flush_batch();
            }
        } else {
            self.batch.push(word);
            if self.batch.len() >= BATCH_CAPACITY {
                self.flush_batch();
            }
        }

        if self.chunk_words_remaining == 0 {
            self.flush_batch();
            self.in_chunk = false;
        }
    }

    /// Flushes everything still buffered (reorder stragglers and the open
    /// batch). Call at end-of-stream and before a final statistics print.
    pub fn finish(&mut self) {
        self.flush_reorder();
        self.flush_batch();
    }

    fn start_chunk(&mut self, header: &ChunkHeader) {
        // Stragglers still buffered for the previous chunk release under
        // that chunk's chip and metadata.
        self.flush_reorder();
        self.flush_batch();

        self.sink.on_packet_bytes(PacketClass::ChunkHeader, 8);
        self.sink.on_chunk_start(header.chip_index());

        self.in_chunk = true;
        self.chunk_words_remaining = header.size_words();
        self.chip_index = header.chip_index();
        self.local_chunk_id += 1;
        self.chunk_meta = ChunkMetadata::default();
        self.extras.clear();
        self.saw_first_header = true;
    }

    fn take_extra(&mut self, extra: ExtraTimestamp) {
        if self.extras.len() >= EXTRA_PACKETS_PER_CHUNK {
            return;
        }
        self.extras.push(extra);
        if self.extras.len() == EXTRA_PACKETS_PER_CHUNK {
            // Fixed arrival order: generation time, minimum, maximum.
            self.chunk_meta = ChunkMetadata {
                packet_gen_ticks: self.extras[0].timestamp_ticks,
                min_ticks: self.extras[1].timestamp_ticks,
                max_ticks: self.extras[2].timestamp_ticks,
                has_extras: true,
            };
            self.sink.on_chunk_meta(self.chunk_meta);
        }
    }

    fn submit_sequenced(&mut self, word: u64) {
        let Some(packet_id) = decode_spidr_packet_id(word) else {
            self.batch.push(word);
            return;
        };
        let Self {
            reorder,
            batch,
            sink,
            local_chunk_id,
            ..
        } = self;
        if let Some(rb) = reorder.as_mut() {
            let outcome = rb.submit(word, packet_id, *local_chunk_id, &mut |w| batch.push(w));
            if outcome == SubmitOutcome::DroppedTooOld {
                // Dropped words never reach the decode path; account here
                // so byte totals still cover every word seen.
                sink.on_packet_bytes(PacketClass::SpidrPacketId, 8);
            }
        }
    }

    fn flush_reorder(&mut self) {
        let Self { reorder, batch, .. } = self;
        if let Some(rb) = reorder.as_mut() {
            rb.flush(&mut |w| batch.push(w));
        }
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let mut words = std::mem::take(&mut self.batch);
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.submit(DecodeTask {
                words,
                chip_index: self.chip_index,
                meta: self.chunk_meta,
            });
            self.batch = Vec::with_capacity(BATCH_CAPACITY);
        } else {
            for &word in &words {
                self.decode_inline(word);
            }
            words.clear();
            self.batch = words;
        }
    }

    fn decode_inline(&self, word: u64) {
        let class = classify(word);
        self.sink.on_packet_bytes(class, 8);
        if class == PacketClass::Unknown {
            self.sink.on_unknown_packet(word);
            return;
        }
        match decode_word(word, self.chip_index) {
            Ok(Packet::Hit(mut hit)) => {
                if self.chunk_meta.has_extras {
                    extend_pixel_toa(&mut hit, self.chunk_meta.min_ticks);
                }
                self.sink.on_hit(hit);
            }
            Ok(Packet::Tdc(tdc)) => self.sink.on_tdc(tdc, self.chip_index),
            Ok(Packet::SpidrControl(ctrl)) => self.sink.on_spidr_control(ctrl),
            Ok(Packet::Tpx3Control(cmd)) => self.sink.on_tpx3_control(cmd),
            Ok(Packet::GlobalTime(gt)) => self.sink.on_global_time(gt),
            // Packet ids and stray extras are covered by byte accounting.
            Ok(Packet::SpidrPacketId(_) | Packet::ExtraTimestamp(_)) => {}
            Err(err) => self.sink.on_decode_error(&err),
        }
    }
}
