//! The event-sink seam between the parser and its consumers.

use servalrx_core::{
    ChunkMetadata, DecodeError, GlobalTime, PacketClass, PixelHit, SpidrControl, TdcEvent,
    Tpx3ControlCmd,
};

/// Receiver for everything the decode path produces.
///
/// The statistics aggregator is the production implementation; [`NullSink`]
/// discards everything for tests and benchmarks. All methods take `&self`
/// so a sink can be shared across the parser and the worker pool.
pub trait EventSink: Send + Sync {
    /// A pixel hit was decoded (ToA already extended when metadata allowed).
    fn on_hit(&self, hit: PixelHit);

    /// A TDC event was decoded inside a chunk owned by `chip_index`.
    fn on_tdc(&self, tdc: TdcEvent, chip_index: u8);

    /// A chunk header was accepted; `chip_index` is the owning chip.
    fn on_chunk_start(&self, chip_index: u8);

    /// All three extra-timestamp packets of a chunk were seen.
    fn on_chunk_meta(&self, meta: ChunkMetadata);

    /// `bytes` of stream data were attributed to `class`.
    fn on_packet_bytes(&self, class: PacketClass, bytes: u64);

    /// A pixel or TDC word failed to decode.
    fn on_decode_error(&self, err: &DecodeError);

    /// A word matched no dispatch at all.
    fn on_unknown_packet(&self, word: u64);

    /// The stream did not open on a chunk header.
    fn on_started_mid_stream(&self);

    /// A SPIDR control packet (shutter / heartbeat) was decoded.
    fn on_spidr_control(&self, _ctrl: SpidrControl) {}

    /// A TPX3 control command was decoded.
    fn on_tpx3_control(&self, _cmd: Tpx3ControlCmd) {}

    /// A global-time word was decoded.
    fn on_global_time(&self, _gt: GlobalTime) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_hit(&self, _hit: PixelHit) {}
    fn on_tdc(&self, _tdc: TdcEvent, _chip_index: u8) {}
    fn on_chunk_start(&self, _chip_index: u8) {}
    fn on_chunk_meta(&self, _meta: ChunkMetadata) {}
    fn on_packet_bytes(&self, _class: PacketClass, _bytes: u64) {}
    fn on_decode_error(&self, _err: &DecodeError) {}
    fn on_unknown_packet(&self, _word: u64) {}
    fn on_started_mid_stream(&self) {}
}
