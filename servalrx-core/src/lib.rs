//! servalrx-core: TPX3 packet codec, event types, and timestamp extension.
//!
//! This crate holds the pure bit-level layer of the pipeline: no I/O, no
//! allocation on the per-word paths, so the decoders stay cheap to call
//! from worker shards and straightforward to property-test.
//!
//! # Key Components
//!
//! - [`packet`] - word classification, chunk headers, per-type decoders
//! - [`bits`] - field extraction and the pixel address mapping
//! - [`extension`] - 30-bit to 54-bit timestamp extension
//! - [`event`] - decoded event types shared across the workspace

pub mod bits;
pub mod error;
pub mod event;
pub mod extension;
pub mod packet;

pub use bits::{get_bits, matches_nibble, pixaddr_to_xy, TICK_NS};
pub use error::{DecodeError, Result};
pub use event::{
    ChunkMetadata, ExtraTimestamp, GlobalTime, PixelHit, PixelMode, SpidrControl,
    SpidrControlCmd, TdcEvent, TdcKind, Tpx3ControlCmd,
};
pub use extension::{extend_pixel_toa, extend_timestamp, PIXEL_TOA_BITS};
pub use packet::{
    classify, decode_extra_timestamp, decode_global_time, decode_pixel,
    decode_pixel_count_fb, decode_pixel_standard, decode_spidr_control,
    decode_spidr_packet_id, decode_tdc, decode_tpx3_control, decode_word, decode_words,
    decode_words_parallel, make_chunk_header, ChunkHeader, Packet, PacketClass, TPX3_MAGIC,
};
