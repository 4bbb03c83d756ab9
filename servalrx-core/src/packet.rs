//! TPX3 packet classification and per-type decoders.
//!
//! The stream is a sequence of 64-bit little-endian words. Most packet
//! types are identified by the top nibble; a handful need the full top
//! byte (`0x50` vs nibble `0x5`, `0x71` vs nibble `0x7`, the extra
//! timestamp variants, the global-time pair). Full-byte types are checked
//! first, then the nibble fallback.

use crate::bits::{get_bits, matches_nibble, pixaddr_to_xy, top_byte};
use crate::error::{DecodeError, Result};
use crate::event::{
    ExtraTimestamp, GlobalTime, PixelHit, PixelMode, SpidrControl, SpidrControlCmd, TdcEvent,
    TdcKind, Tpx3ControlCmd,
};
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// ASCII `'T','P','X','3'` in little-endian, carried in bits 31..0 of a
/// chunk header word.
pub const TPX3_MAGIC: u64 = 0x3358_5054;

/// A chunk header word.
///
/// Bits 31..0 hold the magic, bits 47..32 the chip index (low byte
/// meaningful), bits 63..48 the chunk size in bytes including the header
/// word itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkHeader {
    word: u64,
}

impl ChunkHeader {
    /// True if the low 32 bits carry the TPX3 magic.
    #[inline]
    #[must_use]
    pub fn magic_matches(word: u64) -> bool {
        (word & 0xFFFF_FFFF) == TPX3_MAGIC
    }

    /// Interprets `word` as a chunk header if the magic matches.
    #[must_use]
    pub fn parse(word: u64) -> Option<Self> {
        Self::magic_matches(word).then_some(Self { word })
    }

    /// Chunk size in bytes, including the 8-byte header word.
    #[inline]
    #[must_use]
    pub fn chunk_size_bytes(&self) -> u16 {
        ((self.word >> 48) & 0xFFFF) as u16
    }

    /// Chip index from bits 47..32 (only the low byte is meaningful).
    #[inline]
    #[must_use]
    pub fn chip_index(&self) -> u8 {
        ((self.word >> 32) & 0xFF) as u8
    }

    /// True when the size field satisfies the chunk geometry contract:
    /// a positive multiple of 8. Headers failing this are not treated as
    /// chunk starts; their bytes fall through to outside-chunk accounting.
    #[inline]
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let size = self.chunk_size_bytes();
        size > 0 && size % 8 == 0
    }

    /// Number of 64-bit words the size field covers (header included).
    #[inline]
    #[must_use]
    pub fn size_words(&self) -> u32 {
        u32::from(self.chunk_size_bytes()) / 8
    }
}

/// Builds a chunk header word, used by tests and stream generators.
#[must_use]
pub fn make_chunk_header(chunk_size_bytes: u16, chip_index: u8) -> u64 {
    TPX3_MAGIC | (u64::from(chip_index) << 32) | (u64::from(chunk_size_bytes) << 48)
}

/// Packet classes, used both for dispatch and for the byte-accounting
/// table. Labels exist for printing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(usize)]
pub enum PacketClass {
    /// Chunk header word (magic matched).
    ChunkHeader,
    /// Pixel data, count_fb mode (nibble 0xA).
    PixelCountFb,
    /// Pixel data, standard mode (nibble 0xB).
    PixelStandard,
    /// TDC data (nibble 0x6).
    Tdc,
    /// Global time low word (byte 0x44).
    GlobalTimeLow,
    /// Global time high word (byte 0x45).
    GlobalTimeHigh,
    /// SPIDR packet id (byte 0x50).
    SpidrPacketId,
    /// SPIDR control (nibble 0x5, byte != 0x50).
    SpidrControl,
    /// TPX3 control (byte 0x71).
    Tpx3Control,
    /// Extra timestamp, TPX3 (0x51) or MPX3 (0x21) variant.
    ExtraTimestamp,
    /// Word seen outside any chunk.
    OutsideChunk,
    /// No dispatch matched.
    Unknown,
}

impl PacketClass {
    /// Number of classes, sizing the accounting tables.
    pub const COUNT: usize = 12;

    /// All classes in table-print order.
    pub const ALL: [PacketClass; Self::COUNT] = [
        PacketClass::ChunkHeader,
        PacketClass::PixelCountFb,
        PacketClass::PixelStandard,
        PacketClass::Tdc,
        PacketClass::GlobalTimeLow,
        PacketClass::GlobalTimeHigh,
        PacketClass::SpidrPacketId,
        PacketClass::SpidrControl,
        PacketClass::Tpx3Control,
        PacketClass::ExtraTimestamp,
        PacketClass::OutsideChunk,
        PacketClass::Unknown,
    ];

    /// Human-readable label for the accounting table.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            PacketClass::ChunkHeader => "chunk header",
            PacketClass::PixelCountFb => "pixel (count_fb)",
            PacketClass::PixelStandard => "pixel (standard)",
            PacketClass::Tdc => "tdc",
            PacketClass::GlobalTimeLow => "global time low",
            PacketClass::GlobalTimeHigh => "global time high",
            PacketClass::SpidrPacketId => "spidr packet id",
            PacketClass::SpidrControl => "spidr control",
            PacketClass::Tpx3Control => "tpx3 control",
            PacketClass::ExtraTimestamp => "extra timestamp",
            PacketClass::OutsideChunk => "outside chunk",
            PacketClass::Unknown => "unknown",
        }
    }
}

/// Classifies a data word. Full-byte types are matched before the nibble
/// fallback, so `0x50` never reaches the `0x5` arm.
#[must_use]
pub fn classify(word: u64) -> PacketClass {
    if ChunkHeader::magic_matches(word) {
        return PacketClass::ChunkHeader;
    }
    match top_byte(word) {
        0x44 => return PacketClass::GlobalTimeLow,
        0x45 => return PacketClass::GlobalTimeHigh,
        0x50 => return PacketClass::SpidrPacketId,
        0x51 | 0x21 => return PacketClass::ExtraTimestamp,
        0x71 => return PacketClass::Tpx3Control,
        _ => {}
    }
    match (word >> 60) as u8 {
        0xA => PacketClass::PixelCountFb,
        0xB => PacketClass::PixelStandard,
        0x6 => PacketClass::Tdc,
        0x5 => PacketClass::SpidrControl,
        _ => PacketClass::Unknown,
    }
}

/// Decodes a standard-mode (0xB) pixel word.
pub fn decode_pixel_standard(word: u64, chip_index: u8) -> Result<PixelHit> {
    let pixaddr = get_bits(word, 59, 44) as u16;
    let (x, y) = pixaddr_to_xy(pixaddr);
    if x > 255 || y > 255 {
        return Err(DecodeError::PixelFieldOutOfRange { x, y });
    }

    let toa = get_bits(word, 43, 30);
    let tot = get_bits(word, 29, 20) as u32;
    let ftoa = get_bits(word, 19, 16);
    let spidr = get_bits(word, 15, 0);

    // FToA counts in negative 1.5625 ns units; the subtraction wraps at
    // spidr == toa == 0.
    let toa_ticks = (((spidr << 14) | toa) << 4).wrapping_sub(ftoa);

    Ok(PixelHit {
        x,
        y,
        toa_ticks,
        tot_ns: tot * 25,
        chip_index,
        mode: PixelMode::Standard,
    })
}

/// Decodes a count_fb-mode (0xA) pixel word.
pub fn decode_pixel_count_fb(word: u64, chip_index: u8) -> Result<PixelHit> {
    let pixaddr = get_bits(word, 59, 44) as u16;
    let (x, y) = pixaddr_to_xy(pixaddr);
    if x > 255 || y > 255 {
        return Err(DecodeError::PixelFieldOutOfRange { x, y });
    }

    let integrated_tot = get_bits(word, 43, 30) as u32;
    let event_count = get_bits(word, 29, 20);
    // Hit count in bits 19..16 is not currently used.
    let spidr = get_bits(word, 15, 0);

    Ok(PixelHit {
        x,
        y,
        toa_ticks: ((spidr << 14) | event_count) << 4,
        tot_ns: integrated_tot * 25,
        chip_index,
        mode: PixelMode::CountFb,
    })
}

/// Decodes either pixel variant, dispatching on the type nibble.
pub fn decode_pixel(word: u64, chip_index: u8) -> Result<PixelHit> {
    if matches_nibble(word, 0xB) {
        decode_pixel_standard(word, chip_index)
    } else if matches_nibble(word, 0xA) {
        decode_pixel_count_fb(word, chip_index)
    } else {
        Err(DecodeError::NotAPixelPacket(word))
    }
}

/// Decodes a TDC (0x6) word.
///
/// A fine phase of 0 is coerced to 1 (older firmware emits it); anything
/// above 12 is rejected.
pub fn decode_tdc(word: u64) -> Result<TdcEvent> {
    let kind_bits = get_bits(word, 59, 56) as u8;
    let kind = TdcKind::from_bits(kind_bits).ok_or(DecodeError::UnknownPacketType(word))?;

    let trigger_count = get_bits(word, 55, 44) as u16;
    let coarse = get_bits(word, 43, 9);
    let mut fine = get_bits(word, 8, 5) as u8;

    if fine == 0 {
        fine = 1;
    } else if fine > 12 {
        return Err(DecodeError::TdcFractionalOutOfRange(fine));
    }

    // 3.125 ns coarse counter to 1.5625 ns ticks: (coarse << 1) plus the
    // half-tick from the fine phase.
    let timestamp_ticks = (coarse << 1) | u64::from((fine - 1) / 6);

    Ok(TdcEvent {
        kind,
        trigger_count,
        timestamp_ticks,
        fine,
    })
}

/// Extracts the 48-bit packet count from a SPIDR packet-id (0x50) word.
#[must_use]
pub fn decode_spidr_packet_id(word: u64) -> Option<u64> {
    (top_byte(word) == 0x50).then(|| get_bits(word, 47, 0))
}

/// Decodes a SPIDR control word (nibble 0x5, full byte != 0x50).
#[must_use]
pub fn decode_spidr_control(word: u64) -> Option<SpidrControl> {
    if !matches_nibble(word, 0x5) || top_byte(word) == 0x50 {
        return None;
    }
    let command = match get_bits(word, 59, 56) as u8 {
        0xF => SpidrControlCmd::ShutterOpen,
        0xA => SpidrControlCmd::ShutterClose,
        0xC => SpidrControlCmd::Heartbeat,
        _ => return None,
    };
    Some(SpidrControl {
        command,
        timestamp_25ns: get_bits(word, 45, 12),
    })
}

/// Decodes a TPX3 control word (byte 0x71).
#[must_use]
pub fn decode_tpx3_control(word: u64) -> Option<Tpx3ControlCmd> {
    if top_byte(word) != 0x71 {
        return None;
    }
    match get_bits(word, 55, 48) as u8 {
        0xA0 => Some(Tpx3ControlCmd::EndSequential),
        0xB0 => Some(Tpx3ControlCmd::EndDataDriven),
        _ => None,
    }
}

/// Decodes an extra-timestamp word (byte 0x51 TPX3, 0x21 MPX3).
#[must_use]
pub fn decode_extra_timestamp(word: u64) -> ExtraTimestamp {
    ExtraTimestamp {
        mpx3: top_byte(word) == 0x21,
        error_flag: get_bits(word, 55, 55) != 0,
        overflow_flag: get_bits(word, 54, 54) != 0,
        timestamp_ticks: get_bits(word, 53, 0),
    }
}

/// Decodes a global-time word (byte 0x44 low, 0x45 high).
#[must_use]
pub fn decode_global_time(word: u64) -> Option<GlobalTime> {
    let (high_word, time_value) = match top_byte(word) {
        0x44 => (false, get_bits(word, 47, 16) as u32),
        0x45 => (true, get_bits(word, 31, 16) as u32),
        _ => return None,
    };
    Some(GlobalTime {
        high_word,
        time_value,
        spidr_time: get_bits(word, 15, 0) as u16,
    })
}

/// A fully decoded data word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Packet {
    /// A pixel hit.
    Hit(PixelHit),
    /// A TDC event.
    Tdc(TdcEvent),
    /// A global-time word.
    GlobalTime(GlobalTime),
    /// A SPIDR packet id with its 48-bit counter.
    SpidrPacketId(u64),
    /// A SPIDR control packet.
    SpidrControl(SpidrControl),
    /// A TPX3 control command.
    Tpx3Control(Tpx3ControlCmd),
    /// An extra-timestamp packet.
    ExtraTimestamp(ExtraTimestamp),
}

impl Packet {
    /// True if this is a pixel hit.
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Packet::Hit(_))
    }

    /// Extracts the hit if this is a hit packet.
    #[must_use]
    pub fn as_hit(&self) -> Option<&PixelHit> {
        match self {
            Packet::Hit(hit) => Some(hit),
            _ => None,
        }
    }
}

/// Decodes a single data word (not a chunk header) into a [`Packet`].
pub fn decode_word(word: u64, chip_index: u8) -> Result<Packet> {
    match classify(word) {
        PacketClass::PixelCountFb => decode_pixel_count_fb(word, chip_index).map(Packet::Hit),
        PacketClass::PixelStandard => decode_pixel_standard(word, chip_index).map(Packet::Hit),
        PacketClass::Tdc => decode_tdc(word).map(Packet::Tdc),
        PacketClass::GlobalTimeLow | PacketClass::GlobalTimeHigh => decode_global_time(word)
            .map(Packet::GlobalTime)
            .ok_or(DecodeError::UnknownPacketType(word)),
        PacketClass::SpidrPacketId => decode_spidr_packet_id(word)
            .map(Packet::SpidrPacketId)
            .ok_or(DecodeError::UnknownPacketType(word)),
        PacketClass::SpidrControl => decode_spidr_control(word)
            .map(Packet::SpidrControl)
            .ok_or(DecodeError::UnknownPacketType(word)),
        PacketClass::Tpx3Control => decode_tpx3_control(word)
            .map(Packet::Tpx3Control)
            .ok_or(DecodeError::UnknownPacketType(word)),
        PacketClass::ExtraTimestamp => Ok(Packet::ExtraTimestamp(decode_extra_timestamp(word))),
        _ => Err(DecodeError::UnknownPacketType(word)),
    }
}

/// Decodes a slice of data words sequentially, skipping undecodable ones.
#[must_use]
pub fn decode_words(words: &[u64], chip_index: u8) -> Vec<Packet> {
    words
        .iter()
        .filter_map(|&w| decode_word(w, chip_index).ok())
        .collect()
}

/// Parallel variant of [`decode_words`] for offline batch work.
#[must_use]
pub fn decode_words_parallel(words: &[u64], chip_index: u8) -> Vec<Packet> {
    words
        .par_iter()
        .filter_map(|&w| decode_word(w, chip_index).ok())
        .collect()
}
