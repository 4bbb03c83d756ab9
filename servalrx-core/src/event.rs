//! Decoded event types.

use crate::bits::TICK_NS;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pixel acquisition mode the hit was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PixelMode {
    /// Count + integrated-ToT frame-based mode (type nibble 0xA).
    CountFb,
    /// Data-driven ToA/ToT mode (type nibble 0xB).
    Standard,
}

/// A decoded pixel hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelHit {
    /// Pixel X coordinate (0-255).
    pub x: u16,
    /// Pixel Y coordinate (0-255).
    pub y: u16,
    /// Time of arrival in 1.5625 ns ticks, 54-bit after extension.
    pub toa_ticks: u64,
    /// Time over threshold in nanoseconds (25 ns counter granularity).
    pub tot_ns: u32,
    /// Chip the hit came from (taken from the chunk header).
    pub chip_index: u8,
    /// Acquisition mode the packet was encoded in.
    pub mode: PixelMode,
}

impl PixelHit {
    /// Time of arrival in nanoseconds.
    #[must_use]
    pub fn toa_ns(&self) -> f64 {
        self.toa_ticks as f64 * TICK_NS
    }
}

/// TDC channel and edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum TdcKind {
    /// TDC1 rising edge.
    Tdc1Rise = 0xF,
    /// TDC1 falling edge.
    Tdc1Fall = 0xA,
    /// TDC2 rising edge.
    Tdc2Rise = 0xE,
    /// TDC2 falling edge.
    Tdc2Fall = 0xB,
}

impl TdcKind {
    /// Maps the 4-bit event-type field, if valid.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0xF => Some(TdcKind::Tdc1Rise),
            0xA => Some(TdcKind::Tdc1Fall),
            0xE => Some(TdcKind::Tdc2Rise),
            0xB => Some(TdcKind::Tdc2Fall),
            _ => None,
        }
    }

    /// True for either edge of channel 1.
    #[must_use]
    pub fn is_tdc1(self) -> bool {
        matches!(self, TdcKind::Tdc1Rise | TdcKind::Tdc1Fall)
    }
}

/// A decoded TDC event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TdcEvent {
    /// Channel and edge.
    pub kind: TdcKind,
    /// 12-bit trigger counter.
    pub trigger_count: u16,
    /// Timestamp in 1.5625 ns ticks (from the 3.125 ns coarse counter and
    /// the 1-12 fine phase).
    pub timestamp_ticks: u64,
    /// Fine phase, 1-12 after the zero-coercion quirk.
    pub fine: u8,
}

/// SPIDR control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SpidrControlCmd {
    /// Shutter open.
    ShutterOpen = 0xF,
    /// Shutter close.
    ShutterClose = 0xA,
    /// Heartbeat.
    Heartbeat = 0xC,
}

/// A decoded SPIDR control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpidrControl {
    /// Command carried by the packet.
    pub command: SpidrControlCmd,
    /// 34-bit timestamp in 25 ns units.
    pub timestamp_25ns: u64,
}

/// TPX3 control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Tpx3ControlCmd {
    /// End of sequential readout.
    EndSequential = 0xA0,
    /// End of data-driven readout.
    EndDataDriven = 0xB0,
}

/// A decoded global-time packet (low or high word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlobalTime {
    /// True for the 0x45 high word (107.374 s units), false for the 0x44
    /// low word (25 ns units).
    pub high_word: bool,
    /// Counter value; 32 bits for the low word, 16 for the high word.
    pub time_value: u32,
    /// SPIDR time in 0.4096 ms units.
    pub spidr_time: u16,
}

/// An extra-timestamp packet from a chunk tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExtraTimestamp {
    /// True for the MPX3 variant (header 0x21) rather than TPX3 (0x51).
    pub mpx3: bool,
    /// Error flag (bit 55), debug only.
    pub error_flag: bool,
    /// Overflow flag (bit 54), debug only.
    pub overflow_flag: bool,
    /// 54-bit timestamp in 1.5625 ns ticks.
    pub timestamp_ticks: u64,
}

/// Metadata gathered from the three extra-timestamp packets at a chunk tail.
///
/// Copied by value into each decode task so workers can extend pixel
/// timestamps without touching shared state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkMetadata {
    /// Packet-generation time in 1.5625 ns ticks.
    pub packet_gen_ticks: u64,
    /// Minimum event time in the chunk, in ticks.
    pub min_ticks: u64,
    /// Maximum event time in the chunk, in ticks.
    pub max_ticks: u64,
    /// True once all three extra packets were seen.
    pub has_extras: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toa_ns_conversion() {
        let hit = PixelHit {
            x: 0,
            y: 0,
            toa_ticks: 64,
            tot_ns: 100,
            chip_index: 0,
            mode: PixelMode::Standard,
        };
        // 64 * 1.5625 = 100 ns
        assert!((hit.toa_ns() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_tdc_kind_mapping() {
        assert_eq!(TdcKind::from_bits(0xF), Some(TdcKind::Tdc1Rise));
        assert_eq!(TdcKind::from_bits(0xA), Some(TdcKind::Tdc1Fall));
        assert_eq!(TdcKind::from_bits(0xE), Some(TdcKind::Tdc2Rise));
        assert_eq!(TdcKind::from_bits(0xB), Some(TdcKind::Tdc2Fall));
        assert_eq!(TdcKind::from_bits(0x0), None);
        assert!(TdcKind::Tdc1Fall.is_tdc1());
        assert!(!TdcKind::Tdc2Rise.is_tdc1());
    }
}
