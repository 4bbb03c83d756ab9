//! Decode error types.

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Errors produced while decoding a single 64-bit word.
///
/// These are stream-content errors: the pipeline counts them and moves on,
/// it never aborts on one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Pixel address decoded to a coordinate outside the 256x256 matrix.
    #[error("pixel coordinate out of range: x={x}, y={y}")]
    PixelFieldOutOfRange {
        /// Decoded X coordinate.
        x: u16,
        /// Decoded Y coordinate.
        y: u16,
    },

    /// Word handed to the pixel decoder does not carry a pixel type nibble.
    #[error("not a pixel packet: {0:#018x}")]
    NotAPixelPacket(u64),

    /// TDC fine timestamp above 12 (firmware bug or corruption).
    #[error("invalid fractional TDC part: {0}")]
    TdcFractionalOutOfRange(u8),

    /// Neither a full-byte nor a nibble dispatch matched.
    #[error("unknown packet type: {0:#018x}")]
    UnknownPacketType(u64),
}

impl DecodeError {
    /// True for the TDC fractional variant, which is tallied separately.
    pub fn is_fractional(&self) -> bool {
        matches!(self, DecodeError::TdcFractionalOutOfRange(_))
    }
}
