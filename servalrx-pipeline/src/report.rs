//! Rate-limited decode-error reporting.

use servalrx_core::DecodeError;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Default number of occurrences logged per error kind.
pub const DEFAULT_REPORT_LIMIT: u64 = 5;

/// Logs the first few occurrences of each decode-error kind, then goes
/// quiet. Counting stays exact in the aggregator; this only throttles the
/// log output so a corrupt stream cannot flood stderr.
#[derive(Debug)]
pub struct ErrorReporter {
    limit: u64,
    pixel: AtomicU64,
    tdc: AtomicU64,
    unknown: AtomicU64,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_LIMIT)
    }
}

impl ErrorReporter {
    /// Creates a reporter logging at most `limit` occurrences per kind.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            pixel: AtomicU64::new(0),
            tdc: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    /// Reports a decode error, logging while under the per-kind limit.
    pub fn report(&self, err: &DecodeError) {
        let counter = match err {
            DecodeError::PixelFieldOutOfRange { .. } | DecodeError::NotAPixelPacket(_) => {
                &self.pixel
            }
            DecodeError::TdcFractionalOutOfRange(_) => &self.tdc,
            DecodeError::UnknownPacketType(_) => &self.unknown,
        };
        let seen = counter.fetch_add(1, Ordering::Relaxed);
        if seen < self.limit {
            warn!("decode error: {err}");
        }
    }

    /// Reports an unknown packet word under the same throttle.
    pub fn report_unknown(&self, word: u64) {
        let seen = self.unknown.fetch_add(1, Ordering::Relaxed);
        if seen < self.limit {
            warn!("unknown packet type: {word:#018x}");
        }
    }
}
