//! servalrx-pipeline: the streaming TPX3 decode pipeline.
//!
//! Data flow: ingress hands frame-aligned byte buffers to the
//! [`FrameParser`], which routes each word either straight to the decode
//! path or through the [`ReorderBuffer`]; decode batches run on the
//! [`DecodeDispatcher`] worker pool (or inline), and everything lands in
//! the [`Aggregator`] behind the [`EventSink`] seam.

pub mod dispatch;
pub mod parser;
pub mod reorder;
pub mod report;
pub mod sink;
pub mod stats;

pub use dispatch::{DecodeDispatcher, DecodeTask};
pub use parser::{FrameParser, BATCH_CAPACITY};
pub use reorder::{ReorderBuffer, ReorderStats, SubmitOutcome, DEFAULT_WINDOW};
pub use report::ErrorReporter;
pub use sink::{EventSink, NullSink};
pub use stats::{
    Aggregator, ChipStats, PartialStats, StatsSnapshot, DEFAULT_RECENT_HITS, NUM_CHIPS,
};
