//! servalrx-io: ingress collaborators for the servalrx pipeline.
//!
//! Delivers frame-aligned byte buffers to the parser from either a plain
//! TCP client connection (live SERVAL stream) or a memory-mapped capture
//! file, with a bounded drop-oldest queue decoupling the receive loop
//! from parsing in TCP mode.

mod error;
pub mod file;
pub mod queue;
pub mod tcp;

pub use error::{IngressError, Result};
pub use file::{FileIngress, IngressSummary, MappedFile, DEFAULT_FEED_BYTES};
pub use queue::{BufferQueue, DEFAULT_QUEUE_SIZE};
pub use tcp::{
    ConnectionCounters, ConnectionStats, TcpConfig, TcpIngress, DEFAULT_READ_BUFFER,
    DEFAULT_RECV_BUFFER,
};
