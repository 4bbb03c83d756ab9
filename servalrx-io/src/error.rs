//! Ingress error types.

use thiserror::Error;

/// Result type for ingress operations.
pub type Result<T> = std::result::Result<T, IngressError>;

/// Errors raised by the file and TCP ingress paths.
#[derive(Error, Debug)]
pub enum IngressError {
    /// Host/port did not resolve to a usable address.
    #[error("cannot resolve {0}")]
    AddressResolution(String),

    /// The peer closed or the connection failed mid-stream.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
