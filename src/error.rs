//! Error types for the SWIM membership engine.

use thiserror::Error;

/// Crate-wide error type, one variant per failure class the engine can
/// surface to a caller.
#[derive(Error, Debug)]
pub enum Error {
    /// A multi-step mutation could not reserve the capacity it needed
    /// before starting (member table, wait-ack heap, round queue).
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Bad configuration: malformed URI, non-IPv4 address, `INADDR_ANY`,
    /// or a missing UUID where one is required.
    #[error("illegal parameter: {0}")]
    IllegalParams(String),

    /// A received packet could not be parsed: truncated buffer,
    /// duplicate UUID within one anti-entropy/dissemination array,
    /// or an unexpected map key.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The UDP socket failed to bind, send, or receive.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A protocol-level precondition was violated: adding a UUID that
    /// already exists, or trying to remove `self`.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransportError(e.to_string())
    }
}
