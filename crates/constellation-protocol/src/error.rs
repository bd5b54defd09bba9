//! Decode-side error taxonomy shared by all wire codecs.

use thiserror::Error;

/// A received frame or payload could not be decoded.
///
/// Receive loops log these at WARN, drop the offending datagram or message
/// and continue; they never tear down the process.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid message length {got}, expected {expected}")]
    Length { expected: usize, got: usize },

    #[error("wrong protocol identifier, expected {expected}")]
    Protocol { expected: &'static str },

    #[error("unsupported protocol version {0}")]
    Version(u8),

    #[error("invalid {field} value {value}")]
    Field { field: &'static str, value: u64 },

    #[error("malformed payload: {0}")]
    Payload(String),
}

impl DecodeError {
    /// Shorthand for a free-form payload error.
    pub fn payload(msg: impl Into<String>) -> Self {
        DecodeError::Payload(msg.into())
    }
}

impl From<rmpv::decode::Error> for DecodeError {
    fn from(err: rmpv::decode::Error) -> Self {
        DecodeError::Payload(err.to_string())
    }
}
