//! # Client Errors
//!
//! One variant per failure class a transaction can surface. Factory and
//! codec errors travel through the pool unchanged; the pool only decides
//! whether the connection survives.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for the projector client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the factory, codec, pool and client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Dialing the device failed (refused, unreachable, or dial timeout).
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The device did not greet us with the expected line.
    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    /// The transport accepted fewer bytes than the framed command.
    #[error("wrote {written}/{expected} bytes of command {command:?}")]
    ShortWrite {
        written: usize,
        expected: usize,
        command: String,
    },

    /// Transport-level failure while reading or writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A read or write deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Peer closed the stream before sending a delimiter.
    #[error("connection closed by peer ({buffered} bytes without delimiter)")]
    Eof { buffered: usize },

    /// A response could not be decoded by the caller.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The key cannot name a device.
    #[error("invalid key {0:?}")]
    InvalidKey(String),

    /// The caller cancelled before the transaction started.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// Returns true when a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Timeout(_) => true,
            ClientError::Connect { source, .. } => source.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Returns true when the transport itself failed, as opposed to the
    /// device answering with something unusable.
    ///
    /// The pool discards the connection after any failed transaction; this
    /// only decides how loudly that is logged.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            ClientError::Protocol(_) | ClientError::InvalidKey(_) | ClientError::Cancelled
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}
