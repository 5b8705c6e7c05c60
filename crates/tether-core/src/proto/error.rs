//! Protocol error taxonomy and wire limits.

/// Wire protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16 MiB). Validated before any allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by framing, handshake, and session-contract enforcement.
///
/// Contract violations (`Preconnect`, `KindMismatch`, `WrongResponse`,
/// `UnknownOp`) are terminal for their session and are never retried;
/// transport-level variants surface to the reconcile boundary where the
/// work is requeued with backoff.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame exceeded the negotiated maximum size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Observed frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Underlying socket failure.
    #[error("transport I/O error")]
    Io(#[from] std::io::Error),

    /// A frame could not be decoded as a protocol message.
    #[error("malformed protocol message")]
    Decode(#[from] prost::DecodeError),

    /// The peer speaks an incompatible protocol version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Version spoken locally.
        local: u32,
        /// Version announced by the peer.
        remote: u32,
    },

    /// The server refused the handshake.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected {
        /// Reason carried by the `HelloNack`.
        reason: String,
    },

    /// A non-handshake frame arrived during the handshake phase, or vice
    /// versa.
    #[error("unexpected message during handshake")]
    UnexpectedHandshake,

    /// The first request on a session stream was not `Connect`.
    #[error("first request on a session must be Connect, got {got}")]
    Preconnect {
        /// Name of the offending operation.
        got: String,
    },

    /// A request's kind did not match the kind pinned at connect.
    #[error("resource kind mismatch: session is pinned to {expected}, got {got}")]
    KindMismatch {
        /// The pinned kind.
        expected: String,
        /// The kind carried by the offending request.
        got: String,
    },

    /// A response variant did not match the request in flight.
    #[error("wrong response variant: expected {expected}, got {got}")]
    WrongResponse {
        /// Expected variant name.
        expected: &'static str,
        /// Received variant name.
        got: String,
    },

    /// A request carried no recognizable operation.
    #[error("no matching operation found in request")]
    UnknownOp,

    /// A frame referenced a stream this end does not know.
    #[error("frame for unknown stream {stream}")]
    UnknownStream {
        /// The offending stream id.
        stream: u64,
    },

    /// A stream id violated the allocation rules (even, zero, or reused).
    #[error("invalid stream id {stream}")]
    InvalidStream {
        /// The offending stream id.
        stream: u64,
    },

    /// The connection closed while an exchange was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Shorthand used by the frame codec.
    #[must_use]
    pub fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_contract() {
        let err = ProtocolError::KindMismatch {
            expected: "example.org/v1, Kind=Widget".into(),
            got: "example.org/v1, Kind=Gadget".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Widget"));
        assert!(msg.contains("Gadget"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ProtocolError = io.into();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
