//! Error taxonomy for the transport layer.
//!
//! Channel-internal failures (a dead channel, a send worth retrying on another
//! channel) never reach the caller directly; they drive the failover loop in
//! [`crate::transport::Transport`]. Everything in [`TransportError`] is a final
//! caller-visible outcome.

use std::io;

/// Completion status carried in every reply header.
///
/// The operation-specific payload that follows the header is opaque to this
/// layer; the status is the only reply field the transport interprets. Replies
/// synthesized locally (channel death, flush) carry [`ReplyStatus::IoError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The host processed the request; the payload is valid.
    Success,
    /// I/O failure, either reported by the host or synthesized when the
    /// carrying channel died with the request in flight.
    IoError,
    /// The host could not parse the request.
    ProtocolError,
    /// Unrecognized status code, passed through for the caller to judge.
    Unknown(u32),
}

impl ReplyStatus {
    /// Wire encoding of this status.
    pub fn to_wire(self) -> u32 {
        match self {
            ReplyStatus::Success => 0,
            ReplyStatus::IoError => 1,
            ReplyStatus::ProtocolError => 2,
            ReplyStatus::Unknown(code) => code,
        }
    }

    /// Decode a wire status, preserving unknown codes.
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => ReplyStatus::Success,
            1 => ReplyStatus::IoError,
            2 => ReplyStatus::ProtocolError,
            other => ReplyStatus::Unknown(other),
        }
    }

    /// True for [`ReplyStatus::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, ReplyStatus::Success)
    }
}

/// Errors surfaced by [`crate::transport::Transport`] operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No channel could be opened. The request was removed from the pending
    /// index before returning; nothing is left in flight.
    #[error("no transport channel available")]
    ConnectionFailed,

    /// The caller was interrupted before the request reached a channel. The
    /// request was not dispatched and no channel state was changed.
    #[error("interrupted before dispatch")]
    Interrupted,

    /// The request completed, but with a non-success status. This includes
    /// IO-error completions synthesized while flushing a dead channel.
    #[error("request completed with status {0:?}")]
    RequestFailed(ReplyStatus),

    /// Buffer allocation failed.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The requested payload size exceeds what the allocating channel can
    /// carry in one message.
    #[error("payload of {requested} bytes exceeds channel limit of {limit}")]
    PayloadTooLarge { requested: usize, limit: usize },

    /// Backend-level I/O failure outside the failover loop's reach.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_roundtrip() {
        for status in [
            ReplyStatus::Success,
            ReplyStatus::IoError,
            ReplyStatus::ProtocolError,
            ReplyStatus::Unknown(77),
        ] {
            assert_eq!(ReplyStatus::from_wire(status.to_wire()), status);
        }
    }

    #[test]
    fn test_unknown_codes_preserved() {
        assert_eq!(ReplyStatus::from_wire(940), ReplyStatus::Unknown(940));
        assert_eq!(ReplyStatus::Unknown(940).to_wire(), 940);
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::PayloadTooLarge {
            requested: 1 << 24,
            limit: 6 * 1024,
        };
        assert!(err.to_string().contains("exceeds channel limit"));
    }
}
