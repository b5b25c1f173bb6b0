//! Wire protocol error types.

use starling_types::NodeId;
use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum WireError {
    /// Configured packet size cannot hold a header plus one payload byte.
    #[error("packet size {got} below minimum {min}")]
    PacketSizeTooSmall { got: usize, min: usize },

    /// A fragment arrived out of position within a sender's action.
    ///
    /// The transport guarantees per-sender FIFO, so this indicates a
    /// transport violation, not packet loss.
    #[error("fragment {got} of action {serial} from {sender} arrived at position {expected}")]
    FragmentOutOfOrder {
        sender: NodeId,
        serial: u64,
        expected: u32,
        got: u32,
    },

    /// A continuation fragment arrived for an action we never started.
    #[error("orphan fragment {idx} of unknown action {serial} from {sender}")]
    OrphanFragment {
        sender: NodeId,
        serial: u64,
        idx: u32,
    },

    /// Buffer ended before the record did.
    #[error("truncated record: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// A member id exceeds the wire bound (40 bytes with terminator).
    #[error("member id of {len} bytes exceeds wire bound")]
    MemberIdTooLong { len: usize },

    /// A member id contains an interior NUL byte.
    #[error("member id contains an interior NUL byte")]
    MemberIdInteriorNul,

    /// Configuration record failed structural validation.
    #[error("malformed configuration record: {0}")]
    MalformedConf(String),

    /// Service message failed to decode.
    #[error("service message decode failed: {0}")]
    Service(#[from] postcard::Error),
}
