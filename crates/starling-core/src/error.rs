//! Core error types.

use starling_types::{ConnState, Seqno};
use starling_wire::WireError;
use thiserror::Error;

/// Result type for connection operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by connection operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The connection is closed (or was closed while the caller waited).
    #[error("connection closed")]
    Closed,

    /// Another operation of the same kind is already in flight.
    #[error("operation already in progress")]
    Busy,

    /// The operation is illegal in the connection's current state.
    #[error("operation illegal in state {0}")]
    BadState(ConnState),

    /// The view the operation depended on disappeared; the action was
    /// discarded and its buffer dropped.
    #[error("view lost before delivery")]
    ViewLost,

    /// No eligible state transfer donor exists right now; retriable.
    ///
    /// The handshake still consumed `local_seqno` in the caller's local
    /// order; the caller must skip it.
    #[error("no eligible state transfer donor (skip local seqno {local_seqno})")]
    NoDonor { local_seqno: Seqno },

    /// A peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Wire encode/decode failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Backend transport failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Invalid configuration (URL scheme, packet size, watermarks).
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport reported a condition the connection cannot recover
    /// from.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

/// Result type for TO monitor operations.
pub type ToResult<T> = Result<T, ToError>;

/// Errors surfaced by the total-order monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ToError {
    /// The ring cannot hold this seqno yet; retry after some releases.
    #[error("monitor ring full, retry after releases")]
    Retry,

    /// The seqno was cancelled; it is skipped and stays out of the order.
    #[error("seqno cancelled")]
    Canceled,

    /// The wait was interrupted; the seqno is still pending and must be
    /// grabbed again or self-cancelled.
    #[error("wait interrupted")]
    Interrupted,

    /// The seqno is already past the released cursor.
    #[error("seqno {seqno} already released (cursor at {released})")]
    OutOfRange { seqno: Seqno, released: i64 },

    /// Release or cancel targeted a slot this caller does not hold.
    #[error("slot not held at this seqno")]
    NotHolding,

    /// The monitor still has waiters or a holder.
    #[error("monitor busy: waiters or holder outstanding")]
    Busy,

    /// The monitor was destroyed.
    #[error("monitor destroyed")]
    Destroyed,
}
