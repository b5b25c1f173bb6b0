//! # starling-core: Group communication service
//!
//! A virtually synchronous, totally-ordered replication channel on top
//! of a point-to-point transport. Participants join a named channel,
//! broadcast opaque actions of arbitrary size, and receive every
//! delivered action in the same global order with monotonically
//! increasing sequence numbers. The service coordinates membership
//! changes, state-transfer handshakes between a joiner and a donor,
//! group-wide flow control, and a per-node total-order monitor that
//! gates application critical sections by seqno.
//!
//! # Architecture
//!
//! ```text
//! application threads           dispatch thread
//!  send/repl ──frag──► backend ──total order──► defrag ──► group fsm
//!  recv ◄──────────── receive queue ◄── acts + seqnos ◄──────┘
//! ```
//!
//! - [`Connection`] — one endpoint of a channel; the public operations
//! - [`ToMonitor`] — seqno-gated critical section with cancel/interrupt
//! - [`GcsConfig`] / [`ConfigLoader`] — tunables and multi-source loading
//! - [`backend`] — the transport seam and the in-process `dummy://` hub
//!
//! # Ordering contract
//!
//! Inside a primary configuration every member observes the same
//! sequence of global seqnos, strictly increasing by one. Local seqnos
//! are per-connection, gapless from 1 across every delivered act,
//! configuration and flow acts included. A configuration act is always
//! delivered before any act ordered after it.

pub mod backend;
mod config;
mod connection;
mod error;
mod flow;
mod group;
mod logging;
mod recv_queue;
mod repl;
mod to_monitor;


pub use config::{
    ConfigError, ConfigLoader, GcsConfig, TlsOptions, DEFAULT_FC_LOWER, DEFAULT_FC_UPPER,
    DEFAULT_PACKET_SIZE, DEFAULT_RECV_QUEUE_CAP,
};
pub use connection::{Connection, Replicated, StateTransfer};
pub use error::{CoreError, CoreResult, ToError, ToResult};
pub use flow::{FlowControl, FlowDecision};
pub use group::{GroupOutput, GroupState, LocalAct, MemberInfo, StateReqOutcome, ViewInfo};
pub use logging::init as init_logging;
pub use recv_queue::RecvQueue;
pub use to_monitor::ToMonitor;

// Re-export the foundation types alongside the connection API.
pub use starling_types::{
    Act, ActKind, ConfId, ConnState, GroupUuid, MemberId, NodeId, Seqno,
};
pub use starling_wire::ConfRecord;
