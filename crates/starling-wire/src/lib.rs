//! # starling-wire: Binary wire protocol for `Starling`
//!
//! This crate defines everything that crosses the transport boundary:
//!
//! - [`FrameHeader`] / [`fragment`] — splitting an arbitrary-sized action
//!   into bounded frames with per-fragment headers
//! - [`Defrag`] — per-sender reassembly of frames back into sealed actions
//! - [`ConfRecord`] — the packed configuration record carried by CONF acts
//! - [`ServiceMsg`] — postcard-encoded group service traffic
//!
//! The frame and configuration layouts are hand-packed little-endian
//! records: they are external contracts and must stay byte-stable across
//! versions. Service messages are internal to the group and use postcard's
//! canonical encoding.

mod conf;
mod defrag;
mod error;
mod frame;
mod service;

pub use conf::ConfRecord;
pub use defrag::{Defrag, SealedAct};
pub use error::{WireError, WireResult};
pub use frame::{fragment, FrameHeader, FrameKind, FRAME_HEADER_LEN, MIN_PACKET_SIZE};
pub use service::ServiceMsg;
