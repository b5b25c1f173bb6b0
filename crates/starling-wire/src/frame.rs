//! Frame header codec and action fragmentation.
//!
//! Every transport message is one frame: a fixed header followed by a
//! payload slice. An action larger than the packet budget becomes a run
//! of frames sharing the sender's action serial, with ascending fragment
//! indices and the last frame flagged.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use starling_types::{ActKind, NodeId};

use crate::error::{WireError, WireResult};

/// Size of the fixed frame header in bytes.
///
/// Layout (little-endian):
/// `version:u8, frame_kind:u8, act_kind:u8, flags:u8, sender:u64,
/// act_serial:u64, frag_idx:u32`.
pub const FRAME_HEADER_LEN: usize = 24;

/// Smallest packet size that still carries one payload byte per frame.
pub const MIN_PACKET_SIZE: usize = FRAME_HEADER_LEN + 1;

/// Wire protocol version stamped on every frame.
const WIRE_VERSION: u8 = 0;

/// Flag bit: this frame is the last fragment of its action.
const FLAG_LAST: u8 = 0x01;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// One fragment of an application-visible action.
    ActionFrag(ActKind),

    /// A whole service message (never fragmented).
    Service,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            FrameKind::ActionFrag(_) => 0,
            FrameKind::Service => 1,
        }
    }
}

/// Fixed per-frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Backend identity of the submitting endpoint.
    pub sender: NodeId,

    /// Per-sender action serial, monotonic across one endpoint's submits.
    pub act_serial: u64,

    /// Zero-based position of this fragment within its action.
    pub frag_idx: u32,

    /// True on the final fragment; its delivery seals the action.
    pub last: bool,

    /// What the frame carries.
    pub kind: FrameKind,
}

impl FrameHeader {
    /// Encodes the header into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(WIRE_VERSION);
        dst.put_u8(self.kind.as_u8());
        let act_kind = match self.kind {
            FrameKind::ActionFrag(kind) => kind.as_u8(),
            FrameKind::Service => 0,
        };
        dst.put_u8(act_kind);
        dst.put_u8(if self.last { FLAG_LAST } else { 0 });
        dst.put_u64_le(self.sender.as_u64());
        dst.put_u64_le(self.act_serial);
        dst.put_u32_le(self.frag_idx);
    }

    /// Decodes a header from the front of `src`, advancing it.
    pub fn decode(src: &mut Bytes) -> WireResult<Self> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: FRAME_HEADER_LEN,
                got: src.len(),
            });
        }
        let _version = src.get_u8();
        let frame_kind = src.get_u8();
        let act_kind = src.get_u8();
        let flags = src.get_u8();
        let sender = NodeId::new(src.get_u64_le());
        let act_serial = src.get_u64_le();
        let frag_idx = src.get_u32_le();

        let kind = match frame_kind {
            1 => FrameKind::Service,
            _ => FrameKind::ActionFrag(ActKind::from_u8(act_kind)),
        };

        Ok(Self {
            sender,
            act_serial,
            frag_idx,
            last: flags & FLAG_LAST != 0,
            kind,
        })
    }
}

/// Splits an action payload into a run of frames.
///
/// A zero-length payload still produces one (empty, last) frame so the
/// action exists on the wire. Fails if `packet_size` cannot hold the
/// header plus one payload byte.
pub fn fragment(
    sender: NodeId,
    act_serial: u64,
    kind: FrameKind,
    payload: &Bytes,
    packet_size: usize,
) -> WireResult<Vec<Bytes>> {
    if packet_size < MIN_PACKET_SIZE {
        return Err(WireError::PacketSizeTooSmall {
            got: packet_size,
            min: MIN_PACKET_SIZE,
        });
    }

    let budget = packet_size - FRAME_HEADER_LEN;
    let frag_count = payload.len().div_ceil(budget).max(1);
    let mut frames = Vec::with_capacity(frag_count);

    for (idx, offset) in (0..frag_count).map(|i| (i, i * budget)) {
        let end = (offset + budget).min(payload.len());
        let chunk = payload.slice(offset..end);

        let header = FrameHeader {
            sender,
            act_serial,
            frag_idx: idx as u32,
            last: idx == frag_count - 1,
            kind,
        };

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + chunk.len());
        header.encode(&mut frame);
        frame.extend_from_slice(&chunk);
        frames.push(frame.freeze());
    }

    Ok(frames)
}
