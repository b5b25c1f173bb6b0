//! Per-sender reassembly of action fragments.
//!
//! The transport guarantees FIFO per sender, so each sender's fragments
//! for one action arrive in index order. Reassembly keeps a map from
//! `(sender, act_serial)` to a partial buffer; any index that does not
//! land at its expected position is a protocol violation, not loss.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use starling_types::{ActKind, NodeId};

use crate::error::{WireError, WireResult};
use crate::frame::{FrameHeader, FrameKind};

/// A fully reassembled action, ready for ordering and delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedAct {
    /// Backend identity of the submitting endpoint.
    pub sender: NodeId,

    /// The sender's action serial, used to match local repl waiters.
    pub act_serial: u64,

    /// Action kind from the fragment headers.
    pub kind: ActKind,

    /// The reassembled payload.
    pub payload: Bytes,
}

/// A partially reassembled action.
#[derive(Debug)]
struct Partial {
    kind: ActKind,
    next_idx: u32,
    buf: BytesMut,
}

/// Reassembles fragments into sealed actions, per sender.
#[derive(Debug, Default)]
pub struct Defrag {
    partials: HashMap<NodeId, HashMap<u64, Partial>>,
}

impl Defrag {
    /// Creates an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one fragment.
    ///
    /// Returns `Ok(Some(act))` when the fragment seals its action,
    /// `Ok(None)` when more fragments are pending, and an error on any
    /// sequencing violation. After an error the partial is dropped; the
    /// caller surfaces the violation as an `Error` act.
    pub fn feed(&mut self, header: &FrameHeader, body: Bytes) -> WireResult<Option<SealedAct>> {
        let FrameKind::ActionFrag(kind) = header.kind else {
            return Ok(None); // service frames are whole by construction
        };

        let sender_map = self.partials.entry(header.sender).or_default();

        if header.frag_idx == 0 {
            if sender_map.remove(&header.act_serial).is_some() {
                // Restarted serial while a partial existed: the stream is
                // violating FIFO.
                return Err(WireError::FragmentOutOfOrder {
                    sender: header.sender,
                    serial: header.act_serial,
                    expected: 0,
                    got: 0,
                });
            }
            if header.last {
                return Ok(Some(SealedAct {
                    sender: header.sender,
                    act_serial: header.act_serial,
                    kind,
                    payload: body,
                }));
            }
            sender_map.insert(
                header.act_serial,
                Partial {
                    kind,
                    next_idx: 1,
                    buf: BytesMut::from(&body[..]),
                },
            );
            return Ok(None);
        }

        let Some(partial) = sender_map.get_mut(&header.act_serial) else {
            return Err(WireError::OrphanFragment {
                sender: header.sender,
                serial: header.act_serial,
                idx: header.frag_idx,
            });
        };

        if header.frag_idx != partial.next_idx {
            let expected = partial.next_idx;
            sender_map.remove(&header.act_serial);
            return Err(WireError::FragmentOutOfOrder {
                sender: header.sender,
                serial: header.act_serial,
                expected,
                got: header.frag_idx,
            });
        }

        partial.buf.extend_from_slice(&body);
        partial.next_idx += 1;

        if header.last {
            let partial = sender_map
                .remove(&header.act_serial)
                .expect("partial exists, it was just updated");
            return Ok(Some(SealedAct {
                sender: header.sender,
                act_serial: header.act_serial,
                kind: partial.kind,
                payload: partial.buf.freeze(),
            }));
        }

        Ok(None)
    }

    /// Drops partials from senders absent in a new view.
    ///
    /// Returns the `(sender, act_serial)` of every abandoned partial so
    /// the caller can fail any local repl waiter attached to one.
    pub fn forget_absent(&mut self, present: &[NodeId]) -> Vec<(NodeId, u64)> {
        let mut dropped = Vec::new();
        self.partials.retain(|sender, serials| {
            if present.contains(sender) {
                true
            } else {
                dropped.extend(serials.keys().map(|serial| (*sender, *serial)));
                false
            }
        });
        dropped
    }

    /// Number of in-flight partial actions (all senders).
    pub fn pending(&self) -> usize {
        self.partials.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::fragment;
    use crate::frame::FRAME_HEADER_LEN;

    fn feed_all(defrag: &mut Defrag, frames: Vec<Bytes>) -> Option<SealedAct> {
        let mut sealed = None;
        for frame in frames {
            let mut bytes = frame;
            let header = FrameHeader::decode(&mut bytes).expect("decode");
            if let Some(act) = defrag.feed(&header, bytes).expect("feed") {
                sealed = Some(act);
            }
        }
        sealed
    }

    #[test]
    fn reassembles_multi_fragment_action() {
        let payload = Bytes::from((0u8..100).collect::<Vec<_>>());
        let frames = fragment(
            NodeId::new(3),
            11,
            FrameKind::ActionFrag(ActKind::Data),
            &payload,
            FRAME_HEADER_LEN + 16,
        )
        .expect("fragment");

        let mut defrag = Defrag::new();
        let sealed = feed_all(&mut defrag, frames).expect("sealed");

        assert_eq!(sealed.sender, NodeId::new(3));
        assert_eq!(sealed.act_serial, 11);
        assert_eq!(sealed.kind, ActKind::Data);
        assert_eq!(sealed.payload, payload);
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn single_fragment_action_seals_immediately() {
        let payload = Bytes::from_static(b"hi");
        let frames = fragment(
            NodeId::new(1),
            1,
            FrameKind::ActionFrag(ActKind::Data),
            &payload,
            FRAME_HEADER_LEN + 64,
        )
        .expect("fragment");
        assert_eq!(frames.len(), 1);

        let mut defrag = Defrag::new();
        let sealed = feed_all(&mut defrag, frames).expect("sealed");
        assert_eq!(sealed.payload, payload);
    }

    #[test]
    fn interleaved_senders_reassemble_independently() {
        let a = Bytes::from(vec![0xAA; 40]);
        let b = Bytes::from(vec![0xBB; 40]);
        let frames_a = fragment(
            NodeId::new(1),
            1,
            FrameKind::ActionFrag(ActKind::Data),
            &a,
            FRAME_HEADER_LEN + 16,
        )
        .expect("fragment");
        let frames_b = fragment(
            NodeId::new(2),
            1,
            FrameKind::ActionFrag(ActKind::Data),
            &b,
            FRAME_HEADER_LEN + 16,
        )
        .expect("fragment");

        let mut defrag = Defrag::new();
        let mut sealed = Vec::new();
        for frame in frames_a.into_iter().zip(frames_b).flat_map(|(x, y)| [x, y]) {
            let mut bytes = frame;
            let header = FrameHeader::decode(&mut bytes).expect("decode");
            if let Some(act) = defrag.feed(&header, bytes).expect("feed") {
                sealed.push(act);
            }
        }

        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].payload, a);
        assert_eq!(sealed[1].payload, b);
    }

    #[test]
    fn out_of_order_fragment_is_a_violation() {
        let payload = Bytes::from(vec![1u8; 48]);
        let frames = fragment(
            NodeId::new(1),
            1,
            FrameKind::ActionFrag(ActKind::Data),
            &payload,
            FRAME_HEADER_LEN + 16,
        )
        .expect("fragment");
        assert!(frames.len() >= 3);

        let mut defrag = Defrag::new();
        let mut first = frames[0].clone();
        let header = FrameHeader::decode(&mut first).expect("decode");
        defrag.feed(&header, first).expect("feed");

        // Skip fragment 1, deliver fragment 2.
        let mut third = frames[2].clone();
        let header = FrameHeader::decode(&mut third).expect("decode");
        assert!(matches!(
            defrag.feed(&header, third),
            Err(WireError::FragmentOutOfOrder {
                expected: 1,
                got: 2,
                ..
            })
        ));
        // The violated partial is gone.
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn continuation_without_start_is_orphan() {
        let payload = Bytes::from(vec![1u8; 48]);
        let frames = fragment(
            NodeId::new(1),
            7,
            FrameKind::ActionFrag(ActKind::Data),
            &payload,
            FRAME_HEADER_LEN + 16,
        )
        .expect("fragment");

        let mut defrag = Defrag::new();
        let mut second = frames[1].clone();
        let header = FrameHeader::decode(&mut second).expect("decode");
        assert!(matches!(
            defrag.feed(&header, second),
            Err(WireError::OrphanFragment { serial: 7, .. })
        ));
    }

    #[test]
    fn forget_absent_drops_partials_and_reports_serials() {
        let payload = Bytes::from(vec![1u8; 48]);
        let frames = fragment(
            NodeId::new(9),
            21,
            FrameKind::ActionFrag(ActKind::Data),
            &payload,
            FRAME_HEADER_LEN + 16,
        )
        .expect("fragment");

        let mut defrag = Defrag::new();
        let mut first = frames[0].clone();
        let header = FrameHeader::decode(&mut first).expect("decode");
        defrag.feed(&header, first).expect("feed");
        assert_eq!(defrag.pending(), 1);

        let dropped = defrag.forget_absent(&[NodeId::new(1)]);
        assert_eq!(dropped, vec![(NodeId::new(9), 21)]);
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn forget_absent_keeps_present_senders() {
        let payload = Bytes::from(vec![1u8; 48]);
        let frames = fragment(
            NodeId::new(9),
            21,
            FrameKind::ActionFrag(ActKind::Data),
            &payload,
            FRAME_HEADER_LEN + 16,
        )
        .expect("fragment");

        let mut defrag = Defrag::new();
        let mut first = frames[0].clone();
        let header = FrameHeader::decode(&mut first).expect("decode");
        defrag.feed(&header, first).expect("feed");

        let dropped = defrag.forget_absent(&[NodeId::new(9)]);
        assert!(dropped.is_empty());
        assert_eq!(defrag.pending(), 1);
    }
}
