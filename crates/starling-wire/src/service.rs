//! Group service messages.
//!
//! Service traffic rides the same totally-ordered transport as actions,
//! which is what makes the group state machine deterministic: every
//! member processes the same service messages at the same point in the
//! history. Encoding is postcard's canonical form.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use starling_types::{GroupUuid, Seqno};

use crate::error::WireResult;

/// A message between group members, never surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMsg {
    /// Position announcement after a view change.
    ///
    /// Every member broadcasts one per new primary view; the group emits
    /// the CONF act only once all members' announcements arrived.
    StateExchange {
        /// The view this announcement belongs to.
        view_id: u64,
        /// The sender's group identity. A bootstrapping sender has no
        /// recorded identity and offers a freshly generated candidate.
        uuid: GroupUuid,
        /// The sender's position in the group history.
        seqno: Seqno,
        /// True if `uuid` is a candidate rather than a recorded identity.
        ///
        /// Identity election must be deterministic across members: when
        /// every member bootstraps at once, the group adopts the candidate
        /// of the lowest node id.
        bootstrap: bool,
    },

    /// Donor-side completion of a state transfer.
    ///
    /// `status ≥ 0` carries the seqno the joiner has reached; `status < 0`
    /// reports a failed transfer.
    Join { status: i64 },

    /// The sender caught up and is ready for normal service.
    Sync,

    /// Flow control transition: `stop = true` pauses cooperative senders,
    /// `stop = false` resumes them.
    Flow { stop: bool },

    /// Commit-cut hint: the sender has applied every action up to `seqno`.
    LastApplied { seqno: Seqno },
}

impl ServiceMsg {
    /// Encodes into postcard's canonical form.
    pub fn encode(&self) -> Bytes {
        let encoded = postcard::to_allocvec(self)
            .expect("service message serialization should never fail (all fields are serializable)");
        Bytes::from(encoded)
    }

    /// Decodes from postcard's canonical form.
    pub fn decode(payload: &[u8]) -> WireResult<Self> {
        Ok(postcard::from_bytes(payload)?)
    }

    /// Short name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceMsg::StateExchange { .. } => "state_exchange",
            ServiceMsg::Join { .. } => "join",
            ServiceMsg::Sync => "sync",
            ServiceMsg::Flow { .. } => "flow",
            ServiceMsg::LastApplied { .. } => "last_applied",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_variant() {
        let msgs = [
            ServiceMsg::StateExchange {
                view_id: 3,
                uuid: GroupUuid::generate(),
                seqno: Seqno::new(17),
                bootstrap: false,
            },
            ServiceMsg::Join { status: 10 },
            ServiceMsg::Join { status: -5 },
            ServiceMsg::Sync,
            ServiceMsg::Flow { stop: true },
            ServiceMsg::Flow { stop: false },
            ServiceMsg::LastApplied {
                seqno: Seqno::new(8),
            },
        ];
        for msg in msgs {
            let decoded = ServiceMsg::decode(&msg.encode()).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ServiceMsg::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
