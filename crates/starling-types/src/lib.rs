//! # starling-types: Core types for `Starling`
//!
//! This crate contains shared types used across the `Starling` group
//! communication service:
//! - Ordering ([`Seqno`], [`ConfId`])
//! - Identity ([`NodeId`], [`GroupUuid`], [`MemberId`])
//! - Actions ([`ActKind`], [`Act`])
//! - Connection lifecycle ([`ConnState`])
//!
//! Sentinel values from the wire protocol (`ILL = -1`, non-primary
//! `conf_id = -1`) never appear inside the library: "no ordering assigned"
//! is `Option::None` everywhere except the encode/decode boundary, where
//! [`Seqno::encode_opt`] and [`ConfId::encode_opt`] map it back.

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Sequence Numbers
// ============================================================================

/// Sentinel written on the wire for "no ordering assigned".
pub const SEQNO_ILL: i64 = -1;

/// A global or local sequence number.
///
/// Global seqnos are group-wide, gapless and monotonic within a primary
/// configuration. Local seqnos are per-connection, gapless and monotonic
/// across every delivered action. [`Seqno::NIL`] marks an empty history;
/// the first assignable seqno is [`Seqno::FIRST`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Seqno(i64);

impl Seqno {
    /// Empty history: no action has ever been ordered.
    pub const NIL: Seqno = Seqno(0);

    /// The first seqno ever assigned in a group's history.
    pub const FIRST: Seqno = Seqno(1);

    /// Creates a seqno from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is negative; negative values are wire sentinels
    /// and must go through [`Seqno::decode_opt`].
    pub fn new(value: i64) -> Self {
        assert!(value >= 0, "seqno must be non-negative, got {value}");
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the next seqno.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true if this seqno marks an empty history.
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Maps an optional seqno to its wire representation (`None` → `ILL`).
    pub fn encode_opt(seqno: Option<Seqno>) -> i64 {
        seqno.map_or(SEQNO_ILL, Seqno::as_i64)
    }

    /// Maps a wire value back to an optional seqno (negative → `None`).
    pub fn decode_opt(value: i64) -> Option<Seqno> {
        (value >= 0).then_some(Seqno(value))
    }
}

impl Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Seqno> for i64 {
    fn from(seqno: Seqno) -> Self {
        seqno.0
    }
}

// ============================================================================
// Configuration Id
// ============================================================================

/// Identifier of a primary configuration.
///
/// Monotonically increasing across the primary configurations a group goes
/// through. Non-primary configurations have no id; the wire encodes that
/// as `-1` via [`ConfId::encode_opt`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ConfId(i64);

impl ConfId {
    /// Creates a configuration id from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is negative.
    pub fn new(value: i64) -> Self {
        assert!(value >= 0, "conf id must be non-negative, got {value}");
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the next configuration id.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Maps an optional conf id to its wire representation (`None` → `-1`).
    pub fn encode_opt(conf_id: Option<ConfId>) -> i64 {
        conf_id.map_or(-1, ConfId::as_i64)
    }

    /// Maps a wire value back to an optional conf id (negative → `None`).
    pub fn decode_opt(value: i64) -> Option<ConfId> {
        (value >= 0).then_some(ConfId(value))
    }
}

impl Display for ConfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Transport-assigned endpoint identity.
///
/// Stable for the lifetime of one `open`; assigned by the backend, not by
/// the application. Used to key per-sender reassembly and to match a
/// replicated action back to its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// 16-byte opaque group identity.
///
/// Two runs with the same uuid share a single history; a node whose
/// recorded uuid does not match the group's needs a state transfer before
/// it can serve reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupUuid(uuid::Uuid);

impl GroupUuid {
    /// The undefined identity: a node that has never joined any group.
    pub const UNDEFINED: GroupUuid = GroupUuid(uuid::Uuid::nil());

    /// Generates a fresh group identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a group uuid from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns true if this is the undefined identity.
    pub fn is_undefined(&self) -> bool {
        self.0.is_nil()
    }
}

impl Display for GroupUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-readable member identity carried in configuration actions.
///
/// Bounded on the wire to 40 bytes including the NUL terminator; the wire
/// layer rejects longer ids at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Maximum encoded length in bytes, including the NUL terminator.
    pub const MAX_WIRE_LEN: usize = 40;

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MemberId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Kind of an application-visible action.
///
/// `Data` and `StateReq` originate from the application; the rest are
/// synthesized by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActKind {
    /// Application payload replicated in total order.
    Data,

    /// Group-wide commit cut: every member has applied up to the carried
    /// seqno.
    CommitCut,

    /// State transfer request; delivered to the selected donor.
    StateReq,

    /// Configuration change (membership, primary/non-primary).
    Conf,

    /// State transfer completion from the donor.
    Join,

    /// A member reached synchronized state.
    Sync,

    /// Flow control transition (stop or continue).
    Flow,

    /// Internal service traffic; never surfaced to the application.
    Service,

    /// Delivery failure report.
    Error,

    /// Unrecognized kind from a newer peer.
    Unknown,
}

impl ActKind {
    /// Returns true for kinds that consume a global seqno when delivered.
    pub fn requires_ordering(self) -> bool {
        matches!(self, ActKind::Data)
    }

    /// Returns true for kinds an application may submit.
    pub fn is_application(self) -> bool {
        matches!(self, ActKind::Data | ActKind::StateReq)
    }

    /// Wire discriminant.
    pub fn as_u8(self) -> u8 {
        match self {
            ActKind::Data => 0,
            ActKind::CommitCut => 1,
            ActKind::StateReq => 2,
            ActKind::Conf => 3,
            ActKind::Join => 4,
            ActKind::Sync => 5,
            ActKind::Flow => 6,
            ActKind::Service => 7,
            ActKind::Error => 8,
            ActKind::Unknown => 9,
        }
    }

    /// Decodes a wire discriminant; unrecognized values map to `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ActKind::Data,
            1 => ActKind::CommitCut,
            2 => ActKind::StateReq,
            3 => ActKind::Conf,
            4 => ActKind::Join,
            5 => ActKind::Sync,
            6 => ActKind::Flow,
            7 => ActKind::Service,
            8 => ActKind::Error,
            _ => ActKind::Unknown,
        }
    }
}

impl Display for ActKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActKind::Data => "DATA",
            ActKind::CommitCut => "COMMIT_CUT",
            ActKind::StateReq => "STATE_REQ",
            ActKind::Conf => "CONF",
            ActKind::Join => "JOIN",
            ActKind::Sync => "SYNC",
            ActKind::Flow => "FLOW",
            ActKind::Service => "SERVICE",
            ActKind::Error => "ERROR",
            ActKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// An application-visible, possibly large, ordered unit of replication.
///
/// Every act surfaced through `recv` carries a local seqno; ordered kinds
/// additionally carry the global seqno assigned by the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Act {
    /// What this act is.
    pub kind: ActKind,

    /// Opaque payload. Empty for kinds that carry none.
    pub payload: Bytes,

    /// Group-wide seqno, present iff the act was totally ordered.
    pub global_seqno: Option<Seqno>,

    /// Per-connection delivery counter, gapless from 1.
    pub local_seqno: Seqno,
}

impl Act {
    /// Creates an ordered act.
    pub fn ordered(kind: ActKind, payload: Bytes, global_seqno: Seqno, local_seqno: Seqno) -> Self {
        Self {
            kind,
            payload,
            global_seqno: Some(global_seqno),
            local_seqno,
        }
    }

    /// Creates an unordered act (control traffic, errors).
    pub fn unordered(kind: ActKind, payload: Bytes, local_seqno: Seqno) -> Self {
        Self {
            kind,
            payload,
            global_seqno: None,
            local_seqno,
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

/// State of a connection to a group channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnState {
    /// Created or closed; may be (re)initialized and opened.
    Closed,

    /// Torn down; terminal.
    Destroyed,

    /// Open, but the current view has no quorum.
    OpenNonPrimary,

    /// Open inside a primary configuration.
    OpenPrimary,

    /// Waiting for a donor to complete a state transfer to us.
    Joiner,

    /// Serving a state transfer to a joiner.
    Donor,

    /// State transfer received; not yet synchronized with the group.
    Joined,

    /// Fully synchronized; normal service.
    Synced,
}

impl ConnState {
    /// Returns true if the connection is attached to a channel.
    pub fn is_open(self) -> bool {
        !matches!(self, ConnState::Closed | ConnState::Destroyed)
    }

    /// Returns true inside a primary configuration (any handshake phase).
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            ConnState::OpenPrimary
                | ConnState::Joiner
                | ConnState::Donor
                | ConnState::Joined
                | ConnState::Synced
        )
    }

    /// Returns true if (re)initialization with a position hint is legal.
    pub fn can_init(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Destroyed)
    }
}

impl Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Closed => "CLOSED",
            ConnState::Destroyed => "DESTROYED",
            ConnState::OpenNonPrimary => "OPEN_NON_PRIMARY",
            ConnState::OpenPrimary => "OPEN_PRIMARY",
            ConnState::Joiner => "JOINER",
            ConnState::Donor => "DONOR",
            ConnState::Joined => "JOINED",
            ConnState::Synced => "SYNCED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_sentinel_round_trip() {
        assert_eq!(Seqno::encode_opt(None), SEQNO_ILL);
        assert_eq!(Seqno::encode_opt(Some(Seqno::FIRST)), 1);
        assert_eq!(Seqno::decode_opt(-1), None);
        assert_eq!(Seqno::decode_opt(0), Some(Seqno::NIL));
        assert_eq!(Seqno::decode_opt(7), Some(Seqno::new(7)));
    }

    #[test]
    fn seqno_next_is_monotonic() {
        assert_eq!(Seqno::NIL.next(), Seqno::FIRST);
        assert_eq!(Seqno::new(41).next(), Seqno::new(42));
    }

    #[test]
    #[should_panic(expected = "seqno must be non-negative")]
    fn seqno_rejects_negative() {
        let _ = Seqno::new(-1);
    }

    #[test]
    fn conf_id_sentinel_round_trip() {
        assert_eq!(ConfId::encode_opt(None), -1);
        assert_eq!(ConfId::decode_opt(-1), None);
        assert_eq!(ConfId::decode_opt(3), Some(ConfId::new(3)));
    }

    #[test]
    fn group_uuid_undefined_is_nil() {
        assert!(GroupUuid::UNDEFINED.is_undefined());
        assert!(!GroupUuid::generate().is_undefined());
    }

    #[test]
    fn act_kind_discriminants_round_trip() {
        for kind in [
            ActKind::Data,
            ActKind::CommitCut,
            ActKind::StateReq,
            ActKind::Conf,
            ActKind::Join,
            ActKind::Sync,
            ActKind::Flow,
            ActKind::Service,
            ActKind::Error,
            ActKind::Unknown,
        ] {
            assert_eq!(ActKind::from_u8(kind.as_u8()), kind);
        }
        // Future discriminants degrade to Unknown rather than failing.
        assert_eq!(ActKind::from_u8(200), ActKind::Unknown);
    }

    #[test]
    fn only_data_requires_ordering() {
        assert!(ActKind::Data.requires_ordering());
        assert!(!ActKind::Conf.requires_ordering());
        assert!(!ActKind::StateReq.requires_ordering());
    }

    #[test]
    fn conn_state_predicates() {
        assert!(ConnState::Closed.can_init());
        assert!(!ConnState::OpenPrimary.can_init());
        assert!(ConnState::Joiner.is_primary());
        assert!(!ConnState::OpenNonPrimary.is_primary());
        assert!(ConnState::OpenNonPrimary.is_open());
        assert!(!ConnState::Destroyed.is_open());
    }
}
