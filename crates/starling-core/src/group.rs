//! Group/configuration state machine.
//!
//! Processes view-change notifications and delivered service messages to
//! drive the connection through its NON_PRIMARY / PRIMARY configurations,
//! the state-transfer handshake, group-wide flow control and commit-cut
//! tracking. All transitions happen under the connection's state lock and
//! produce a [`GroupOutput`] the dispatch loop executes: acts to surface,
//! service messages to broadcast.
//!
//! # Determinism
//!
//! Everything the machine decides group-wide — the configuration
//! contents, the donor for a state transfer, the commit cut — is computed
//! from totally-ordered inputs, so every member reaches the same decision
//! at the same point in the history without further coordination.
//!
//! # State exchange
//!
//! A primary view does not immediately produce a configuration act. Every
//! member first broadcasts its position (`uuid`, seqno); once all
//! announcements for the view arrived, each member independently elects
//! the group identity (the best recorded position, or the lowest node's
//! candidate when the whole group bootstraps), computes the group seqno,
//! and decides for itself whether a state transfer is required.

use bytes::{BufMut, Bytes, BytesMut};
use starling_types::{ActKind, ConfId, ConnState, GroupUuid, MemberId, NodeId, Seqno};
use starling_wire::{ConfRecord, ServiceMsg};

// ============================================================================
// Inputs and Outputs
// ============================================================================

/// A membership view reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewInfo {
    /// Monotonic view counter, agreed by the transport.
    pub view_id: u64,

    /// True when the view has quorum.
    pub primary: bool,

    /// Member endpoints, with their advertised names.
    pub members: Vec<(NodeId, MemberId)>,
}

/// An act to surface locally; the dispatch loop assigns the local seqno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAct {
    pub kind: ActKind,
    pub payload: Bytes,
}

/// What the machine wants done after processing one event.
#[derive(Debug, Default)]
pub struct GroupOutput {
    /// Acts to enqueue on the local receive queue, in order.
    pub acts: Vec<LocalAct>,

    /// Service messages to broadcast to the group.
    pub broadcasts: Vec<ServiceMsg>,

    /// True when in-flight replications must be discarded (view loss).
    pub view_lost: bool,
}

impl GroupOutput {
    fn empty() -> Self {
        Self::default()
    }
}

/// Group-wide decision for one delivered state transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReqOutcome {
    /// Who asked.
    pub requester: NodeId,

    /// Selected donor's index in the member list, if any was eligible.
    pub donor_idx: Option<usize>,

    /// True when this node is the selected donor and must surface the
    /// request to its application.
    pub deliver_here: bool,
}

// ============================================================================
// Member Tracking
// ============================================================================

/// Position a member announced during the state exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Exchange {
    uuid: GroupUuid,
    seqno: Seqno,
    bootstrap: bool,
}

/// Per-member bookkeeping.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    /// Transport identity.
    pub node: NodeId,

    /// Advertised name, carried into configuration records.
    pub member_id: MemberId,

    /// True once the member can serve as a state transfer donor.
    pub synced: bool,

    /// The member's last applied seqno, from commit-cut hints.
    pub last_applied: Seqno,

    /// True while the member's flow stop is outstanding.
    pub flow_stopped: bool,

    /// Announcement for the current state exchange round.
    exchange: Option<Exchange>,
}

// ============================================================================
// Group State
// ============================================================================

/// The state machine for one connection's group membership.
#[derive(Debug)]
pub struct GroupState {
    /// Our transport identity.
    node: NodeId,

    /// Our advertised name.
    name: MemberId,

    /// Connection lifecycle state.
    state: ConnState,

    /// Group identity we belong to (or claim from the init hint).
    uuid: GroupUuid,

    /// Position claimed while we do not hold the group state (init hint;
    /// updated on a completed state transfer).
    position: Seqno,

    /// True once our history matches the group's.
    have_state: bool,

    /// Candidate identity offered while bootstrapping, generated once.
    candidate: Option<GroupUuid>,

    /// Global seqno counter: the last seqno assigned to an ordered act.
    seqno: Seqno,

    /// Current primary configuration id.
    conf_id: Option<ConfId>,

    /// Current transport view.
    view_id: u64,

    /// Members of the current view, in group order (ascending node id).
    members: Vec<MemberInfo>,

    /// True while a state exchange round is collecting announcements.
    exchanging: bool,

    /// True while our own state transfer request is in flight.
    pending_state_req: bool,

    /// Active state transfers as (joiner, donor) pairs.
    transfers: Vec<(NodeId, NodeId)>,

    /// Last commit cut surfaced to the application.
    commit_cut: Seqno,
}

impl GroupState {
    /// Creates the machine for a freshly opened connection.
    ///
    /// `uuid` and `position` come from the optional init hint; a node
    /// without one starts undefined at [`Seqno::NIL`].
    pub fn new(node: NodeId, name: MemberId, uuid: GroupUuid, position: Seqno) -> Self {
        Self {
            node,
            name,
            state: ConnState::OpenNonPrimary,
            uuid,
            position,
            have_state: false,
            candidate: None,
            seqno: position,
            conf_id: None,
            view_id: 0,
            members: Vec::new(),
            exchanging: false,
            pending_state_req: false,
            transfers: Vec::new(),
            commit_cut: Seqno::NIL,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Connection lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Group identity.
    pub fn uuid(&self) -> GroupUuid {
        self.uuid
    }

    /// Current configuration id, if primary.
    pub fn conf_id(&self) -> Option<ConfId> {
        self.conf_id
    }

    /// Last assigned global seqno.
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    /// Members of the current view.
    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    /// Our index in the member list.
    pub fn my_index(&self) -> Option<usize> {
        self.members.iter().position(|m| m.node == self.node)
    }

    /// Number of members whose flow stop is outstanding.
    pub fn stop_count(&self) -> usize {
        self.members.iter().filter(|m| m.flow_stopped).count()
    }

    /// Assigns the next global seqno to an ordered act.
    pub fn next_global(&mut self) -> Seqno {
        self.seqno = self.seqno.next();
        self.seqno
    }

    /// Marks our state transfer request as submitted.
    ///
    /// Enforces the one-in-flight rule; the flag clears when the
    /// handshake completes or the view is lost.
    pub fn begin_state_req(&mut self) -> Result<(), ConnState> {
        if self.state != ConnState::Joiner {
            return Err(self.state);
        }
        if self.pending_state_req {
            // One request in flight per connection.
            return Err(self.state);
        }
        self.pending_state_req = true;
        Ok(())
    }

    /// True while our own state transfer request is in flight.
    pub fn state_req_pending(&self) -> bool {
        self.pending_state_req
    }

    /// Rolls back a state transfer request that never reached the wire.
    pub fn abort_state_req(&mut self) {
        self.pending_state_req = false;
    }

    /// Marks the connection closed.
    pub fn mark_closed(&mut self) {
        self.state = ConnState::Closed;
    }

    // ========================================================================
    // View Changes
    // ========================================================================

    /// Processes a view change from the transport.
    pub fn handle_view(&mut self, view: &ViewInfo) -> GroupOutput {
        let mut out = GroupOutput::empty();

        tracing::info!(
            node = %self.node,
            view_id = view.view_id,
            primary = view.primary,
            members = view.members.len(),
            "view change"
        );

        // Carry survivors' bookkeeping into the new member list.
        let mut members: Vec<MemberInfo> = view
            .members
            .iter()
            .map(|(node, member_id)| {
                let old = self.members.iter().find(|m| m.node == *node);
                MemberInfo {
                    node: *node,
                    member_id: member_id.clone(),
                    synced: old.is_some_and(|m| m.synced),
                    last_applied: old.map_or(Seqno::NIL, |m| m.last_applied),
                    flow_stopped: old.is_some_and(|m| m.flow_stopped),
                    exchange: None,
                }
            })
            .collect();
        members.sort_by_key(|m| m.node);

        self.view_id = view.view_id;
        self.members = members;

        // Handshakes die with either endpoint.
        self.transfers.retain(|(joiner, donor)| {
            let alive = self.members.iter().any(|m| m.node == *joiner)
                && self.members.iter().any(|m| m.node == *donor);
            if !alive {
                tracing::debug!(joiner = %joiner, donor = %donor, "state transfer abandoned");
            }
            alive
        });

        if view.primary {
            // Start the state exchange round; the configuration act is
            // emitted once every member announced its position.
            self.exchanging = true;
            let (uuid, seqno, bootstrap) = self.exchange_claim();
            out.broadcasts.push(ServiceMsg::StateExchange {
                view_id: view.view_id,
                uuid,
                seqno,
                bootstrap,
            });
        } else {
            // Quorum lost: synthesize the non-primary configuration right
            // away and fail whatever depended on the old view.
            self.exchanging = false;
            self.conf_id = None;
            self.pending_state_req = false;
            self.transfers.clear();
            for member in &mut self.members {
                member.flow_stopped = false;
            }
            self.state = ConnState::OpenNonPrimary;
            out.view_lost = true;
            if let Some(act) = self.conf_act(false) {
                out.acts.push(act);
            }
        }

        out
    }

    /// Position we announce in a state exchange.
    fn exchange_claim(&mut self) -> (GroupUuid, Seqno, bool) {
        if self.have_state {
            (self.uuid, self.seqno, false)
        } else if !self.uuid.is_undefined() {
            (self.uuid, self.position, false)
        } else {
            let candidate = *self.candidate.get_or_insert_with(GroupUuid::generate);
            (candidate, Seqno::NIL, true)
        }
    }

    // ========================================================================
    // Service Messages
    // ========================================================================

    /// Processes a delivered service message.
    pub fn handle_service(&mut self, sender: NodeId, msg: &ServiceMsg) -> GroupOutput {
        match msg {
            ServiceMsg::StateExchange {
                view_id,
                uuid,
                seqno,
                bootstrap,
            } => self.on_state_exchange(sender, *view_id, *uuid, *seqno, *bootstrap),
            ServiceMsg::Join { status } => self.on_join(sender, *status),
            ServiceMsg::Sync => self.on_sync(sender),
            ServiceMsg::Flow { stop } => self.on_flow(sender, *stop),
            ServiceMsg::LastApplied { seqno } => self.on_last_applied(sender, *seqno),
        }
    }

    fn on_state_exchange(
        &mut self,
        sender: NodeId,
        view_id: u64,
        uuid: GroupUuid,
        seqno: Seqno,
        bootstrap: bool,
    ) -> GroupOutput {
        if !self.exchanging || view_id != self.view_id {
            tracing::debug!(sender = %sender, view_id, "stale state exchange ignored");
            return GroupOutput::empty();
        }
        let Some(member) = self.members.iter_mut().find(|m| m.node == sender) else {
            tracing::debug!(sender = %sender, "state exchange from non-member ignored");
            return GroupOutput::empty();
        };
        member.exchange = Some(Exchange {
            uuid,
            seqno,
            bootstrap,
        });

        if self.members.iter().all(|m| m.exchange.is_some()) {
            self.emit_conf()
        } else {
            GroupOutput::empty()
        }
    }

    /// Elects the group identity and emits the primary configuration.
    fn emit_conf(&mut self) -> GroupOutput {
        let mut out = GroupOutput::empty();
        self.exchanging = false;

        // Identity election: the best recorded position wins (highest
        // seqno, lowest node id on ties). A group where everyone
        // bootstraps adopts the lowest node's candidate.
        let best_recorded = self
            .members
            .iter()
            .filter(|m| m.exchange.is_some_and(|e| !e.bootstrap))
            .max_by(|a, b| {
                let ea = a.exchange.expect("filtered on exchange");
                let eb = b.exchange.expect("filtered on exchange");
                ea.seqno.cmp(&eb.seqno).then(b.node.cmp(&a.node))
            });

        let chosen_uuid = match best_recorded {
            Some(member) => member.exchange.expect("filtered on exchange").uuid,
            None => {
                let first = self
                    .members
                    .first()
                    .expect("exchange completed with members present");
                first.exchange.expect("exchange completed").uuid
            }
        };

        let group_seqno = self
            .members
            .iter()
            .filter_map(|m| m.exchange)
            .filter(|e| !e.bootstrap && e.uuid == chosen_uuid)
            .map(|e| e.seqno)
            .max()
            .unwrap_or(Seqno::NIL);

        // A member holds the state iff its announcement matches the full
        // group position; those members are donor-eligible.
        for member in &mut self.members {
            let exchange = member.exchange.expect("exchange completed");
            member.synced =
                !exchange.bootstrap && exchange.uuid == chosen_uuid && exchange.seqno == group_seqno;
        }

        let my_exchange = self
            .members
            .iter()
            .find(|m| m.node == self.node)
            .and_then(|m| m.exchange)
            .expect("we are a member of our own view");
        let st_required = my_exchange.bootstrap
            || my_exchange.uuid != chosen_uuid
            || my_exchange.seqno < group_seqno;

        self.uuid = chosen_uuid;
        self.seqno = group_seqno;
        self.conf_id = Some(ConfId::new(self.view_id as i64));

        if st_required {
            self.have_state = false;
            self.state = ConnState::Joiner;
        } else {
            self.have_state = true;
            self.position = group_seqno;
            let donating = self.transfers.iter().any(|(_, d)| *d == self.node);
            let joining = self.transfers.iter().any(|(j, _)| *j == self.node);
            self.state = if donating {
                ConnState::Donor
            } else if joining {
                self.state
            } else {
                ConnState::Synced
            };
        }

        tracing::info!(
            node = %self.node,
            conf_id = %self.conf_id.expect("just set"),
            uuid = %self.uuid,
            seqno = %self.seqno,
            st_required,
            members = self.members.len(),
            "primary configuration"
        );

        if let Some(act) = self.conf_act(st_required) {
            out.acts.push(act);
        }
        out
    }

    fn on_join(&mut self, sender: NodeId, status: i64) -> GroupOutput {
        let mut out = GroupOutput::empty();

        let Some(pos) = self.transfers.iter().position(|(_, donor)| *donor == sender) else {
            tracing::debug!(sender = %sender, "join from a non-donor ignored");
            return out;
        };
        let (joiner, donor) = self.transfers.remove(pos);

        tracing::info!(
            node = %self.node,
            joiner = %joiner,
            donor = %donor,
            status,
            "state transfer completed"
        );

        if joiner == self.node {
            self.pending_state_req = false;
            if status >= 0 {
                self.state = ConnState::Joined;
                self.have_state = true;
                self.position = self.seqno;
                // Announce catch-up; its delivery marks us synced.
                out.broadcasts.push(ServiceMsg::Sync);
            }
            let mut payload = BytesMut::with_capacity(8);
            payload.put_i64_le(status);
            out.acts.push(LocalAct {
                kind: ActKind::Join,
                payload: payload.freeze(),
            });
        }

        if donor == self.node {
            self.state = ConnState::Synced;
        }

        out
    }

    fn on_sync(&mut self, sender: NodeId) -> GroupOutput {
        let mut out = GroupOutput::empty();
        if let Some(member) = self.members.iter_mut().find(|m| m.node == sender) {
            member.synced = true;
        }
        if sender == self.node && self.state == ConnState::Joined {
            self.state = ConnState::Synced;
            out.acts.push(LocalAct {
                kind: ActKind::Sync,
                payload: Bytes::new(),
            });
        }
        out
    }

    fn on_flow(&mut self, sender: NodeId, stop: bool) -> GroupOutput {
        let mut out = GroupOutput::empty();
        let Some(member) = self.members.iter_mut().find(|m| m.node == sender) else {
            return out;
        };
        if member.flow_stopped == stop {
            return out; // duplicate transition
        }
        member.flow_stopped = stop;
        tracing::debug!(
            node = %self.node,
            sender = %sender,
            stop,
            outstanding = self.stop_count(),
            "flow transition"
        );
        out.acts.push(LocalAct {
            kind: ActKind::Flow,
            payload: Bytes::from(vec![u8::from(stop)]),
        });
        out
    }

    fn on_last_applied(&mut self, sender: NodeId, seqno: Seqno) -> GroupOutput {
        let mut out = GroupOutput::empty();
        if let Some(member) = self.members.iter_mut().find(|m| m.node == sender) {
            member.last_applied = seqno;
        }

        let cut = self
            .members
            .iter()
            .map(|m| m.last_applied)
            .min()
            .unwrap_or(Seqno::NIL);
        if cut > self.commit_cut {
            self.commit_cut = cut;
            let mut payload = BytesMut::with_capacity(8);
            payload.put_i64_le(cut.as_i64());
            out.acts.push(LocalAct {
                kind: ActKind::CommitCut,
                payload: payload.freeze(),
            });
        }
        out
    }

    // ========================================================================
    // State Transfer Requests
    // ========================================================================

    /// Decides the donor for a delivered state transfer request.
    ///
    /// The request is totally ordered, so every member runs this at the
    /// same point and agrees on the outcome. The first synced member that
    /// is neither the requester nor already part of a handshake donates.
    pub fn handle_state_req(&mut self, requester: NodeId) -> StateReqOutcome {
        let donor = self
            .members
            .iter()
            .enumerate()
            .find(|(_, m)| {
                m.synced
                    && m.node != requester
                    && !self
                        .transfers
                        .iter()
                        .any(|(j, d)| *j == m.node || *d == m.node)
            })
            .map(|(idx, m)| (idx, m.node));

        match donor {
            Some((idx, node)) => {
                self.transfers.push((requester, node));
                if node == self.node {
                    self.state = ConnState::Donor;
                }
                tracing::info!(
                    node = %self.node,
                    requester = %requester,
                    donor = %node,
                    "state transfer donor selected"
                );
                StateReqOutcome {
                    requester,
                    donor_idx: Some(idx),
                    deliver_here: node == self.node,
                }
            }
            None => {
                if requester == self.node {
                    self.pending_state_req = false;
                }
                tracing::warn!(
                    node = %self.node,
                    requester = %requester,
                    "no eligible state transfer donor"
                );
                StateReqOutcome {
                    requester,
                    donor_idx: None,
                    deliver_here: false,
                }
            }
        }
    }

    // ========================================================================
    // Configuration Records
    // ========================================================================

    /// Builds the CONF act for the current membership.
    fn conf_act(&self, st_required: bool) -> Option<LocalAct> {
        let record = ConfRecord {
            seqno: self.seqno,
            conf_id: self.conf_id,
            group_uuid: self.uuid,
            st_required,
            my_idx: self.my_index(),
            members: self.members.iter().map(|m| m.member_id.clone()).collect(),
        };
        match record.encode() {
            Ok(payload) => Some(LocalAct {
                kind: ActKind::Conf,
                payload,
            }),
            Err(error) => {
                // Member names are validated at open, so this is a peer
                // advertising an over-long name.
                tracing::error!(%error, "dropping unencodable configuration record");
                None
            }
        }
    }
}
