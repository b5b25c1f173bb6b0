//! The connection facade.
//!
//! A [`Connection`] owns one endpoint of a group channel: the backend,
//! the reassembler, the receive queue, the pending-replication table,
//! the group state machine and the flow control latch. A dedicated
//! dispatch thread drives the backend and translates its events into
//! sealed acts, configuration emissions and replication completions;
//! application threads call the public operations from anywhere.
//!
//! Group state transitions are rare and must be totally ordered with
//! delivered actions, so they serialize on a single mutex; the receive
//! queue and the replication slots carry their own locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::{BufMut, Bytes, BytesMut};

use starling_types::{Act, ActKind, ConnState, GroupUuid, MemberId, NodeId, Seqno};
use starling_wire::{fragment, Defrag, FrameHeader, FrameKind, SealedAct, ServiceMsg};

use crate::backend::{self, Backend, BackendEvent, BackendUrl};
use crate::config::GcsConfig;
use crate::error::{CoreError, CoreResult};
use crate::flow::{FlowControl, FlowDecision};
use crate::group::{GroupOutput, GroupState, ViewInfo};
use crate::recv_queue::RecvQueue;
use crate::repl::{Delivery, DiscardReason, ReplTable};

// ============================================================================
// Public Result Types
// ============================================================================

/// Seqnos assigned to a successfully replicated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicated {
    /// Group-wide seqno; present for totally ordered kinds.
    pub global_seqno: Option<Seqno>,

    /// Local delivery seqno.
    pub local_seqno: Seqno,
}

/// Outcome of a completed state transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransfer {
    /// Index of the selected donor in the member list.
    pub donor_idx: usize,

    /// The local seqno the handshake consumed; skip it in the local
    /// order.
    pub local_seqno: Seqno,
}

// ============================================================================
// Connection
// ============================================================================

struct Inner {
    /// Lifecycle phase while no group exists (pre-open, closed).
    phase: ConnState,

    /// Position hint from `init`.
    init_uuid: GroupUuid,
    init_seqno: Seqno,

    /// Group machinery; present while open.
    group: Option<GroupState>,
    backend: Option<Arc<dyn Backend>>,
}

impl Inner {
    fn state(&self) -> ConnState {
        self.group.as_ref().map_or(self.phase, GroupState::state)
    }
}

struct Shared {
    config: GcsConfig,
    inner: Mutex<Inner>,
    queue: Mutex<Arc<RecvQueue>>,
    repl: ReplTable,
    flow: Mutex<FlowControl>,
    next_serial: AtomicU64,
}

impl Shared {
    fn queue(&self) -> Arc<RecvQueue> {
        Arc::clone(&self.queue.lock().expect("queue slot lock poisoned"))
    }

    fn backend(&self) -> CoreResult<Arc<dyn Backend>> {
        self.inner
            .lock()
            .expect("connection lock poisoned")
            .backend
            .clone()
            .ok_or(CoreError::Closed)
    }
}

/// One endpoint of a group communication channel.
pub struct Connection {
    url: BackendUrl,
    shared: Arc<Shared>,
    dispatch: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Connection {
    /// Creates a detached connection for the given backend URL.
    ///
    /// The URL is `scheme://address` with scheme one of `dummy`,
    /// `spread`, `gcomm`. The connection is created closed; `init` it
    /// with a position hint if one exists, then `open` it onto a channel.
    pub fn new(backend_url: &str, config: GcsConfig) -> CoreResult<Self> {
        let url = BackendUrl::parse(backend_url)?;
        config
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let recv_queue_cap = config.recv_queue_cap;
        let fc_upper = config.fc_upper;
        let fc_lower = config.fc_lower;
        Ok(Self {
            url,
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    phase: ConnState::Closed,
                    init_uuid: GroupUuid::UNDEFINED,
                    init_seqno: Seqno::NIL,
                    group: None,
                    backend: None,
                }),
                queue: Mutex::new(Arc::new(RecvQueue::new(recv_queue_cap))),
                repl: ReplTable::new(),
                flow: Mutex::new(FlowControl::new(fc_upper, fc_lower)),
                next_serial: AtomicU64::new(1),
            }),
            dispatch: Mutex::new(None),
        })
    }

    /// Supplies the history position recorded by the application.
    ///
    /// Legal only while the connection is closed; elsewhere the
    /// connection is busy.
    pub fn init(&self, seqno: Seqno, uuid: GroupUuid) -> CoreResult<()> {
        let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
        if !inner.state().can_init() {
            return Err(CoreError::Busy);
        }
        inner.init_seqno = seqno;
        inner.init_uuid = uuid;
        Ok(())
    }

    /// Opens the connection onto the named channel and starts the
    /// dispatch thread.
    pub fn open(&self, channel: &str) -> CoreResult<()> {
        let name = MemberId::new(self.shared.config.node_name.clone());
        if name.as_str().len() + 1 > MemberId::MAX_WIRE_LEN || name.as_str().contains('\0') {
            return Err(CoreError::Config(format!(
                "node_name `{}` does not fit the wire bound",
                name
            )));
        }

        let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
        if inner.state() != ConnState::Closed {
            return Err(CoreError::BadState(inner.state()));
        }

        let backend: Arc<dyn Backend> =
            Arc::from(backend::connect(&self.url, channel, &name, &self.shared.config)?);
        let node = backend.node_id();

        // Fresh queue and flow latch for this open.
        let queue = Arc::new(RecvQueue::new(self.shared.config.recv_queue_cap));
        *self.shared.queue.lock().expect("queue slot lock poisoned") = Arc::clone(&queue);
        *self.shared.flow.lock().expect("flow lock poisoned") =
            FlowControl::new(self.shared.config.fc_upper, self.shared.config.fc_lower);

        inner.group = Some(GroupState::new(
            node,
            name,
            inner.init_uuid,
            inner.init_seqno,
        ));
        inner.backend = Some(Arc::clone(&backend));
        drop(inner);

        let mut dispatch = Dispatch {
            shared: Arc::clone(&self.shared),
            backend,
            queue,
            defrag: Defrag::new(),
            local_seqno: Seqno::NIL,
            node,
        };
        let handle = thread::Builder::new()
            .name("starling-recv".to_string())
            .spawn(move || dispatch.run())
            .map_err(|e| CoreError::Fatal(format!("failed to spawn dispatch thread: {e}")))?;
        *self.dispatch.lock().expect("dispatch lock poisoned") = Some(handle);

        tracing::info!(node = %node, channel, "connection opened");
        Ok(())
    }

    /// Closes the connection: leaves the channel, fails pending
    /// replications and drains the receive queue as error acts.
    pub fn close(&self) -> CoreResult<()> {
        let backend = {
            let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
            if let Some(group) = inner.group.as_mut() {
                group.mark_closed();
            }
            inner.backend.take()
        };
        let Some(backend) = backend else {
            return Err(CoreError::BadState(self.state()));
        };

        backend.close();
        // Unblock the dispatch thread if it is parked on a full queue.
        self.shared.queue().close();
        if let Some(handle) = self
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .take()
        {
            let _ = handle.join();
        }

        let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
        inner.group = None;
        if inner.phase != ConnState::Destroyed {
            inner.phase = ConnState::Closed;
        }
        tracing::info!("connection closed");
        Ok(())
    }

    /// Tears the connection down; terminal.
    pub fn destroy(&self) -> CoreResult<()> {
        let _ = self.close();
        let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
        inner.phase = ConnState::Destroyed;
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.shared
            .inner
            .lock()
            .expect("connection lock poisoned")
            .state()
    }

    /// The group identity, once a primary configuration was seen.
    pub fn uuid(&self) -> GroupUuid {
        self.shared
            .inner
            .lock()
            .expect("connection lock poisoned")
            .group
            .as_ref()
            .map_or(GroupUuid::UNDEFINED, GroupState::uuid)
    }

    /// Submits an action without waiting for its delivery.
    ///
    /// Ownership of the payload moves to the core; the action surfaces
    /// through `recv` on every member, this one included. Returns the
    /// accepted byte count.
    pub fn send(&self, payload: Bytes, kind: ActKind) -> CoreResult<usize> {
        let (backend, node) = self.sendable(kind)?;
        let size = payload.len();
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
        self.transmit(&backend, node, serial, kind, &payload)?;
        Ok(size)
    }

    /// Submits an action and parks until the matching delivery assigns
    /// its seqnos.
    ///
    /// The action also surfaces through `recv` on every member with the
    /// same global seqno. On view loss before delivery the action is
    /// discarded and the call fails.
    pub fn repl(&self, payload: Bytes, kind: ActKind) -> CoreResult<Replicated> {
        let (backend, node) = self.sendable(kind)?;
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
        let waiter = self.shared.repl.register(serial);
        if let Err(e) = self.transmit(&backend, node, serial, kind, &payload) {
            self.shared.repl.forget(serial);
            return Err(e);
        }
        match waiter.wait() {
            Ok(delivery) => Ok(Replicated {
                global_seqno: delivery.global_seqno,
                local_seqno: delivery.local_seqno,
            }),
            Err(reason) => Err(reason.into_error()),
        }
    }

    /// Requests a state transfer, parking until the group selects a
    /// donor.
    ///
    /// The request blob is delivered to the donor as a `StateReq` act.
    /// Fails with [`CoreError::NoDonor`] when no member can donate right
    /// now; the handshake's local seqno still must be skipped.
    pub fn request_state_transfer(&self, request: Bytes) -> CoreResult<StateTransfer> {
        let (backend, node) = {
            let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
            let state = inner.state();
            let Some(backend) = inner.backend.clone() else {
                return Err(CoreError::Closed);
            };
            let Some(group) = inner.group.as_mut() else {
                return Err(CoreError::BadState(state));
            };
            if group.state_req_pending() {
                return Err(CoreError::Busy);
            }
            group.begin_state_req().map_err(CoreError::BadState)?;
            let node = backend.node_id();
            (backend, node)
        };

        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
        let waiter = self.shared.repl.register(serial);
        if let Err(e) = self.transmit(&backend, node, serial, ActKind::StateReq, &request) {
            self.shared.repl.forget(serial);
            let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
            if let Some(group) = inner.group.as_mut() {
                group.abort_state_req();
            }
            return Err(e);
        }

        match waiter.wait() {
            Ok(Delivery {
                donor_idx: Some(donor_idx),
                local_seqno,
                ..
            }) => Ok(StateTransfer {
                donor_idx,
                local_seqno,
            }),
            Ok(Delivery {
                donor_idx: None,
                local_seqno,
                ..
            }) => Err(CoreError::NoDonor {
                local_seqno,
            }),
            Err(reason) => Err(reason.into_error()),
        }
    }

    /// Donor-side completion of a state transfer.
    ///
    /// `status ≥ 0` reports success (the seqno the joiner reached);
    /// `status < 0` reports failure, leaving the joiner unjoined.
    pub fn join(&self, status: i64) -> CoreResult<()> {
        let inner = self.shared.inner.lock().expect("connection lock poisoned");
        let state = inner.state();
        if state != ConnState::Donor {
            return Err(CoreError::BadState(state));
        }
        let backend = inner.backend.clone().ok_or(CoreError::Closed)?;
        let node = backend.node_id();
        drop(inner);
        backend.send(service_frame(node, &ServiceMsg::Join { status }))
    }

    /// Broadcasts this node's last applied seqno for commit-cut
    /// computation.
    pub fn set_last_applied(&self, seqno: Seqno) -> CoreResult<()> {
        let inner = self.shared.inner.lock().expect("connection lock poisoned");
        let state = inner.state();
        if !state.is_primary() {
            return Err(CoreError::BadState(state));
        }
        let backend = inner.backend.clone().ok_or(CoreError::Closed)?;
        let node = backend.node_id();
        drop(inner);
        backend.send(service_frame(node, &ServiceMsg::LastApplied { seqno }))
    }

    /// Receives the next delivered action, parking while none is
    /// available.
    ///
    /// The payload buffer moves to the caller. After close, remaining
    /// entries drain as `Error` acts, then the call fails.
    pub fn recv(&self) -> CoreResult<Act> {
        let queue = self.shared.queue();
        let act = queue.pop().ok_or(CoreError::Closed)?;

        // Draining below the low mark resumes cooperative senders.
        let decision = self
            .shared
            .flow
            .lock()
            .expect("flow lock poisoned")
            .on_depth(queue.depth());
        if let Some(decision) = decision {
            self.broadcast_flow(decision);
        }
        Ok(act)
    }

    /// Reports whether cooperative senders should defer submissions.
    ///
    /// Never parks: returns `true` while any member's stop is
    /// outstanding, `false` when submissions may proceed.
    pub fn wait(&self) -> CoreResult<bool> {
        let inner = self.shared.inner.lock().expect("connection lock poisoned");
        let state = inner.state();
        inner
            .group
            .as_ref()
            .map(|g| g.stop_count() > 0)
            .ok_or(CoreError::BadState(state))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Validates a submission and returns the transmit handles.
    fn sendable(&self, kind: ActKind) -> CoreResult<(Arc<dyn Backend>, NodeId)> {
        if !kind.is_application() {
            return Err(CoreError::InvalidArg(format!(
                "kind {kind} cannot be submitted by the application"
            )));
        }
        let inner = self.shared.inner.lock().expect("connection lock poisoned");
        let state = inner.state();
        if !state.is_primary() {
            return Err(match state {
                ConnState::Closed | ConnState::Destroyed => CoreError::Closed,
                other => CoreError::BadState(other),
            });
        }
        let backend = inner.backend.clone().ok_or(CoreError::Closed)?;
        let node = backend.node_id();
        Ok((backend, node))
    }

    /// Fragments and transmits one action.
    fn transmit(
        &self,
        backend: &Arc<dyn Backend>,
        node: NodeId,
        serial: u64,
        kind: ActKind,
        payload: &Bytes,
    ) -> CoreResult<()> {
        let frames = fragment(
            node,
            serial,
            FrameKind::ActionFrag(kind),
            payload,
            self.shared.config.packet_size,
        )?;
        for frame in frames {
            backend.send(frame)?;
        }
        Ok(())
    }

    fn broadcast_flow(&self, decision: FlowDecision) {
        let Ok(backend) = self.shared.backend() else {
            return;
        };
        let stop = decision == FlowDecision::Stop;
        let node = backend.node_id();
        if let Err(error) = backend.send(service_frame(node, &ServiceMsg::Flow { stop })) {
            tracing::warn!(%error, stop, "failed to broadcast flow transition");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Builds a single service frame.
///
/// Service messages are small and never fragmented, so they bypass the
/// configured packet budget.
fn service_frame(node: NodeId, msg: &ServiceMsg) -> Bytes {
    let header = FrameHeader {
        sender: node,
        act_serial: 0,
        frag_idx: 0,
        last: true,
        kind: FrameKind::Service,
    };
    let payload = msg.encode();
    let mut frame = BytesMut::with_capacity(starling_wire::FRAME_HEADER_LEN + payload.len());
    header.encode(&mut frame);
    frame.extend_from_slice(&payload);
    frame.freeze()
}

// ============================================================================
// Dispatch Loop
// ============================================================================

/// State owned by the dispatch thread.
struct Dispatch {
    shared: Arc<Shared>,
    backend: Arc<dyn Backend>,
    queue: Arc<RecvQueue>,
    defrag: Defrag,
    /// Last assigned local seqno; every surfaced-or-skipped delivery
    /// advances it.
    local_seqno: Seqno,
    node: NodeId,
}

impl Dispatch {
    fn run(&mut self) {
        loop {
            match self.backend.recv() {
                BackendEvent::Shutdown => break,
                BackendEvent::View(view) => self.on_view(&view),
                BackendEvent::Message { sender, frame } => self.on_message(sender, frame),
            }
        }
        self.shared.repl.discard_all(DiscardReason::Closed);
        self.queue.close();
        tracing::debug!(node = %self.node, "dispatch loop stopped");
    }

    fn on_view(&mut self, view: &ViewInfo) {
        let present: Vec<NodeId> = view.members.iter().map(|(node, _)| *node).collect();
        for (sender, serial) in self.defrag.forget_absent(&present) {
            tracing::warn!(sender = %sender, serial, "dropping partial action from departed member");
            if sender == self.node {
                self.shared.repl.discard(serial, DiscardReason::ViewLost);
            }
        }

        let output = {
            let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
            match inner.group.as_mut() {
                Some(group) => group.handle_view(view),
                None => return,
            }
        };
        self.execute(output);
    }

    fn on_message(&mut self, sender: NodeId, frame: Bytes) {
        let mut body = frame;
        let header = match FrameHeader::decode(&mut body) {
            Ok(header) => header,
            Err(error) => {
                tracing::error!(sender = %sender, %error, "undecodable frame");
                self.surface_error(Bytes::new());
                return;
            }
        };

        match header.kind {
            FrameKind::Service => match ServiceMsg::decode(&body) {
                Ok(msg) => {
                    let output = {
                        let mut inner =
                            self.shared.inner.lock().expect("connection lock poisoned");
                        match inner.group.as_mut() {
                            Some(group) => group.handle_service(sender, &msg),
                            None => return,
                        }
                    };
                    self.execute(output);
                }
                Err(error) => {
                    tracing::error!(sender = %sender, %error, "undecodable service message");
                }
            },
            FrameKind::ActionFrag(_) => match self.defrag.feed(&header, body) {
                Ok(None) => {}
                Ok(Some(sealed)) => self.on_sealed(sealed),
                Err(error) => {
                    tracing::error!(sender = %sender, serial = header.act_serial, %error,
                        "fragment stream violation");
                    if sender == self.node {
                        self.shared
                            .repl
                            .discard(header.act_serial, DiscardReason::Violation);
                    }
                    let mut payload = BytesMut::with_capacity(8);
                    payload.put_u64_le(header.act_serial);
                    self.surface_error(payload.freeze());
                }
            },
        }
    }

    fn on_sealed(&mut self, sealed: SealedAct) {
        match sealed.kind {
            ActKind::Data => self.on_data(sealed),
            ActKind::StateReq => self.on_state_req(sealed),
            other => {
                tracing::warn!(sender = %sealed.sender, kind = %other, "unexpected action kind");
                self.enqueue(ActKind::Unknown, sealed.payload, None);
            }
        }
    }

    fn on_data(&mut self, sealed: SealedAct) {
        let global_seqno = {
            let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
            let Some(group) = inner.group.as_mut() else {
                return;
            };
            if !group.state().is_primary() {
                // Ordering is only defined inside a primary
                // configuration; late frames are dropped.
                tracing::debug!(sender = %sealed.sender, "dropping data act outside primary");
                return;
            }
            group.next_global()
        };

        let local_seqno = self.next_local();
        if sealed.sender == self.node {
            self.shared.repl.complete(
                sealed.act_serial,
                Delivery {
                    global_seqno: Some(global_seqno),
                    local_seqno,
                    donor_idx: None,
                },
            );
        }
        self.push(Act::ordered(
            ActKind::Data,
            sealed.payload,
            global_seqno,
            local_seqno,
        ));
    }

    fn on_state_req(&mut self, sealed: SealedAct) {
        let outcome = {
            let mut inner = self.shared.inner.lock().expect("connection lock poisoned");
            let Some(group) = inner.group.as_mut() else {
                return;
            };
            group.handle_state_req(sealed.sender)
        };

        if outcome.requester == self.node {
            // The handshake consumes a local seqno the caller must skip;
            // the act itself never surfaces here.
            let local_seqno = self.next_local();
            self.shared.repl.complete(
                sealed.act_serial,
                Delivery {
                    global_seqno: None,
                    local_seqno,
                    donor_idx: outcome.donor_idx,
                },
            );
        } else if outcome.deliver_here {
            self.enqueue(ActKind::StateReq, sealed.payload, None);
        }
    }

    fn execute(&mut self, output: GroupOutput) {
        if output.view_lost {
            self.shared.repl.discard_all(DiscardReason::ViewLost);
        }
        for act in output.acts {
            self.enqueue(act.kind, act.payload, None);
        }
        for msg in output.broadcasts {
            if let Err(error) = self.backend.send(service_frame(self.node, &msg)) {
                tracing::warn!(%error, msg = msg.name(), "failed to broadcast service message");
            }
        }
    }

    fn next_local(&mut self) -> Seqno {
        self.local_seqno = self.local_seqno.next();
        self.local_seqno
    }

    fn enqueue(&mut self, kind: ActKind, payload: Bytes, global_seqno: Option<Seqno>) {
        let local_seqno = self.next_local();
        let act = match global_seqno {
            Some(gseq) => Act::ordered(kind, payload, gseq, local_seqno),
            None => Act::unordered(kind, payload, local_seqno),
        };
        self.push(act);
    }

    fn surface_error(&mut self, payload: Bytes) {
        self.enqueue(ActKind::Error, payload, None);
    }

    fn push(&mut self, act: Act) {
        if self.queue.push(act).is_err() {
            // Queue closed under us; the connection is going away.
            return;
        }
        let decision = self
            .shared
            .flow
            .lock()
            .expect("flow lock poisoned")
            .on_depth(self.queue.depth());
        if let Some(decision) = decision {
            let stop = decision == FlowDecision::Stop;
            if let Err(error) = self
                .backend
                .send(service_frame(self.node, &ServiceMsg::Flow { stop }))
            {
                tracing::warn!(%error, stop, "failed to broadcast flow transition");
            }
        }
    }
}
