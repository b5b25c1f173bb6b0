//! In-process transport hub.
//!
//! Every endpoint that opens the same `address/channel` pair in one
//! process joins the same hub. The hub lock is the sequencer: a send
//! appends the frame to every member's inbox before the lock drops,
//! which yields uniform total order, per-sender FIFO, and view events
//! delivered inline with the message stream — exactly the contract the
//! core demands of a real group transport.
//!
//! Quorum follows the membership: a growing view is always primary; a
//! shrinking view stays primary only while more than half of the
//! previous membership remains. A two-member group that loses one
//! therefore drops to non-primary, which is what the view-loss tests
//! exercise.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use bytes::Bytes;
use starling_types::{MemberId, NodeId};

use crate::error::{CoreError, CoreResult};
use crate::group::ViewInfo;

use super::{Backend, BackendEvent};

// ============================================================================
// Hub Registry
// ============================================================================

fn registry() -> &'static Mutex<HashMap<String, Arc<Hub>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Hub>>>> = OnceLock::new();
    REGISTRY.get_or_init(Mutex::default)
}

fn hub_for(address: &str, channel: &str) -> Arc<Hub> {
    let key = format!("{address}/{channel}");
    let mut hubs = registry().lock().expect("hub registry lock poisoned");
    Arc::clone(hubs.entry(key).or_default())
}

// ============================================================================
// Inbox
// ============================================================================

/// One endpoint's blocking event queue.
#[derive(Debug, Default)]
struct Inbox {
    events: Mutex<VecDeque<BackendEvent>>,
    ready: Condvar,
}

impl Inbox {
    fn push(&self, event: BackendEvent) {
        self.events
            .lock()
            .expect("inbox lock poisoned")
            .push_back(event);
        self.ready.notify_one();
    }

    fn pop(&self) -> BackendEvent {
        let mut events = self.events.lock().expect("inbox lock poisoned");
        loop {
            if let Some(event) = events.pop_front() {
                return event;
            }
            events = self.ready.wait(events).expect("inbox lock poisoned");
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Debug)]
struct Endpoint {
    node: NodeId,
    name: MemberId,
    inbox: Arc<Inbox>,
}

#[derive(Debug, Default)]
struct HubState {
    next_node: u64,
    next_view: u64,
    endpoints: Vec<Endpoint>,
}

/// A single channel's sequencer.
#[derive(Debug, Default)]
struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    fn join(&self, name: &MemberId) -> (NodeId, Arc<Inbox>) {
        let mut state = self.state.lock().expect("hub lock poisoned");
        state.next_node += 1;
        state.next_view += 1;
        let node = NodeId::new(state.next_node);
        let inbox = Arc::new(Inbox::default());
        state.endpoints.push(Endpoint {
            node,
            name: name.clone(),
            inbox: Arc::clone(&inbox),
        });

        let view = ViewInfo {
            view_id: state.next_view,
            primary: true,
            members: state
                .endpoints
                .iter()
                .map(|e| (e.node, e.name.clone()))
                .collect(),
        };
        for endpoint in &state.endpoints {
            endpoint.inbox.push(BackendEvent::View(view.clone()));
        }
        (node, inbox)
    }

    fn leave(&self, node: NodeId) {
        let mut state = self.state.lock().expect("hub lock poisoned");
        let before = state.endpoints.len();
        let Some(pos) = state.endpoints.iter().position(|e| e.node == node) else {
            return;
        };
        let departed = state.endpoints.remove(pos);
        departed.inbox.push(BackendEvent::Shutdown);

        if state.endpoints.is_empty() {
            return;
        }
        state.next_view += 1;
        let view = ViewInfo {
            view_id: state.next_view,
            // Quorum: strictly more than half of the previous membership.
            primary: state.endpoints.len() * 2 > before,
            members: state
                .endpoints
                .iter()
                .map(|e| (e.node, e.name.clone()))
                .collect(),
        };
        for endpoint in &state.endpoints {
            endpoint.inbox.push(BackendEvent::View(view.clone()));
        }
    }

    fn broadcast(&self, from: NodeId, frame: Bytes) -> CoreResult<()> {
        let state = self.state.lock().expect("hub lock poisoned");
        if !state.endpoints.iter().any(|e| e.node == from) {
            return Err(CoreError::Backend("endpoint left the channel".into()));
        }
        for endpoint in &state.endpoints {
            endpoint.inbox.push(BackendEvent::Message {
                sender: from,
                frame: frame.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Backend Implementation
// ============================================================================

/// An endpoint connected to an in-process hub.
pub struct DummyBackend {
    hub: Arc<Hub>,
    node: NodeId,
    inbox: Arc<Inbox>,
    open: Mutex<bool>,
}

impl DummyBackend {
    /// Joins the hub for `address/channel`, creating it on first use.
    pub fn connect(address: &str, channel: &str, name: &MemberId) -> Self {
        let hub = hub_for(address, channel);
        let (node, inbox) = hub.join(name);
        tracing::debug!(node = %node, channel, "joined dummy hub");
        Self {
            hub,
            node,
            inbox,
            open: Mutex::new(true),
        }
    }
}

impl Backend for DummyBackend {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn send(&self, frame: Bytes) -> CoreResult<()> {
        if !*self.open.lock().expect("backend lock poisoned") {
            return Err(CoreError::Backend("backend closed".into()));
        }
        self.hub.broadcast(self.node, frame)
    }

    fn recv(&self) -> BackendEvent {
        self.inbox.pop()
    }

    fn close(&self) {
        let mut open = self.open.lock().expect("backend lock poisoned");
        if *open {
            *open = false;
            self.hub.leave(self.node);
        }
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str) -> String {
        // Unique per test so hubs do not leak between tests.
        format!("{name}-{:?}", std::thread::current().id())
    }

    fn expect_view(event: BackendEvent) -> ViewInfo {
        match event {
            BackendEvent::View(view) => view,
            other => panic!("expected view, got {other:?}"),
        }
    }

    fn expect_message(event: BackendEvent) -> (NodeId, Bytes) {
        match event {
            BackendEvent::Message { sender, frame } => (sender, frame),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn join_delivers_primary_view_to_everyone() {
        let ch = channel("join");
        let a = DummyBackend::connect("", &ch, &MemberId::new("a"));
        let view = expect_view(a.recv());
        assert!(view.primary);
        assert_eq!(view.members.len(), 1);

        let b = DummyBackend::connect("", &ch, &MemberId::new("b"));
        let view_a = expect_view(a.recv());
        let view_b = expect_view(b.recv());
        assert_eq!(view_a, view_b);
        assert_eq!(view_a.members.len(), 2);
        assert!(view_a.primary);
    }

    #[test]
    fn broadcast_reaches_all_members_in_the_same_order() {
        let ch = channel("order");
        let a = DummyBackend::connect("", &ch, &MemberId::new("a"));
        let b = DummyBackend::connect("", &ch, &MemberId::new("b"));
        let _ = a.recv(); // view {a}
        let _ = a.recv(); // view {a,b}
        let _ = b.recv(); // view {a,b}

        a.send(Bytes::from_static(b"one")).expect("send");
        b.send(Bytes::from_static(b"two")).expect("send");

        let (s1a, f1a) = expect_message(a.recv());
        let (s2a, f2a) = expect_message(a.recv());
        let (s1b, f1b) = expect_message(b.recv());
        let (s2b, f2b) = expect_message(b.recv());

        assert_eq!((s1a, &f1a[..]), (s1b, &f1b[..]));
        assert_eq!((s2a, &f2a[..]), (s2b, &f2b[..]));
        assert_eq!(s1a, a.node_id());
        assert_eq!(s2a, b.node_id());
    }

    #[test]
    fn two_member_group_loses_quorum_when_one_leaves() {
        let ch = channel("quorum2");
        let a = DummyBackend::connect("", &ch, &MemberId::new("a"));
        let b = DummyBackend::connect("", &ch, &MemberId::new("b"));
        let _ = a.recv();
        let _ = a.recv();
        let _ = b.recv();

        b.close();
        let view = expect_view(a.recv());
        assert!(!view.primary, "1 of 2 is not a quorum");
        assert_eq!(view.members.len(), 1);
    }

    #[test]
    fn three_member_group_keeps_quorum_when_one_leaves() {
        let ch = channel("quorum3");
        let a = DummyBackend::connect("", &ch, &MemberId::new("a"));
        let b = DummyBackend::connect("", &ch, &MemberId::new("b"));
        let c = DummyBackend::connect("", &ch, &MemberId::new("c"));
        let _ = a.recv();
        let _ = a.recv();
        let _ = a.recv();
        let _ = b.recv();
        let _ = b.recv();
        let _ = c.recv();

        c.close();
        let view = expect_view(a.recv());
        assert!(view.primary, "2 of 3 keeps quorum");
        let view = expect_view(b.recv());
        assert!(view.primary);
    }

    #[test]
    fn close_unblocks_receiver_with_shutdown() {
        let ch = channel("close");
        let a = Arc::new(DummyBackend::connect("", &ch, &MemberId::new("a")));
        let _ = a.recv();

        let receiver = {
            let a = Arc::clone(&a);
            std::thread::spawn(move || a.recv())
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        a.close();
        assert!(matches!(
            receiver.join().expect("join"),
            BackendEvent::Shutdown
        ));
    }

    #[test]
    fn send_after_close_fails() {
        let ch = channel("send-after-close");
        let a = DummyBackend::connect("", &ch, &MemberId::new("a"));
        a.close();
        assert!(a.send(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn events_after_leave_stop_arriving() {
        let ch = channel("leave");
        let a = DummyBackend::connect("", &ch, &MemberId::new("a"));
        let b = DummyBackend::connect("", &ch, &MemberId::new("b"));
        let _ = a.recv();
        let _ = a.recv();
        let _ = b.recv();

        a.close();
        // b sees the membership change; a only sees its shutdown.
        assert!(matches!(a.recv(), BackendEvent::Shutdown));
        let view = expect_view(b.recv());
        assert_eq!(view.members.len(), 1);
    }
}
