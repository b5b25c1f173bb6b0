//! Pending replication table.
//!
//! Every in-flight `repl` (and state transfer request) parks its caller
//! on a wait slot keyed by the submission serial recorded at transmit
//! time. The dispatch loop completes the slot when the matching delivery
//! surfaces, or discards it when the view is lost, the stream is
//! violated, or the connection closes.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use starling_types::Seqno;

use crate::error::CoreError;

/// Why a pending entry was discarded without delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The primary configuration disappeared before delivery.
    ViewLost,

    /// The connection closed.
    Closed,

    /// The sender's fragment stream was violated mid-action.
    Violation,
}

impl DiscardReason {
    /// Maps the reason to the error handed to the parked caller.
    pub fn into_error(self) -> CoreError {
        match self {
            DiscardReason::ViewLost => CoreError::ViewLost,
            DiscardReason::Closed => CoreError::Closed,
            DiscardReason::Violation => {
                CoreError::Protocol("fragment stream violated mid-action".into())
            }
        }
    }
}

/// Terminal outcome written into a slot by the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    /// Global seqno, for ordered kinds.
    pub global_seqno: Option<Seqno>,

    /// Local seqno consumed by the delivery.
    pub local_seqno: Seqno,

    /// Selected donor index, for state transfer requests.
    pub donor_idx: Option<usize>,
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Done(Delivery),
    Discarded(DiscardReason),
}

/// One caller's wait slot.
#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            cond: Condvar::new(),
        }
    }

    fn finish(&self, next: SlotState) {
        let mut state = self.state.lock().expect("repl slot lock poisoned");
        if matches!(*state, SlotState::Pending) {
            *state = next;
            self.cond.notify_all();
        }
    }

    fn wait(&self) -> Result<Delivery, DiscardReason> {
        let mut state = self.state.lock().expect("repl slot lock poisoned");
        loop {
            match &*state {
                SlotState::Pending => {
                    state = self.cond.wait(state).expect("repl slot lock poisoned");
                }
                SlotState::Done(delivery) => return Ok(*delivery),
                SlotState::Discarded(reason) => return Err(*reason),
            }
        }
    }
}

/// The table of pending entries, keyed by submission serial.
#[derive(Debug, Default)]
pub struct ReplTable {
    slots: Mutex<HashMap<u64, std::sync::Arc<Slot>>>,
}

/// Handle a submitting caller parks on.
#[derive(Debug)]
pub struct ReplWaiter {
    slot: std::sync::Arc<Slot>,
}

impl ReplWaiter {
    /// Parks until the dispatch loop finishes the slot.
    pub fn wait(self) -> Result<Delivery, DiscardReason> {
        self.slot.wait()
    }
}

impl ReplTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending entry for `serial` before transmission.
    pub fn register(&self, serial: u64) -> ReplWaiter {
        let slot = std::sync::Arc::new(Slot::new());
        self.slots
            .lock()
            .expect("repl table lock poisoned")
            .insert(serial, std::sync::Arc::clone(&slot));
        ReplWaiter { slot }
    }

    /// Removes an entry that never made it onto the wire.
    pub fn forget(&self, serial: u64) {
        self.slots
            .lock()
            .expect("repl table lock poisoned")
            .remove(&serial);
    }

    /// Completes the entry for `serial`, if any, waking its caller.
    ///
    /// Returns true if a caller was matched: the dispatch loop uses this
    /// to tell a local repl from a plain local send.
    pub fn complete(&self, serial: u64, delivery: Delivery) -> bool {
        let slot = self
            .slots
            .lock()
            .expect("repl table lock poisoned")
            .remove(&serial);
        match slot {
            Some(slot) => {
                slot.finish(SlotState::Done(delivery));
                true
            }
            None => false,
        }
    }

    /// Discards the entry for `serial`, if any, waking its caller with an
    /// error.
    pub fn discard(&self, serial: u64, reason: DiscardReason) {
        let slot = self
            .slots
            .lock()
            .expect("repl table lock poisoned")
            .remove(&serial);
        if let Some(slot) = slot {
            slot.finish(SlotState::Discarded(reason));
        }
    }

    /// Discards every pending entry (view loss, close).
    pub fn discard_all(&self, reason: DiscardReason) {
        let drained: Vec<_> = self
            .slots
            .lock()
            .expect("repl table lock poisoned")
            .drain()
            .collect();
        for (_, slot) in drained {
            slot.finish(SlotState::Discarded(reason));
        }
    }

    /// Number of in-flight entries.
    pub fn pending(&self) -> usize {
        self.slots.lock().expect("repl table lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn complete_wakes_waiter_with_seqnos() {
        let table = Arc::new(ReplTable::new());
        let waiter = table.register(1);

        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(30));
        let matched = table.complete(
            1,
            Delivery {
                global_seqno: Some(Seqno::new(5)),
                local_seqno: Seqno::new(9),
                donor_idx: None,
            },
        );
        assert!(matched);

        let delivery = handle.join().expect("join").expect("delivered");
        assert_eq!(delivery.global_seqno, Some(Seqno::new(5)));
        assert_eq!(delivery.local_seqno, Seqno::new(9));
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn complete_without_entry_reports_no_match() {
        let table = ReplTable::new();
        assert!(!table.complete(
            42,
            Delivery {
                global_seqno: None,
                local_seqno: Seqno::new(1),
                donor_idx: None,
            },
        ));
    }

    #[test]
    fn discard_all_wakes_every_waiter() {
        let table = Arc::new(ReplTable::new());
        let handles: Vec<_> = (0..3)
            .map(|serial| {
                let waiter = table.register(serial);
                thread::spawn(move || waiter.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        table.discard_all(DiscardReason::ViewLost);

        for handle in handles {
            let result = handle.join().expect("join");
            assert_eq!(result.unwrap_err(), DiscardReason::ViewLost);
        }
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn forget_removes_unsent_entry() {
        let table = ReplTable::new();
        let _waiter = table.register(7);
        assert_eq!(table.pending(), 1);
        table.forget(7);
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn discard_reason_maps_to_errors() {
        assert!(matches!(
            DiscardReason::ViewLost.into_error(),
            CoreError::ViewLost
        ));
        assert!(matches!(
            DiscardReason::Closed.into_error(),
            CoreError::Closed
        ));
        assert!(matches!(
            DiscardReason::Violation.into_error(),
            CoreError::Protocol(_)
        ));
    }
}
