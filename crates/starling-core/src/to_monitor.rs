//! Total-order monitor: a seqno-gated critical section.
//!
//! Applications use the monitor to serialize commit work in global seqno
//! order: `grab(n)` parks until `n - 1` has been released (or skipped),
//! `release(n)` lets `n + 1` proceed. Capacity is a ring of `L` slots
//! indexed by `seqno mod L`; a seqno further than `L` ahead of the
//! released cursor fails with [`ToError::Retry`] until releases catch up.
//!
//! Cancellation removes a seqno from the order entirely: its waiter
//! returns [`ToError::Canceled`] and successors stop waiting for it.
//! Interruption only wakes the waiter ([`ToError::Interrupted`]); the
//! seqno stays pending and must be grabbed again or self-cancelled, and
//! successors keep waiting for it.
//!
//! Mutual exclusion is logical: the monitor guarantees at most one
//! holder at any time, rather than handing out a guard object, because
//! release, cancel and interrupt are fallible operations in their own
//! right.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

use starling_types::Seqno;

use crate::error::{ToError, ToResult};

/// State of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Waiting,
    Holding,
    Canceled,
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    seqno: i64,
    state: SlotState,
    /// True while a thread is attached to the slot (waiting or holding).
    /// A pre-issued interrupt claims a slot with no thread attached.
    waiter: bool,
}

impl Slot {
    const FREE: Slot = Slot {
        seqno: -1,
        state: SlotState::Free,
        waiter: false,
    };
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Slot>,
    /// Last seqno out of the order (released or skipped past).
    released: i64,
    /// Cancelled seqnos the cursor has not passed yet.
    skipped: BTreeSet<i64>,
    closed: bool,
}

/// Seqno-gated critical section with cancel and interrupt semantics.
#[derive(Debug)]
pub struct ToMonitor {
    ring: Mutex<Ring>,
    /// One condition per slot; a waiter parks on its slot's condition.
    conds: Vec<Condvar>,
}

impl ToMonitor {
    /// Creates a monitor of `len` slots, expecting `start` as the first
    /// seqno to be grabbed.
    ///
    /// # Panics
    ///
    /// Panics if `len` is 0.
    pub fn new(len: usize, start: Seqno) -> Self {
        assert!(len > 0, "monitor length must be positive");
        Self {
            ring: Mutex::new(Ring {
                slots: vec![Slot::FREE; len],
                released: start.as_i64() - 1,
                skipped: BTreeSet::new(),
                closed: false,
            }),
            conds: (0..len).map(|_| Condvar::new()).collect(),
        }
    }

    fn index(&self, seqno: i64) -> usize {
        seqno as usize % self.conds.len()
    }

    /// Enters the critical section for `seqno`, parking until its
    /// predecessor releases.
    ///
    /// Errors: [`ToError::Retry`] when the ring cannot hold the seqno
    /// yet, [`ToError::Canceled`] when the seqno was cancelled (it is
    /// skipped; do not retry), [`ToError::Interrupted`] when the wait was
    /// interrupted (the seqno stays pending), [`ToError::OutOfRange`]
    /// when the seqno was already released.
    pub fn grab(&self, seqno: Seqno) -> ToResult<()> {
        let q = seqno.as_i64();
        let mut ring = self.ring.lock().expect("monitor lock poisoned");

        if ring.closed {
            return Err(ToError::Destroyed);
        }
        if q <= ring.released {
            return Err(ToError::OutOfRange {
                seqno,
                released: ring.released,
            });
        }
        if ring.skipped.contains(&q) {
            return Err(ToError::Canceled);
        }
        if q - ring.released > self.conds.len() as i64 {
            return Err(ToError::Retry);
        }

        let idx = self.index(q);
        let slot = ring.slots[idx];
        if slot.state != SlotState::Free {
            if slot.seqno != q {
                // The ring wrapped onto an earlier occupant.
                return Err(ToError::Retry);
            }
            match slot.state {
                SlotState::Interrupted if !slot.waiter => {
                    // A pre-issued interrupt: consume it.
                    ring.slots[idx] = Slot::FREE;
                    return Err(ToError::Interrupted);
                }
                SlotState::Canceled if !slot.waiter => {
                    ring.slots[idx] = Slot::FREE;
                    return Err(ToError::Canceled);
                }
                // A thread is still attached to this seqno.
                _ => return Err(ToError::Retry),
            }
        }

        ring.slots[idx] = Slot {
            seqno: q,
            state: SlotState::Waiting,
            waiter: true,
        };

        loop {
            if ring.closed {
                ring.slots[idx] = Slot::FREE;
                return Err(ToError::Destroyed);
            }
            match ring.slots[idx].state {
                SlotState::Canceled => {
                    ring.slots[idx] = Slot::FREE;
                    return Err(ToError::Canceled);
                }
                SlotState::Interrupted => {
                    ring.slots[idx] = Slot::FREE;
                    return Err(ToError::Interrupted);
                }
                SlotState::Waiting => {
                    if ring.released == q - 1 {
                        ring.slots[idx].state = SlotState::Holding;
                        return Ok(());
                    }
                    ring = self.conds[idx].wait(ring).expect("monitor lock poisoned");
                }
                state => unreachable!("waiter observed slot state {state:?}"),
            }
        }
    }

    /// Leaves the critical section for `seqno`, waking its successor.
    ///
    /// Out-of-order release is an application bug and errors with
    /// [`ToError::NotHolding`]. If a concurrent cancel beat us to the
    /// slot, the cancel wins and the release fails with
    /// [`ToError::Canceled`].
    pub fn release(&self, seqno: Seqno) -> ToResult<()> {
        let q = seqno.as_i64();
        let mut ring = self.ring.lock().expect("monitor lock poisoned");

        if ring.closed {
            return Err(ToError::Destroyed);
        }
        let idx = self.index(q);
        if ring.slots[idx].seqno != q || ring.slots[idx].state == SlotState::Free {
            return Err(ToError::NotHolding);
        }
        match ring.slots[idx].state {
            SlotState::Holding => {
                ring.slots[idx] = Slot::FREE;
                ring.released = q;
                self.advance(&mut ring);
                Ok(())
            }
            SlotState::Canceled => {
                // The slot is already out of HOLDING; the cancel carries
                // the ordering forward.
                ring.slots[idx] = Slot::FREE;
                self.advance(&mut ring);
                Err(ToError::Canceled)
            }
            _ => Err(ToError::NotHolding),
        }
    }

    /// Cancels `seqno`: its waiter (if any) returns
    /// [`ToError::Canceled`] and successors treat it as released.
    ///
    /// May be issued against any pending seqno, earlier or later than the
    /// holder. Idempotent while the cursor has not passed the seqno;
    /// afterwards it errors with [`ToError::OutOfRange`].
    pub fn cancel(&self, seqno: Seqno) -> ToResult<()> {
        self.cancel_inner(seqno)
    }

    /// Cancels one's own pending seqno without entering the section.
    ///
    /// Used after [`ToError::Interrupted`], or when the action at this
    /// seqno must be skipped (the state transfer handshake's local skip).
    pub fn self_cancel(&self, seqno: Seqno) -> ToResult<()> {
        self.cancel_inner(seqno)
    }

    fn cancel_inner(&self, seqno: Seqno) -> ToResult<()> {
        let q = seqno.as_i64();
        let mut ring = self.ring.lock().expect("monitor lock poisoned");

        if ring.closed {
            return Err(ToError::Destroyed);
        }
        if q <= ring.released {
            return Err(ToError::OutOfRange {
                seqno,
                released: ring.released,
            });
        }

        ring.skipped.insert(q);

        let idx = self.index(q);
        if ring.slots[idx].seqno == q {
            match ring.slots[idx].state {
                SlotState::Waiting | SlotState::Holding => {
                    ring.slots[idx].state = SlotState::Canceled;
                    self.conds[idx].notify_all();
                }
                SlotState::Interrupted if ring.slots[idx].waiter => {
                    ring.slots[idx].state = SlotState::Canceled;
                    self.conds[idx].notify_all();
                }
                // A pre-issued interrupt with no thread attached: the
                // skip record carries the cancellation, free the slot.
                SlotState::Interrupted => ring.slots[idx] = Slot::FREE,
                SlotState::Canceled | SlotState::Free => {}
            }
        }

        self.advance(&mut ring);
        Ok(())
    }

    /// Wakes the waiter at `seqno` with [`ToError::Interrupted`], keeping
    /// the seqno pending: successors still wait for it.
    ///
    /// Errors with [`ToError::OutOfRange`] if the seqno is already
    /// released.
    pub fn interrupt(&self, seqno: Seqno) -> ToResult<()> {
        let q = seqno.as_i64();
        let mut ring = self.ring.lock().expect("monitor lock poisoned");

        if ring.closed {
            return Err(ToError::Destroyed);
        }
        if q <= ring.released {
            return Err(ToError::OutOfRange {
                seqno,
                released: ring.released,
            });
        }

        let idx = self.index(q);
        let slot = ring.slots[idx];
        if slot.seqno == q {
            match slot.state {
                SlotState::Waiting => {
                    ring.slots[idx].state = SlotState::Interrupted;
                    self.conds[idx].notify_all();
                    Ok(())
                }
                SlotState::Holding => Err(ToError::NotHolding),
                // Already interrupted or cancelled: nothing more to do.
                _ => Ok(()),
            }
        } else if slot.state != SlotState::Free || q - ring.released > self.conds.len() as i64 {
            Err(ToError::Retry)
        } else {
            // Pre-issue the interrupt: the next grab at this seqno
            // consumes it immediately.
            ring.slots[idx] = Slot {
                seqno: q,
                state: SlotState::Interrupted,
                waiter: false,
            };
            Ok(())
        }
    }

    /// Conservative lower bound of the last seqno known to be out of use.
    ///
    /// `None` only before the first release when the monitor started at
    /// [`Seqno::NIL`].
    pub fn last_released(&self) -> Option<Seqno> {
        let ring = self.ring.lock().expect("monitor lock poisoned");
        Seqno::decode_opt(ring.released)
    }

    /// Destroys the monitor.
    ///
    /// Fails with [`ToError::Busy`] while a waiter or holder is
    /// outstanding; unblock them with cancel or interrupt first.
    pub fn close(&self) -> ToResult<()> {
        let mut ring = self.ring.lock().expect("monitor lock poisoned");
        let busy = ring
            .slots
            .iter()
            .any(|s| matches!(s.state, SlotState::Waiting | SlotState::Holding));
        if busy {
            return Err(ToError::Busy);
        }
        ring.closed = true;
        drop(ring);
        for cond in &self.conds {
            cond.notify_all();
        }
        Ok(())
    }

    /// Advances the released cursor through skipped seqnos and wakes the
    /// next pending waiter.
    fn advance(&self, ring: &mut Ring) {
        loop {
            let next = ring.released + 1;
            if ring.skipped.remove(&next) {
                ring.released = next;
            } else {
                break;
            }
        }
        let next = ring.released + 1;
        let idx = self.index(next);
        if ring.slots[idx].seqno == next && ring.slots[idx].state == SlotState::Waiting {
            self.conds[idx].notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::thread;
    use std::time::Duration;

    fn seqno(n: i64) -> Seqno {
        Seqno::new(n)
    }

    #[test]
    fn first_grab_enters_immediately() {
        let to = ToMonitor::new(4, Seqno::FIRST);
        to.grab(seqno(1)).expect("grab");
        to.release(seqno(1)).expect("release");
        assert_eq!(to.last_released(), Some(seqno(1)));
    }

    #[test]
    fn grab_blocks_until_predecessor_releases() {
        let to = Arc::new(ToMonitor::new(4, Seqno::FIRST));
        let entered = Arc::new(AtomicUsize::new(0));

        to.grab(seqno(1)).expect("grab 1");

        let waiter = {
            let to = Arc::clone(&to);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                to.grab(seqno(2)).expect("grab 2");
                entered.store(1, Ordering::SeqCst);
                to.release(seqno(2)).expect("release 2");
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0, "2 must wait for 1");

        to.release(seqno(1)).expect("release 1");
        waiter.join().expect("join");
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert_eq!(to.last_released(), Some(seqno(2)));
    }

    #[test]
    fn entry_order_is_strict_seqno_order() {
        // Threads grab 1..=3 concurrently; entries happen in order.
        let to = Arc::new(ToMonitor::new(4, Seqno::FIRST));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let handles: Vec<_> = [3i64, 2, 1]
            .into_iter()
            .map(|n| {
                let to = Arc::clone(&to);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    // Stagger starts so later seqnos are already waiting.
                    thread::sleep(Duration::from_millis(10 * (4 - n) as u64));
                    to.grab(seqno(n)).expect("grab");
                    order.lock().expect("order lock").push(n);
                    to.release(seqno(n)).expect("release");
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(*order.lock().expect("order lock"), vec![1, 2, 3]);
    }

    #[test]
    fn released_seqnos_are_monotonic_across_threads() {
        let to = Arc::new(ToMonitor::new(8, Seqno::FIRST));
        let releases = Arc::new(StdMutex::new(Vec::new()));

        let handles: Vec<_> = (1i64..=20)
            .map(|n| {
                let to = Arc::clone(&to);
                let releases = Arc::clone(&releases);
                thread::spawn(move || loop {
                    match to.grab(seqno(n)) {
                        Ok(()) => {
                            releases.lock().expect("lock").push(n);
                            to.release(seqno(n)).expect("release");
                            break;
                        }
                        Err(ToError::Retry) => thread::sleep(Duration::from_millis(1)),
                        Err(e) => panic!("unexpected error {e}"),
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("join");
        }
        let releases = releases.lock().expect("lock");
        let sorted: Vec<i64> = (1..=20).collect();
        assert_eq!(*releases, sorted);
    }

    #[test]
    fn cancel_skips_the_seqno_for_successors() {
        // T1 holds 1, T2 waits on 2, T3 waits on 3. Cancelling 2 and
        // releasing 1 lets 3 enter without any holder for 2.
        let to = Arc::new(ToMonitor::new(4, Seqno::FIRST));
        to.grab(seqno(1)).expect("grab 1");

        let t2 = {
            let to = Arc::clone(&to);
            thread::spawn(move || to.grab(seqno(2)))
        };
        let t3 = {
            let to = Arc::clone(&to);
            thread::spawn(move || {
                to.grab(seqno(3))?;
                to.release(seqno(3))
            })
        };

        thread::sleep(Duration::from_millis(50));
        to.cancel(seqno(2)).expect("cancel 2");
        to.release(seqno(1)).expect("release 1");

        assert_eq!(t2.join().expect("join"), Err(ToError::Canceled));
        t3.join().expect("join").expect("3 entered and released");
        assert_eq!(to.last_released(), Some(seqno(3)));
    }

    #[test]
    fn interrupt_keeps_the_seqno_pending() {
        let to = Arc::new(ToMonitor::new(4, Seqno::FIRST));
        to.grab(seqno(1)).expect("grab 1");

        let t2 = {
            let to = Arc::clone(&to);
            thread::spawn(move || to.grab(seqno(2)))
        };
        thread::sleep(Duration::from_millis(50));
        to.interrupt(seqno(2)).expect("interrupt");
        assert_eq!(t2.join().expect("join"), Err(ToError::Interrupted));

        // Successors still wait: 2 is pending, not skipped.
        let t3 = {
            let to = Arc::clone(&to);
            thread::spawn(move || to.grab(seqno(3)).map(|()| to.release(seqno(3))))
        };
        thread::sleep(Duration::from_millis(30));
        to.release(seqno(1)).expect("release 1");
        thread::sleep(Duration::from_millis(30));

        // Re-issued grab enters normally once 1 is released.
        to.grab(seqno(2)).expect("re-grab 2");
        to.release(seqno(2)).expect("release 2");

        t3.join().expect("join").expect("3 entered").expect("3 released");
    }

    #[test]
    fn interrupt_before_grab_pokes_the_next_grabber() {
        let to = ToMonitor::new(4, Seqno::FIRST);
        to.interrupt(seqno(1)).expect("pre-interrupt");
        assert_eq!(to.grab(seqno(1)), Err(ToError::Interrupted));
        // The poke is consumed; the next grab enters.
        to.grab(seqno(1)).expect("grab");
        to.release(seqno(1)).expect("release");
    }

    #[test]
    fn self_cancel_without_waiter_unblocks_successors() {
        let to = Arc::new(ToMonitor::new(4, Seqno::FIRST));
        to.grab(seqno(1)).expect("grab 1");
        to.self_cancel(seqno(2)).expect("self cancel 2");

        let t3 = {
            let to = Arc::clone(&to);
            thread::spawn(move || to.grab(seqno(3)))
        };
        thread::sleep(Duration::from_millis(30));
        to.release(seqno(1)).expect("release 1");
        t3.join().expect("join").expect("3 entered");
        // A grab of the cancelled seqno reports the cancellation.
        assert!(matches!(
            to.grab(seqno(2)),
            Err(ToError::OutOfRange { .. }) | Err(ToError::Canceled)
        ));
    }

    #[test]
    fn ring_capacity_limits_lookahead() {
        let to = ToMonitor::new(4, Seqno::FIRST);
        to.grab(seqno(1)).expect("grab 1");
        // 5 - 0 > 4: too far ahead while 1 is not released.
        assert_eq!(to.grab(seqno(5)), Err(ToError::Retry));
        to.release(seqno(1)).expect("release 1");
        // Now 5 - 1 <= 4: the slot is reachable (but waits for 2..4).
        to.self_cancel(seqno(2)).expect("skip 2");
        to.self_cancel(seqno(3)).expect("skip 3");
        to.self_cancel(seqno(4)).expect("skip 4");
        to.grab(seqno(5)).expect("grab 5");
        to.release(seqno(5)).expect("release 5");
    }

    #[test]
    fn out_of_order_release_is_an_error() {
        let to = ToMonitor::new(4, Seqno::FIRST);
        to.grab(seqno(1)).expect("grab 1");
        assert_eq!(to.release(seqno(2)), Err(ToError::NotHolding));
        to.release(seqno(1)).expect("release 1");
        assert_eq!(to.release(seqno(1)), Err(ToError::NotHolding));
    }

    #[test]
    fn cancel_past_cursor_is_out_of_range() {
        let to = ToMonitor::new(4, Seqno::FIRST);
        to.grab(seqno(1)).expect("grab");
        to.release(seqno(1)).expect("release");
        assert!(matches!(
            to.cancel(seqno(1)),
            Err(ToError::OutOfRange { .. })
        ));
    }

    #[test]
    fn cancel_beats_release_on_the_same_seqno() {
        let to = ToMonitor::new(4, Seqno::FIRST);
        to.grab(seqno(1)).expect("grab");
        // A concurrent cancel lands while the holder is in the section.
        to.cancel(seqno(1)).expect("cancel");
        assert_eq!(to.release(seqno(1)), Err(ToError::Canceled));
        // Ordering advanced past the cancelled seqno regardless.
        to.grab(seqno(2)).expect("grab 2");
        to.release(seqno(2)).expect("release 2");
    }

    #[test]
    fn close_with_waiter_is_busy() {
        let to = Arc::new(ToMonitor::new(4, Seqno::FIRST));
        to.grab(seqno(1)).expect("grab");
        let t2 = {
            let to = Arc::clone(&to);
            thread::spawn(move || to.grab(seqno(2)))
        };
        thread::sleep(Duration::from_millis(30));

        assert_eq!(to.close(), Err(ToError::Busy));

        to.cancel(seqno(2)).expect("cancel waiter");
        assert_eq!(t2.join().expect("join"), Err(ToError::Canceled));
        assert_eq!(to.close(), Err(ToError::Busy), "holder still outstanding");
        to.release(seqno(1)).expect("release");
        to.close().expect("close");
        assert_eq!(to.grab(seqno(3)), Err(ToError::Destroyed));
    }

    #[test]
    fn monitor_starting_past_first_gates_on_its_start() {
        let to = ToMonitor::new(4, seqno(11));
        assert_eq!(to.last_released(), Some(seqno(10)));
        to.grab(seqno(11)).expect("grab 11");
        to.release(seqno(11)).expect("release 11");
        assert!(matches!(
            to.grab(seqno(5)),
            Err(ToError::OutOfRange { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "monitor length must be positive")]
    fn zero_length_panics() {
        let _ = ToMonitor::new(0, Seqno::FIRST);
    }
}
