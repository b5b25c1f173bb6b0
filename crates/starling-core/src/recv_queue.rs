//! Bounded receive queue of sealed actions.
//!
//! Single producer (the dispatch loop), many consumers (`recv` callers).
//! The queue imposes no ordering beyond insertion order; ordering
//! correctness is the wire layer's responsibility. Consumers park while
//! the queue is empty; the producer parks while it is full, which is what
//! backpressures the transport when the application falls behind.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use starling_types::{Act, ActKind};

/// A bounded, blocking FIFO of delivered actions.
#[derive(Debug)]
pub struct RecvQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Act>,
    capacity: usize,
    open: bool,
}

impl RecvQueue {
    /// Creates a queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                open: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueues an action, blocking while the queue is full.
    ///
    /// Returns the action back on shutdown: producers are rejected only
    /// once the queue is closed.
    pub fn push(&self, act: Act) -> Result<(), Act> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        while inner.open && inner.queue.len() >= inner.capacity {
            inner = self.not_full.wait(inner).expect("queue lock poisoned");
        }
        if !inner.open {
            return Err(act);
        }
        inner.queue.push_back(act);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues the next action, blocking while the queue is empty.
    ///
    /// After close, remaining entries drain with their kind overridden to
    /// [`ActKind::Error`]; once the queue is empty, returns `None`.
    pub fn pop(&self) -> Option<Act> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        while inner.open && inner.queue.is_empty() {
            inner = self.not_empty.wait(inner).expect("queue lock poisoned");
        }
        let open = inner.open;
        let act = inner.queue.pop_front().map(|mut act| {
            if !open {
                act.kind = ActKind::Error;
            }
            act
        });
        drop(inner);
        if act.is_some() {
            self.not_full.notify_one();
        } else {
            // Closed and empty: make sure every parked consumer re-checks.
            self.not_empty.notify_all();
        }
        act
    }

    /// Closes the queue, waking every parked producer and consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.open = false;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Current depth; the flow controller's input.
    pub fn depth(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use starling_types::Seqno;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn act(n: i64) -> Act {
        Act::ordered(
            ActKind::Data,
            Bytes::from(vec![n as u8]),
            Seqno::new(n),
            Seqno::new(n),
        )
    }

    #[test]
    fn fifo_order() {
        let q = RecvQueue::new(8);
        q.push(act(1)).expect("push");
        q.push(act(2)).expect("push");
        q.push(act(3)).expect("push");

        assert_eq!(q.pop().expect("pop").global_seqno, Some(Seqno::new(1)));
        assert_eq!(q.pop().expect("pop").global_seqno, Some(Seqno::new(2)));
        assert_eq!(q.pop().expect("pop").global_seqno, Some(Seqno::new(3)));
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(RecvQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };

        thread::sleep(Duration::from_millis(50));
        q.push(act(7)).expect("push");

        let got = consumer.join().expect("join").expect("act");
        assert_eq!(got.global_seqno, Some(Seqno::new(7)));
    }

    #[test]
    fn push_blocks_while_full_until_pop() {
        let q = Arc::new(RecvQueue::new(1));
        q.push(act(1)).expect("push");

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(act(2)))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.depth(), 1);
        assert!(q.pop().is_some());

        producer.join().expect("join").expect("push succeeded");
        assert_eq!(q.depth(), 1);
    }

    #[test]
    fn close_rejects_producers() {
        let q = RecvQueue::new(4);
        q.close();
        assert!(q.push(act(1)).is_err());
    }

    #[test]
    fn close_wakes_parked_consumer() {
        let q = Arc::new(RecvQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };

        thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(consumer.join().expect("join").is_none());
    }

    #[test]
    fn close_drains_remaining_entries_as_errors() {
        let q = RecvQueue::new(4);
        q.push(act(1)).expect("push");
        q.push(act(2)).expect("push");
        q.close();

        let first = q.pop().expect("entry");
        assert_eq!(first.kind, ActKind::Error);
        assert_eq!(first.local_seqno, Seqno::new(1));
        let second = q.pop().expect("entry");
        assert_eq!(second.kind, ActKind::Error);
        assert!(q.pop().is_none());
    }

    #[test]
    #[should_panic(expected = "queue capacity must be positive")]
    fn zero_capacity_panics() {
        let _ = RecvQueue::new(0);
    }
}
