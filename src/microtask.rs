//! FIFO queue of microtasks drained at tick phase boundaries.
//!
//! Microtasks are plain closures with no registry presence: they cannot be
//! disabled, unreferenced or cancelled, and a non-empty queue keeps the loop
//! alive until it drains. A microtask enqueued while the queue is draining
//! runs within the same pass, so a microtask that re-enqueues itself starves
//! the rest of the tick.

use std::cell::RefCell;
use std::collections::VecDeque;

pub(crate) type Microtask = Box<dyn FnOnce()>;

/// Single-threaded FIFO queue of pending microtasks.
pub(crate) struct MicrotaskQueue {
    queue: RefCell<VecDeque<Microtask>>,
}

impl MicrotaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    /// Appends a microtask to the back of the queue.
    pub(crate) fn push(&self, task: Microtask) {
        self.queue.borrow_mut().push_back(task);
    }

    /// Removes and returns the oldest pending microtask.
    ///
    /// The internal borrow ends before this returns, so the caller can run
    /// the task while the queue accepts further pushes.
    pub(crate) fn pop(&self) -> Option<Microtask> {
        self.queue.borrow_mut().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.queue.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_drain_order_is_fifo() {
        let queue = MicrotaskQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            queue.push(Box::new(move || seen.borrow_mut().push(label)));
        }

        while let Some(task) = queue.pop() {
            task();
        }

        assert_eq!(*seen.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_pop_allows_reentrant_push() {
        let queue = Rc::new(MicrotaskQueue::new());
        let seen = Rc::new(RefCell::new(Vec::new()));

        {
            let queue = queue.clone();
            let seen = seen.clone();
            queue.clone().push(Box::new(move || {
                seen.borrow_mut().push("outer");
                let seen = seen.clone();
                queue.push(Box::new(move || seen.borrow_mut().push("inner")));
            }));
        }

        while let Some(task) = queue.pop() {
            task();
        }

        assert_eq!(*seen.borrow(), vec!["outer", "inner"]);
    }
}
