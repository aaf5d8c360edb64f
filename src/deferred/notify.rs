//! Iterative settlement notification.
//!
//! Settling a deferred must notify its descendants without recursing: a chain
//! of continuations can be arbitrarily long and most completions are
//! synchronous, so delivery runs through a thread-local breadth-first queue.
//! The first settlement on an otherwise-idle stack starts the pump; nested
//! settlements (a handler completing another deferred) only enqueue and
//! return, keeping stack depth independent of chain length.

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;

thread_local! {
    static QUEUE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static PUMPING: Cell<bool> = const { Cell::new(false) };
}

/// Queues a delivery task and drains the queue unless a drain is already in
/// progress further up the stack.
pub(crate) fn enqueue(task: Box<dyn FnOnce()>) {
    QUEUE.with(|q| q.borrow_mut().push_back(task));
    pump();
}

fn pump() {
    if PUMPING.with(Cell::get) {
        return;
    }
    PUMPING.with(|p| p.set(true));
    // Reset the flag even if a listener panics; queued deliveries that were
    // not reached will run on the next settlement.
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            PUMPING.with(|p| p.set(false));
        }
    }
    let _reset = Reset;

    while let Some(task) = QUEUE.with(|q| q.borrow_mut().pop_front()) {
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn nested_enqueue_is_flattened() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        let o2 = order.clone();
        enqueue(Box::new(move || {
            o1.borrow_mut().push("outer:start");
            let o = o1.clone();
            enqueue(Box::new(move || o.borrow_mut().push("inner")));
            o1.borrow_mut().push("outer:end");
        }));
        drop(o2);

        // The inner task ran after the outer one returned, not inside it.
        assert_eq!(*order.borrow(), vec!["outer:start", "outer:end", "inner"]);
    }

    #[test]
    fn deep_chains_do_not_grow_the_stack() {
        fn chain(depth: u32, hits: Rc<Cell<u32>>) {
            hits.set(hits.get() + 1);
            if depth > 0 {
                enqueue(Box::new(move || chain(depth - 1, hits)));
            }
        }
        let hits = Rc::new(Cell::new(0));
        chain(10_000, hits.clone());
        assert_eq!(hits.get(), 10_001);
    }
}
