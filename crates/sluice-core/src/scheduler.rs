//! Deferred-task queue.
//!
//! The engine is cooperative: a filter's `process` runs to completion
//! before anything else happens. Work that must not run re-entrantly
//! (recycling a pipeline from inside its own filter chain, restarting
//! a replay) is deferred here and drained by the embedding runtime at
//! the
//! next suspension point. Tests drain explicitly.

use std::cell::RefCell;
use std::collections::VecDeque;

thread_local! {
    static TASKS: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
}

/// Queues `task` to run at the next [`drain`].
pub fn defer(task: impl FnOnce() + 'static) {
    TASKS.with(|t| t.borrow_mut().push_back(Box::new(task)));
}

/// Runs every task queued so far, including tasks queued by the tasks
/// themselves. Returns the number of tasks run.
pub fn drain() -> usize {
    let mut count = 0;
    loop {
        let task = TASKS.with(|t| t.borrow_mut().pop_front());
        match task {
            Some(task) => {
                task();
                count += 1;
            }
            None => return count,
        }
    }
}

/// Number of tasks currently queued.
#[must_use]
pub fn pending() -> usize {
    TASKS.with(|t| t.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_defer_then_drain() {
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        defer(move || h.set(h.get() + 1));
        assert_eq!(drain(), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(drain(), 0);
    }

    #[test]
    fn test_tasks_queued_during_drain_also_run() {
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        defer(move || {
            let h2 = h.clone();
            defer(move || h2.set(h2.get() + 1));
            h.set(h.get() + 1);
        });
        assert_eq!(drain(), 2);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let o = order.clone();
            defer(move || o.borrow_mut().push(i));
        }
        drain();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
