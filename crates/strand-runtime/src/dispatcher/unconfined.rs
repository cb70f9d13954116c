//! Unconfined dispatch and the per-thread inline loop
//!
//! Inline execution would recurse without bound when a task resumed inline
//! resumes another one inline, and so on. Each thread therefore keeps a
//! small queue: the outermost inline call drains it, nested calls only
//! enqueue. A panicking runnable does not strand the ones queued behind
//! it; the first panic is re-raised once the queue is empty.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use super::{Dispatcher, Runnable};

thread_local! {
    /// `Some` while this thread is draining its inline queue
    static INLINE: RefCell<Option<VecDeque<Runnable>>> = const { RefCell::new(None) };
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        INLINE.with(|q| *q.borrow_mut() = None);
    }
}

/// Run on the calling thread, queued behind any inline work already running
pub fn run_inline(runnable: Runnable) {
    let nested = INLINE.with(|q| {
        let mut q = q.borrow_mut();
        match q.as_mut() {
            Some(pending) => {
                pending.push_back(runnable);
                None
            }
            None => {
                *q = Some(VecDeque::new());
                Some(runnable)
            }
        }
    });
    let first = match nested {
        Some(r) => r,
        None => return,
    };

    let guard = DrainGuard;
    let mut panic = catch_unwind(AssertUnwindSafe(|| first.run())).err();
    while let Some(next) = INLINE.with(|q| q.borrow_mut().as_mut().and_then(|p| p.pop_front())) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| next.run())) {
            panic.get_or_insert(payload);
        }
    }
    drop(guard);
    if let Some(payload) = panic {
        resume_unwind(payload);
    }
}

/// Runs each resumption on whatever thread performs it
///
/// The first leg of a launched task runs synchronously inside `launch`.
/// Intended for tests; production code should pick a confined or pool
/// dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfined;

impl Dispatcher for Unconfined {
    fn dispatch(&self, runnable: Runnable) {
        run_inline(runnable);
    }

    fn is_dispatch_needed(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "unconfined"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_nested_inline_is_queued_not_recursive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        run_inline(Runnable::new(move || {
            l1.lock().unwrap().push("outer start");
            let l2 = Arc::clone(&l1);
            run_inline(Runnable::new(move || l2.lock().unwrap().push("nested")));
            l1.lock().unwrap().push("outer end");
        }));
        assert_eq!(*log.lock().unwrap(), vec!["outer start", "outer end", "nested"]);
    }

    #[test]
    fn test_unconfined_runs_synchronously() {
        let hit = Arc::new(Mutex::new(false));
        let h = Arc::clone(&hit);
        assert!(!Unconfined.is_dispatch_needed());
        Unconfined.dispatch(Runnable::new(move || *h.lock().unwrap() = true));
        assert!(*hit.lock().unwrap());
    }

    #[test]
    fn test_panic_keeps_queued_runnables() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let r = std::panic::catch_unwind(move || {
            run_inline(Runnable::new(move || {
                let l2 = Arc::clone(&l1);
                run_inline(Runnable::new(move || l2.lock().unwrap().push("nested")));
                let l3 = Arc::clone(&l1);
                run_inline(Runnable::new(move || l3.lock().unwrap().push("second")));
                panic!("outer boom");
            }));
        });
        assert!(r.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["nested", "second"]);
    }

    #[test]
    fn test_panic_resets_inline_state() {
        let r = std::panic::catch_unwind(|| {
            run_inline(Runnable::new(|| panic!("inline boom")));
        });
        assert!(r.is_err());
        let hit = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hit);
        run_inline(Runnable::new(move || *h.lock().unwrap() += 1));
        assert_eq!(*hit.lock().unwrap(), 1);
    }
}
