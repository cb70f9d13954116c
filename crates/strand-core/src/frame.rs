//! Explicit label/frame state machines
//!
//! `async fn` bodies already compile to a state machine whose frame lives in
//! the task's heap allocation. This module exposes the same shape by hand for
//! code that wants to own its resumption points directly:
//!
//! - [`Frame`] holds the current label and the locals that survive a
//!   suspension.
//! - [`StateMachine::resume`] dispatches on the label and returns a [`Step`].
//! - [`Machine`] drives a state machine as a `Future`.
//!
//! A machine that returns `Step::Suspend(next)` must have registered the
//! waker in `cx` with whatever it is waiting on. It is re-entered at `next`
//! each time it is woken; a label that finds its resource still pending
//! simply suspends at the same label again.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;

/// Per-invocation frame: resume label plus live locals
#[derive(Debug, Default)]
pub struct Frame<L> {
    pub label: u32,
    pub locals: L,
}

impl<L> Frame<L> {
    pub fn new(locals: L) -> Self {
        Frame { label: 0, locals }
    }
}

/// Outcome of one `resume` call
#[derive(Debug, PartialEq, Eq)]
pub enum Step<T> {
    /// Suspended; re-enter at this label when woken
    Suspend(u32),

    /// Continue at this label without suspending
    Jump(u32),

    /// Finished with a value
    Return(T),
}

/// A hand-written suspendable computation
pub trait StateMachine {
    type Locals;
    type Output;

    fn resume(&mut self, frame: &mut Frame<Self::Locals>, cx: &mut Context<'_>) -> Step<Self::Output>;
}

/// Result of driving a machine without an executor
#[derive(Debug, PartialEq, Eq)]
pub enum Resume<T> {
    /// Completed without suspending (or after its last suspension)
    Ready(T),

    /// Parked at a suspension point
    Suspended,
}

/// Adapter that runs a `StateMachine` as a `Future`
pub struct Machine<M: StateMachine> {
    machine: M,
    frame: Frame<M::Locals>,
    suspensions: u32,
    done: bool,
}

impl<M: StateMachine> Machine<M> {
    pub fn new(machine: M, locals: M::Locals) -> Self {
        Machine {
            machine,
            frame: Frame::new(locals),
            suspensions: 0,
            done: false,
        }
    }

    /// Number of times the machine has suspended so far
    pub fn suspensions(&self) -> u32 {
        self.suspensions
    }

    /// Current resume label
    pub fn label(&self) -> u32 {
        self.frame.label
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn frame(&self) -> &Frame<M::Locals> {
        &self.frame
    }

    fn step(&mut self, cx: &mut Context<'_>) -> Poll<M::Output> {
        assert!(!self.done, "Machine resumed after it returned");
        loop {
            match self.machine.resume(&mut self.frame, cx) {
                Step::Jump(label) => self.frame.label = label,
                Step::Suspend(label) => {
                    self.frame.label = label;
                    self.suspensions += 1;
                    return Poll::Pending;
                }
                Step::Return(value) => {
                    self.done = true;
                    return Poll::Ready(value);
                }
            }
        }
    }

    /// Run on the calling thread until the machine suspends or returns
    ///
    /// A machine that never suspends yields its value synchronously. After
    /// `Resume::Suspended`, the machine can still be awaited or driven
    /// again once its resource completes.
    pub fn run_until_suspended(&mut self) -> Resume<M::Output> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.step(&mut cx) {
            Poll::Ready(value) => Resume::Ready(value),
            Poll::Pending => Resume::Suspended,
        }
    }
}

impl<M> Future for Machine<M>
where
    M: StateMachine + Unpin,
    M::Locals: Unpin,
{
    type Output = M::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().step(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::{Continuation, Suspended};
    use std::sync::{Arc, Mutex};

    /// Sums three values, each delivered through its own continuation
    struct Summer {
        pending: Arc<Mutex<Vec<Continuation<u32>>>>,
    }

    #[derive(Default)]
    struct SumLocals {
        total: u32,
        received: u32,
        waiting: Option<Suspended<u32>>,
    }

    impl StateMachine for Summer {
        type Locals = SumLocals;
        type Output = u32;

        fn resume(&mut self, frame: &mut Frame<SumLocals>, cx: &mut Context<'_>) -> Step<u32> {
            match frame.label {
                0 => {
                    let (k, s) = Continuation::new();
                    self.pending.lock().unwrap().push(k);
                    frame.locals.waiting = Some(s);
                    Step::Jump(1)
                }
                1 => {
                    let waiting = match frame.locals.waiting.as_mut() {
                        Some(w) => w,
                        None => return Step::Jump(0),
                    };
                    match Pin::new(waiting).poll(cx) {
                        Poll::Pending => Step::Suspend(1),
                        Poll::Ready(v) => {
                            frame.locals.waiting = None;
                            frame.locals.total += v.unwrap_or(0);
                            frame.locals.received += 1;
                            if frame.locals.received == 3 {
                                Step::Return(frame.locals.total)
                            } else {
                                Step::Jump(0)
                            }
                        }
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    struct Immediate;

    impl StateMachine for Immediate {
        type Locals = ();
        type Output = &'static str;

        fn resume(&mut self, _frame: &mut Frame<()>, _cx: &mut Context<'_>) -> Step<&'static str> {
            Step::Return("now")
        }
    }

    #[test]
    fn test_non_suspending_returns_synchronously() {
        let mut m = Machine::new(Immediate, ());
        assert_eq!(m.run_until_suspended(), Resume::Ready("now"));
        assert_eq!(m.suspensions(), 0);
        assert!(m.is_done());
    }

    #[test]
    fn test_resumes_at_stored_label_with_locals() {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let mut m = Machine::new(
            Summer {
                pending: Arc::clone(&pending),
            },
            SumLocals::default(),
        );

        assert_eq!(m.run_until_suspended(), Resume::Suspended);
        for (i, v) in [10u32, 20].into_iter().enumerate() {
            let k = pending.lock().unwrap().pop().unwrap();
            k.resume(v).unwrap();
            assert_eq!(m.run_until_suspended(), Resume::Suspended);
            assert_eq!(m.label(), 1);
            assert_eq!(m.suspensions(), i as u32 + 2);
        }
        // Locals survived both suspensions
        assert_eq!(m.frame().locals.total, 30);
        assert_eq!(m.frame().locals.received, 2);

        let k = pending.lock().unwrap().pop().unwrap();
        k.resume(30).unwrap();
        assert_eq!(m.run_until_suspended(), Resume::Ready(60));
        assert!(k.resume(1).is_err());
    }

    #[test]
    fn test_machine_as_future() {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let m = Machine::new(
            Summer {
                pending: Arc::clone(&pending),
            },
            SumLocals::default(),
        );
        let feeder = {
            let pending = Arc::clone(&pending);
            std::thread::spawn(move || {
                let mut sent = 0;
                while sent < 3 {
                    let k = pending.lock().unwrap().pop();
                    match k {
                        Some(k) => {
                            k.resume(sent + 1).unwrap();
                            sent += 1;
                        }
                        None => std::thread::yield_now(),
                    }
                }
            })
        };
        assert_eq!(futures::executor::block_on(m), 6);
        feeder.join().unwrap();
    }
}
