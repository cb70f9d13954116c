//! Suspending mutex
//!
//! `lock()` parks the task instead of the carrier thread, so the guard may
//! be held across suspension points. Release hands the lock directly to the
//! longest waiting task; the lock never becomes free while someone waits.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex as StateLock;
use strand_core::error::{ContractViolation, TaskError, TaskResult, TryLockError};
use strand_core::{ktrace, Continuation, Suspended, TaskId};

use crate::context;

struct Waiter {
    id: u64,
    task: Option<TaskId>,
    continuation: Continuation<()>,
}

struct LockState {
    locked: bool,
    owner: Option<TaskId>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

/// FIFO mutex for tasks
pub struct Mutex<T: ?Sized> {
    state: StateLock<LockState>,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            state: StateLock::new(LockState {
                locked: false,
                owner: None,
                waiters: VecDeque::new(),
                next_waiter: 0,
            }),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, suspending while another task holds it
    ///
    /// Locking again from the task that holds the lock would deadlock and
    /// fails with `ContractViolation::ReentrantLock`.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            waiting: None,
        }
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, TryLockError> {
        let me = context::current_task_id();
        let mut st = self.state.lock();
        if st.locked {
            if me.is_some() && st.owner == me {
                return Err(TryLockError::Reentrant);
            }
            return Err(TryLockError::Locked);
        }
        st.locked = true;
        st.owner = me;
        Ok(MutexGuard { mutex: self })
    }

    /// Run `f` while holding the lock
    pub async fn with_lock<R, F>(&self, f: F) -> TaskResult<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.lock().await?;
        Ok(f(&mut guard))
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of tasks suspended in `lock()`
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Pass the lock to the next waiter, or free it
    fn unlock(&self) {
        let next = {
            let mut st = self.state.lock();
            match st.waiters.pop_front() {
                Some(waiter) => {
                    st.owner = waiter.task;
                    Some(waiter)
                }
                None => {
                    st.locked = false;
                    st.owner = None;
                    None
                }
            }
        };
        // Resumed outside the state lock: an inline dispatcher may poll the
        // new owner right here.
        if let Some(waiter) = next {
            ktrace!("mutex handed to waiter {}", waiter.id);
            let _ = waiter.continuation.resume(());
        }
    }

    /// Leave the queue; `true` if the lock had already been handed over
    fn withdraw(&self, id: u64) -> bool {
        let mut st = self.state.lock();
        match st.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                st.waiters.remove(index);
                false
            }
            None => true,
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Mutex")
            .field("locked", &st.locked)
            .field("owner", &st.owner)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}

/// Future returned by [`Mutex::lock`]
pub struct Lock<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    waiting: Option<(u64, Suspended<()>)>,
}

impl<'a, T: ?Sized> Future for Lock<'a, T> {
    type Output = TaskResult<MutexGuard<'a, T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mutex = self.mutex;

        if let Some(job) = context::current_job() {
            if let Some(err) = job.poll_cancelled(cx) {
                if let Some((id, _)) = self.waiting.take() {
                    if mutex.withdraw(id) {
                        mutex.unlock();
                    }
                }
                return Poll::Ready(Err(err));
            }
        }

        if self.waiting.is_none() {
            let me = context::current_task_id();
            let mut st = mutex.state.lock();
            if !st.locked {
                st.locked = true;
                st.owner = me;
                return Poll::Ready(Ok(MutexGuard { mutex }));
            }
            if me.is_some() && st.owner == me {
                return Poll::Ready(Err(TaskError::Contract(ContractViolation::ReentrantLock)));
            }
            let id = st.next_waiter;
            st.next_waiter += 1;
            let (continuation, suspended) = Continuation::new();
            st.waiters.push_back(Waiter {
                id,
                task: me,
                continuation,
            });
            drop(st);
            self.waiting = Some((id, suspended));
        }

        let polled = match self.waiting.as_mut() {
            Some((_, suspended)) => Pin::new(suspended).poll(cx),
            None => return Poll::Pending,
        };
        match polled {
            Poll::Ready(Ok(())) => {
                self.waiting = None;
                Poll::Ready(Ok(MutexGuard { mutex }))
            }
            Poll::Ready(Err(err)) => {
                if let Some((id, _)) = self.waiting.take() {
                    if mutex.withdraw(id) {
                        mutex.unlock();
                    }
                }
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: ?Sized> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        if let Some((id, _)) = self.waiting.take() {
            if self.mutex.withdraw(id) {
                self.mutex.unlock();
            }
        }
    }
}

/// Holds the lock; release happens on drop
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard is the only holder of the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard is the only holder of the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
