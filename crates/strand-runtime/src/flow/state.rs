//! Hot state cell
//!
//! Always holds a value. Setting an equal value is a no-op, so observers
//! only see distinct values. Every new observer sees the current value
//! first. Stream subscribers are conflated: a slow subscriber skips
//! intermediate values and always wakes to the latest, and is never handed
//! the value it saw last again (1 -> 2 -> 1 between two polls yields
//! nothing).

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::stream::Stream;
use parking_lot::{Mutex, ReentrantMutex};
use strand_core::error::TaskResult;
use strand_core::kdebug;

use crate::context;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Cell<T> {
    value: T,
    version: u64,
    next_id: u64,
    subscribers: HashMap<u64, Option<Waker>>,
    listeners: Vec<(u64, Listener<T>)>,
}

struct Shared<T> {
    cell: Mutex<Cell<T>>,
    // Serializes listener callbacks so every listener sees commits in order
    emit: ReentrantMutex<()>,
}

/// Current-value cell with change notification
pub struct StateCell<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        StateCell {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> StateCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        StateCell {
            shared: Arc::new(Shared {
                cell: Mutex::new(Cell {
                    value: initial,
                    version: 0,
                    next_id: 0,
                    subscribers: HashMap::new(),
                    listeners: Vec::new(),
                }),
                emit: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn value(&self) -> T {
        self.shared.cell.lock().value.clone()
    }

    /// Store `value`; `false` if it equals the current one
    pub fn set(&self, value: T) -> bool {
        self.commit(|current| {
            if *current == value {
                None
            } else {
                Some(value)
            }
        })
    }

    /// Replace the value with `f(current)`
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        self.commit(|current| {
            let next = f(current);
            if next == *current {
                None
            } else {
                Some(next)
            }
        })
    }

    /// Set `new` only if the current value equals `expected`
    ///
    /// Returns `true` when the current value matched, even if `new` equals
    /// it and nothing was stored.
    pub fn compare_and_set(&self, expected: &T, new: T) -> bool {
        let mut matched = false;
        self.commit(|current| {
            if current != expected {
                return None;
            }
            matched = true;
            if *current == new {
                None
            } else {
                Some(new)
            }
        });
        matched
    }

    fn commit<F>(&self, decide: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let _emit = self.shared.emit.lock();
        let (value, wakers, listeners) = {
            let mut cell = self.shared.cell.lock();
            let next = match decide(&cell.value) {
                Some(next) => next,
                None => return false,
            };
            cell.value = next;
            cell.version += 1;
            let wakers: Vec<Waker> = cell
                .subscribers
                .values_mut()
                .filter_map(Option::take)
                .collect();
            let listeners: Vec<Listener<T>> =
                cell.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (cell.value.clone(), wakers, listeners)
        };
        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            listener(&value);
        }
        true
    }

    /// Stream of values, starting with the current one
    pub fn subscribe(&self) -> StateSubscription<T> {
        let mut cell = self.shared.cell.lock();
        let id = cell.next_id;
        cell.next_id += 1;
        cell.subscribers.insert(id, None);
        StateSubscription {
            shared: Arc::clone(&self.shared),
            id,
            seen: None,
            last: None,
            done: false,
        }
    }

    /// Call `f` with the current value now, then for every later change
    ///
    /// The listener stays attached until the returned handle is dropped.
    pub fn watch<F>(&self, f: F) -> WatchHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        // Held across the first call so no commit slips in before it
        let _emit = self.shared.emit.lock();
        let listener: Listener<T> = Arc::new(f);
        let (id, current) = {
            let mut cell = self.shared.cell.lock();
            let id = cell.next_id;
            cell.next_id += 1;
            cell.listeners.push((id, Arc::clone(&listener)));
            (id, cell.value.clone())
        };
        kdebug!("state cell: watcher {} attached", id);
        listener(&current);

        let weak = Arc::downgrade(&self.shared);
        WatchHandle {
            detach: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.cell.lock().listeners.retain(|(l, _)| *l != id);
                }
            })),
        }
    }

    /// Attached stream subscribers and watchers
    pub fn subscriber_count(&self) -> usize {
        let cell = self.shared.cell.lock();
        cell.subscribers.len() + cell.listeners.len()
    }
}

impl<T: fmt::Debug> fmt::Debug for StateCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.shared.cell.lock();
        f.debug_struct("StateCell")
            .field("value", &cell.value)
            .field("version", &cell.version)
            .finish()
    }
}

/// Detaches a [`StateCell::watch`] listener on drop
pub struct WatchHandle {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WatchHandle {
    /// Keep the listener attached for the life of the cell
    pub fn forget(mut self) {
        self.detach = None;
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Conflated stream over a [`StateCell`]
///
/// Never ends on its own. Inside a task it yields the job's cancellation
/// once and then ends.
pub struct StateSubscription<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    /// Version of the value last looked at
    seen: Option<u64>,
    /// Value last yielded
    last: Option<T>,
    done: bool,
}

impl<T> Unpin for StateSubscription<T> {}

impl<T: Clone + PartialEq> Stream for StateSubscription<T> {
    type Item = TaskResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(job) = context::current_job() {
            if let Some(err) = job.poll_cancelled(cx) {
                this.done = true;
                return Poll::Ready(Some(Err(err)));
            }
        }
        let mut cell = this.shared.cell.lock();
        if this.seen != Some(cell.version) {
            this.seen = Some(cell.version);
            if this.last.as_ref() != Some(&cell.value) {
                this.last = Some(cell.value.clone());
                return Poll::Ready(Some(Ok(cell.value.clone())));
            }
        }
        cell.subscribers.insert(this.id, Some(cx.waker().clone()));
        Poll::Pending
    }
}

impl<T> Drop for StateSubscription<T> {
    fn drop(&mut self) {
        self.shared.cell.lock().subscribers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestRuntime;
    use futures::executor::block_on;
    use futures::StreamExt;

    #[test]
    fn test_listener_sees_distinct_values() {
        let cell = StateCell::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let handle = cell.watch(move |v| s.lock().push(*v));

        for v in [1, 1, 2] {
            cell.set(v);
        }
        assert_eq!(*seen.lock(), vec![1, 2]);

        // Attached afterwards: sees the current value before returning
        let late_seen = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&late_seen);
        let late = cell.watch(move |v| l.lock().push(*v));
        assert_eq!(*late_seen.lock(), vec![2]);

        let mut sub = cell.subscribe();
        assert_eq!(block_on(sub.next()).unwrap().unwrap(), 2);
        assert_eq!(cell.subscriber_count(), 3);

        drop(handle);
        cell.set(3);
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(*late_seen.lock(), vec![2, 3]);
        drop(late);
        assert_eq!(cell.subscriber_count(), 1);
    }

    #[test]
    fn test_subscriber_skips_change_back_to_last_value() {
        let rt = TestRuntime::new();
        let cell = StateCell::new(1u32);
        let c = cell.clone();
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::clone(&got);
        rt.scope()
            .launch(move |_| async move {
                let mut sub = c.subscribe();
                while let Some(v) = sub.next().await {
                    g.lock().push(v?);
                }
                Ok(())
            })
            .unwrap();
        rt.run();
        assert_eq!(*got.lock(), vec![1]);

        // Back to 1 before the subscriber runs again
        cell.set(2);
        cell.set(1);
        rt.run();
        assert_eq!(*got.lock(), vec![1]);

        cell.set(3);
        rt.run();
        assert_eq!(*got.lock(), vec![1, 3]);
    }

    #[test]
    fn test_slow_subscriber_gets_latest() {
        let cell = StateCell::new("idle".to_string());
        let mut sub = cell.subscribe();
        assert_eq!(block_on(sub.next()).unwrap().unwrap(), "idle");
        cell.set("loading".to_string());
        cell.set("ready".to_string());
        assert_eq!(block_on(sub.next()).unwrap().unwrap(), "ready");
    }

    #[test]
    fn test_update_and_compare_and_set() {
        let cell = StateCell::new(10);
        assert!(cell.update(|v| v + 1));
        assert!(!cell.update(|v| *v));
        assert!(!cell.compare_and_set(&10, 20));
        assert!(cell.compare_and_set(&11, 20));
        assert!(cell.compare_and_set(&20, 20));
        assert_eq!(cell.value(), 20);
    }

    #[test]
    fn test_listener_may_set_reentrantly() {
        let cell = StateCell::new(0);
        let inner = cell.clone();
        cell.watch(move |v| {
            if *v == 1 {
                inner.set(2);
            }
        })
        .forget();
        cell.set(1);
        assert_eq!(cell.value(), 2);
    }

    #[test]
    fn test_subscriber_task_wakes_on_change() {
        let rt = TestRuntime::new();
        let cell = StateCell::new(0u32);
        let c = cell.clone();
        let d = rt
            .scope()
            .spawn(move |_| async move {
                let mut sub = c.subscribe();
                while let Some(v) = sub.next().await {
                    if v? >= 3 {
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .unwrap();
        rt.run();
        assert_eq!(cell.subscriber_count(), 1);
        cell.set(1);
        cell.set(3);
        rt.run();
        assert!(d.try_take().unwrap().unwrap());
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_task_cancelled() {
        let rt = TestRuntime::new();
        let cell = StateCell::new(0u32);
        let c = cell.clone();
        let d = rt
            .scope()
            .spawn(move |_| async move {
                let mut sub = c.subscribe();
                let mut last = 0;
                while let Some(v) = sub.next().await {
                    last = v?;
                }
                Ok(last)
            })
            .unwrap();
        rt.run();
        d.cancel();
        rt.run();
        assert!(d.is_cancelled());
        assert_eq!(cell.subscriber_count(), 0);
    }
}
