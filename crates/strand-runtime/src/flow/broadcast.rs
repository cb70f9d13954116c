//! Hot broadcast
//!
//! Every emission is appended to one shared buffer under a lock, so all
//! subscribers see the same order and an emission is never split by a
//! later one. Each subscriber keeps a cursor into the buffer; the buffer
//! keeps what the slowest subscriber still needs plus the replay window.
//!
//! ```text
//!   head                 replay start               tail
//!    │ consumed by some   │ replay window            │
//!    ▼                    ▼                          ▼
//!   [ a  b  c  d  e  f  g  h ]
//!        ▲ slowest        ▲ fastest subscriber cursor
//! ```
//!
//! When the slowest subscriber is more than `replay + extra_capacity`
//! items behind, the overflow policy applies: `Suspend` parks the emitter
//! until it catches up, `DropOldest` moves slow cursors forward, and
//! `DropLatest` discards the new value.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::stream::Stream;
use parking_lot::Mutex;
use strand_core::error::{ConfigError, TaskResult, TryEmitError};
use strand_core::ktrace;

use crate::context;

/// What `emit` does when a subscriber falls too far behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    #[default]
    Suspend,
    DropOldest,
    DropLatest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastConfig {
    /// Items handed to a new subscriber on attach
    pub replay: usize,
    /// Extra buffer for slow subscribers beyond the replay window
    pub extra_capacity: usize,
    pub overflow: Overflow,
}

impl BroadcastConfig {
    pub fn replay(mut self, n: usize) -> Self {
        self.replay = n;
        self
    }

    pub fn extra_capacity(mut self, n: usize) -> Self {
        self.extra_capacity = n;
        self
    }

    pub fn overflow(mut self, policy: Overflow) -> Self {
        self.overflow = policy;
        self
    }

    fn capacity(&self) -> usize {
        self.replay + self.extra_capacity
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.overflow != Overflow::Suspend && self.capacity() == 0 {
            return Err(ConfigError::InvalidValue(
                "broadcast: drop policies need replay + extra_capacity > 0",
            ));
        }
        Ok(())
    }
}

struct Cursor {
    next: u64,
    waker: Option<Waker>,
}

struct Buffer<T> {
    items: VecDeque<T>,
    // Absolute index of items[0]
    head: u64,
    // Items before this index are no longer replayed
    replay_floor: u64,
    next_id: u64,
    subscribers: HashMap<u64, Cursor>,
    emitters: Vec<Waker>,
}

impl<T> Buffer<T> {
    fn tail(&self) -> u64 {
        self.head + self.items.len() as u64
    }

    fn replay_start(&self, replay: usize) -> u64 {
        self.tail()
            .saturating_sub(replay as u64)
            .max(self.replay_floor)
            .max(self.head)
    }

    fn slowest(&self) -> u64 {
        self.subscribers
            .values()
            .map(|c| c.next)
            .min()
            .unwrap_or_else(|| self.tail())
    }

    /// Drop what no subscriber and no replay needs
    fn trim(&mut self, replay: usize) {
        let keep_from = self.slowest().min(self.replay_start(replay));
        while self.head < keep_from {
            self.items.pop_front();
            self.head += 1;
        }
    }

    fn take_subscriber_wakers(&mut self) -> Vec<Waker> {
        self.subscribers
            .values_mut()
            .filter_map(|c| c.waker.take())
            .collect()
    }
}

struct Shared<T> {
    config: BroadcastConfig,
    buffer: Mutex<Buffer<T>>,
}

/// Multi-subscriber hot stream
pub struct Broadcast<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Broadcast {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum Accepted {
    Done,
    Wait(u64),
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    pub fn new(config: BroadcastConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Broadcast {
            shared: Arc::new(Shared {
                config,
                buffer: Mutex::new(Buffer {
                    items: VecDeque::new(),
                    head: 0,
                    replay_floor: 0,
                    next_id: 0,
                    subscribers: HashMap::new(),
                    emitters: Vec::new(),
                }),
            }),
        })
    }

    pub fn config(&self) -> BroadcastConfig {
        self.shared.config
    }

    /// Broadcast `value`
    ///
    /// Under `Suspend` this waits until the slowest subscriber is within
    /// capacity of the value. With zero capacity that means every subscriber
    /// attached at emission time has received it. The value is already
    /// visible to subscribers when the wait starts; cancelling the wait does
    /// not withdraw it.
    pub fn emit(&self, value: T) -> Emit<T> {
        let index = match self.push(value, false) {
            Ok(Accepted::Wait(index)) => Some(index),
            _ => None,
        };
        Emit {
            shared: Arc::clone(&self.shared),
            index,
        }
    }

    /// Broadcast without waiting
    ///
    /// Fails only under `Suspend` when a subscriber is too far behind.
    pub fn try_emit(&self, value: T) -> Result<(), TryEmitError<T>> {
        self.push(value, true).map(|_| ())
    }

    fn push(&self, value: T, no_wait: bool) -> Result<Accepted, TryEmitError<T>> {
        let config = &self.shared.config;
        let capacity = config.capacity() as u64;
        let (accepted, wakers) = {
            let mut buf = self.shared.buffer.lock();
            let behind = buf.tail() - buf.slowest();
            let full = !buf.subscribers.is_empty() && behind >= capacity;
            if full {
                match config.overflow {
                    Overflow::Suspend if no_wait => return Err(TryEmitError(value)),
                    Overflow::DropLatest => {
                        ktrace!("broadcast: dropped latest value");
                        return Ok(Accepted::Done);
                    }
                    Overflow::Suspend | Overflow::DropOldest => {}
                }
            }

            let index = buf.tail();
            buf.items.push_back(value);

            if full && config.overflow == Overflow::DropOldest {
                let floor = buf.tail() - capacity;
                for cursor in buf.subscribers.values_mut() {
                    if cursor.next < floor {
                        cursor.next = floor;
                    }
                }
            }
            buf.trim(config.replay);

            let accepted = if config.overflow == Overflow::Suspend
                && !buf.subscribers.is_empty()
                && index >= buf.slowest() + capacity
            {
                Accepted::Wait(index)
            } else {
                Accepted::Done
            };
            (accepted, buf.take_subscriber_wakers())
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(accepted)
    }

    pub fn subscribe(&self) -> BroadcastSubscription<T> {
        let mut buf = self.shared.buffer.lock();
        let id = buf.next_id;
        buf.next_id += 1;
        let next = buf.replay_start(self.shared.config.replay);
        buf.subscribers.insert(id, Cursor { next, waker: None });
        BroadcastSubscription {
            shared: Arc::clone(&self.shared),
            id,
            done: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.buffer.lock().subscribers.len()
    }

    /// Items a new subscriber would receive first
    pub fn replay_cache(&self) -> Vec<T> {
        let buf = self.shared.buffer.lock();
        let start = (buf.replay_start(self.shared.config.replay) - buf.head) as usize;
        buf.items.iter().skip(start).cloned().collect()
    }

    /// Forget the replay window; attached subscribers are not affected
    pub fn reset_replay_cache(&self) {
        let mut buf = self.shared.buffer.lock();
        buf.replay_floor = buf.tail();
        buf.trim(self.shared.config.replay);
    }
}

impl<T> fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buf = self.shared.buffer.lock();
        f.debug_struct("Broadcast")
            .field("config", &self.shared.config)
            .field("buffered", &buf.items.len())
            .field("subscribers", &buf.subscribers.len())
            .finish()
    }
}

/// Future returned by [`Broadcast::emit`]
pub struct Emit<T> {
    shared: Arc<Shared<T>>,
    index: Option<u64>,
}

impl<T> Future for Emit<T> {
    type Output = TaskResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let index = match self.index {
            Some(index) => index,
            None => return Poll::Ready(Ok(())),
        };
        if let Some(job) = context::current_job() {
            if let Some(err) = job.poll_cancelled(cx) {
                self.index = None;
                return Poll::Ready(Err(err));
            }
        }
        let capacity = self.shared.config.capacity() as u64;
        let mut buf = self.shared.buffer.lock();
        if index < buf.slowest() + capacity {
            drop(buf);
            self.index = None;
            return Poll::Ready(Ok(()));
        }
        buf.emitters.push(cx.waker().clone());
        Poll::Pending
    }
}

/// One subscriber's view of a [`Broadcast`]
///
/// Never ends on its own. Inside a task it yields the job's cancellation
/// once and then ends.
pub struct BroadcastSubscription<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    done: bool,
}

impl<T: Clone> Stream for BroadcastSubscription<T> {
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

        let replay = this.shared.config.replay;
        let (item, emitters) = {
            let mut buf = this.shared.buffer.lock();
            let head = buf.head;
            let tail = buf.tail();
            let cursor = match buf.subscribers.get_mut(&this.id) {
                Some(cursor) => cursor,
                None => return Poll::Ready(None),
            };
            if cursor.next < head {
                cursor.next = head;
            }
            if cursor.next == tail {
                cursor.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let at = (cursor.next - head) as usize;
            cursor.next += 1;
            let item = buf.items[at].clone();
            buf.trim(replay);
            (item, std::mem::take(&mut buf.emitters))
        };
        for waker in emitters {
            waker.wake();
        }
        Poll::Ready(Some(Ok(item)))
    }
}

impl<T> Drop for BroadcastSubscription<T> {
    fn drop(&mut self) {
        let emitters = {
            let mut buf = self.shared.buffer.lock();
            buf.subscribers.remove(&self.id);
            buf.trim(self.shared.config.replay);
            std::mem::take(&mut buf.emitters)
        };
        for waker in emitters {
            waker.wake();
        }
    }
}
