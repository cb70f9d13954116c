//! Cold sequences
//!
//! A `Sequence` is a producer definition. Nothing runs until a collector
//! attaches, and every collector re-runs the producer from the start with
//! its own state. The producer is polled from inside the collector's
//! `poll_next`, so one emission is handed over per poll and the producer
//! stays suspended in `emit` until the collector asks for the next item.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use strand_core::error::{TaskError, TaskResult};

use crate::suspend::ensure_active;

type Producer<T> = dyn Fn(Emitter<T>) -> BoxFuture<'static, TaskResult<()>> + Send + Sync;

/// A restartable producer of `T`
pub struct Sequence<T> {
    producer: Arc<Producer<T>>,
}

impl<T> Clone for Sequence<T> {
    fn clone(&self) -> Self {
        Sequence {
            producer: Arc::clone(&self.producer),
        }
    }
}

/// Build a sequence from a producer block
///
/// ```ignore
/// let evens = sequence(|out| async move {
///     for i in 0..10 {
///         out.emit(i * 2).await?;
///     }
///     Ok(())
/// });
/// ```
pub fn sequence<T, F, Fut>(producer: F) -> Sequence<T>
where
    T: Send + 'static,
    F: Fn(Emitter<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
{
    Sequence {
        producer: Arc::new(move |emitter| producer(emitter).boxed()),
    }
}

/// Producer side of one collection
pub struct Emitter<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Emitter<T> {
    /// Hand `value` to the collector
    ///
    /// Completes once the collector has taken it. Also a cancellation
    /// point.
    pub fn emit(&self, value: T) -> Emit<'_, T> {
        Emit {
            emitter: self,
            value: Some(value),
        }
    }
}

/// Future returned by [`Emitter::emit`]
pub struct Emit<'a, T> {
    emitter: &'a Emitter<T>,
    value: Option<T>,
}

impl<T> Unpin for Emit<'_, T> {}

impl<T> Future for Emit<'_, T> {
    type Output = TaskResult<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.value.take() {
            Some(value) => {
                if let Err(err) = ensure_active() {
                    return Poll::Ready(Err(err));
                }
                *self.emitter.slot.lock() = Some(value);
                // The collector returns the value from this same poll
                Poll::Pending
            }
            None if self.emitter.slot.lock().is_some() => Poll::Pending,
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<T: Send + 'static> Sequence<T> {
    /// A sequence replaying the items of `items`
    pub fn from_vec(items: Vec<T>) -> Self
    where
        T: Clone + Sync,
    {
        let items = Arc::new(items);
        sequence(move |out| {
            let items = Arc::clone(&items);
            async move {
                for item in items.iter() {
                    out.emit(item.clone()).await?;
                }
                Ok(())
            }
        })
    }

    /// Start one collection
    pub fn into_stream(&self) -> SequenceStream<T> {
        let slot = Arc::new(Mutex::new(None));
        let producer = (self.producer)(Emitter {
            slot: Arc::clone(&slot),
        });
        SequenceStream {
            producer: Some(producer),
            slot,
        }
    }

    /// Run the producer, handing each item to `f`
    pub async fn collect<F>(&self, mut f: F) -> TaskResult<()>
    where
        F: FnMut(T),
    {
        let mut stream = self.into_stream();
        while let Some(item) = stream.next().await {
            f(item?);
        }
        Ok(())
    }

    pub async fn to_vec(&self) -> TaskResult<Vec<T>> {
        let mut out = Vec::new();
        self.collect(|item| out.push(item)).await?;
        Ok(out)
    }

    /// The first item; the producer is abandoned after it
    pub async fn first(&self) -> TaskResult<Option<T>> {
        let mut stream = self.into_stream();
        stream.next().await.transpose()
    }

    pub fn map<U, F>(&self, f: F) -> Sequence<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let f = Arc::new(f);
        sequence(move |out| {
            let upstream = upstream.clone();
            let f = Arc::clone(&f);
            async move {
                let mut items = upstream.into_stream();
                while let Some(item) = items.next().await {
                    out.emit(f(item?)).await?;
                }
                Ok(())
            }
        })
    }

    pub fn filter<F>(&self, predicate: F) -> Sequence<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let predicate = Arc::new(predicate);
        sequence(move |out| {
            let upstream = upstream.clone();
            let predicate = Arc::clone(&predicate);
            async move {
                let mut items = upstream.into_stream();
                while let Some(item) = items.next().await {
                    let item = item?;
                    if predicate(&item) {
                        out.emit(item).await?;
                    }
                }
                Ok(())
            }
        })
    }

    /// At most `n` items; upstream is not started when `n` is zero
    pub fn take(&self, n: usize) -> Sequence<T> {
        let upstream = self.clone();
        sequence(move |out| {
            let upstream = upstream.clone();
            async move {
                if n == 0 {
                    return Ok(());
                }
                let mut items = upstream.into_stream();
                let mut left = n;
                while let Some(item) = items.next().await {
                    out.emit(item?).await?;
                    left -= 1;
                    if left == 0 {
                        break;
                    }
                }
                Ok(())
            }
        })
    }

    pub fn on_each<F>(&self, action: F) -> Sequence<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let action = Arc::new(action);
        sequence(move |out| {
            let upstream = upstream.clone();
            let action = Arc::clone(&action);
            async move {
                let mut items = upstream.into_stream();
                while let Some(item) = items.next().await {
                    let item = item?;
                    action(&item);
                    out.emit(item).await?;
                }
                Ok(())
            }
        })
    }

    /// Run `action` after upstream finishes, with its error if it failed
    pub fn on_completion<F>(&self, action: F) -> Sequence<T>
    where
        F: Fn(Option<&TaskError>) + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let action = Arc::new(action);
        sequence(move |out| {
            let upstream = upstream.clone();
            let action = Arc::clone(&action);
            async move {
                let mut items = upstream.into_stream();
                let outcome: TaskResult<()> = async {
                    while let Some(item) = items.next().await {
                        out.emit(item?).await?;
                    }
                    Ok(())
                }
                .await;
                action(outcome.as_ref().err());
                outcome
            }
        })
    }
}

/// One running collection of a [`Sequence`]
pub struct SequenceStream<T> {
    producer: Option<BoxFuture<'static, TaskResult<()>>>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Stream for SequenceStream<T> {
    type Item = TaskResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let producer = match self.producer.as_mut() {
            Some(producer) => producer,
            None => return Poll::Ready(None),
        };
        match producer.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => {
                self.producer = None;
                Poll::Ready(self.slot.lock().take().map(Ok))
            }
            Poll::Ready(Err(err)) => {
                self.producer = None;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => match self.slot.lock().take() {
                Some(item) => Poll::Ready(Some(Ok(item))),
                None => Poll::Pending,
            },
        }
    }
}
