//! Bounded FIFO of fully established connections awaiting `accept`.
//!
//! The queue pairs a `parking_lot` mutex over a `VecDeque` with a
//! [`tokio::sync::Notify`] for async integration. Producers hand one waiter
//! the baton per connection they enqueue; a consumer that leaves items behind
//! passes it on, so concurrent acceptors are woken one at a time.
//!
//! # Usage
//!
//! ```ignore
//! let queue = AcceptQueue::new(16);
//! queue.enqueue(conn)?;
//!
//! let conn = queue.dequeue_blocking(Some(Duration::from_secs(5)), std::future::pending()).await?;
//! ```

use std::{collections::VecDeque, future::Future, time::Duration};

use parking_lot::{Mutex, MutexGuard};
use tokio::{sync::Notify, time::Instant};

use crate::errors::{AcceptError, EnqueueError};

struct QueueState<C> {
    backlog: VecDeque<C>,
    max_len: usize,
    closed: bool,
}

pub struct AcceptQueue<C> {
    state: Mutex<QueueState<C>>,
    /// Signalled once per enqueued connection, and on close.
    available: Notify,
}

impl<C> AcceptQueue<C> {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                backlog: VecDeque::with_capacity(max_len.min(1024)),
                max_len,
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Appends `conn` at the tail unless the queue is full or closed.
    pub fn enqueue(&self, conn: C) -> Result<(), EnqueueError<C>> {
        match self.reserve() {
            Ok(slot) => {
                slot.push(conn);
                Ok(())
            }
            Err(EnqueueError::Full(())) => Err(EnqueueError::Full(conn)),
            Err(EnqueueError::Closed(())) => Err(EnqueueError::Closed(conn)),
        }
    }

    /// Locks the queue with room for one more connection, so a producer can
    /// commit to enqueueing before building the connection.
    pub fn reserve(&self) -> Result<Reservation<'_, C>, EnqueueError<()>> {
        let state = self.state.lock();
        if state.closed {
            return Err(EnqueueError::Closed(()));
        }
        if state.backlog.len() >= state.max_len {
            return Err(EnqueueError::Full(()));
        }
        Ok(Reservation { queue: self, state })
    }

    /// Pops the head without waiting.
    #[inline]
    pub fn try_dequeue(&self) -> Option<C> {
        self.state.lock().backlog.pop_front()
    }

    /// Waits for a connection.
    ///
    /// Gives up with [`AcceptError::TimedOut`] once `timeout` elapses (`None`
    /// waits forever), with [`AcceptError::Interrupted`] when `interrupt`
    /// completes, and with [`AcceptError::NotListening`] when the queue is
    /// closed. The queue is checked once more before reporting a timeout or
    /// an interruption.
    pub async fn dequeue_blocking<F>(
        &self,
        timeout: Option<Duration>,
        interrupt: F,
    ) -> Result<C, AcceptError>
    where
        F: Future<Output = ()>,
    {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        tokio::pin!(interrupt);
        loop {
            // Register before checking so an enqueue in between is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.take_ready() {
                return result;
            }

            tokio::select! {
                biased;
                () = &mut notified => {}
                () = &mut interrupt => {
                    return self.take_ready().unwrap_or(Err(AcceptError::Interrupted));
                }
                () = sleep_until(deadline) => {
                    return self.take_ready().unwrap_or(Err(AcceptError::TimedOut));
                }
            }
        }
    }

    fn take_ready(&self) -> Option<Result<C, AcceptError>> {
        let mut state = self.state.lock();
        if let Some(conn) = state.backlog.pop_front() {
            if !state.backlog.is_empty() {
                self.available.notify_one();
            }
            return Some(Ok(conn));
        }
        if state.closed {
            return Some(Err(AcceptError::NotListening));
        }
        None
    }

    /// Takes every queued connection, leaving the queue open.
    pub fn drain(&self) -> std::collections::vec_deque::IntoIter<C> {
        std::mem::take(&mut self.state.lock().backlog).into_iter()
    }

    /// Refuses further connections, wakes every waiter and returns whatever
    /// was still queued.
    pub fn close(&self) -> std::collections::vec_deque::IntoIter<C> {
        let remaining = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.backlog)
        };
        self.available.notify_waiters();
        remaining.into_iter()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_len(&self) -> usize {
        self.state.lock().max_len
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.backlog.len() >= state.max_len
    }
}

/// Room for one connection, held until [`Reservation::push`] or drop.
pub struct Reservation<'a, C> {
    queue: &'a AcceptQueue<C>,
    state: MutexGuard<'a, QueueState<C>>,
}

impl<C> Reservation<'_, C> {
    pub fn push(self, conn: C) {
        let Reservation { queue, mut state } = self;
        state.backlog.push_back(conn);
        drop(state);
        queue.available.notify_one();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<C> std::fmt::Debug for AcceptQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AcceptQueue")
            .field("len", &state.backlog.len())
            .field("max_len", &state.max_len)
            .field("closed", &state.closed)
            .finish()
    }
}
