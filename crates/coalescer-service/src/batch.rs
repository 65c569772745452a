//! Time-window batching with priority ordering.
//!
//! The scheduler only decides *which* requests leave the window and *when* a timer has to be
//! armed. Spawning the timer and dispatching the batch is up to the
//! [`Coalescer`](crate::Coalescer), which owns the scheduler behind its state lock.

use std::time::Duration;

use tokio::task::AbortHandle;

use crate::types::{Priority, RequestId};

/// What the caller has to do after [`BatchScheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// This request opened a new window. A timer for the given generation has to be spawned
    /// and handed to [`BatchScheduler::attach_timer`].
    ArmTimer(u64),
    /// The window is full, or windows are disabled. The batch has to be closed right away.
    Full,
    /// The request waits for the already running timer.
    Queued,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    seq: u64,
    id: RequestId,
    priority: Priority,
}

#[derive(Debug, Default)]
struct Timer {
    generation: u64,
    handle: Option<AbortHandle>,
}

#[derive(Debug)]
pub struct BatchScheduler {
    max_batch_size: usize,
    window: Duration,
    pending: Vec<Pending>,
    next_seq: u64,
    next_generation: u64,
    /// The currently armed timer, if any.
    timer: Option<Timer>,
}

impl BatchScheduler {
    pub fn new(max_batch_size: usize, window: Duration) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            window,
            pending: Vec::new(),
            next_seq: 0,
            next_generation: 0,
            timer: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn enqueue(&mut self, id: RequestId, priority: Priority) -> Enqueued {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending { seq, id, priority });

        if self.window.is_zero() || self.pending.len() >= self.max_batch_size {
            Enqueued::Full
        } else if self.timer.is_some() {
            Enqueued::Queued
        } else {
            Enqueued::ArmTimer(self.start_timer())
        }
    }

    /// Arms a timer for the remaining requests, unless there are none or a timer is running.
    pub fn arm(&mut self) -> Option<u64> {
        if self.pending.is_empty() || self.timer.is_some() {
            return None;
        }
        Some(self.start_timer())
    }

    /// Associates a spawned timer task with its generation.
    ///
    /// If the window was closed in the meantime the timer is stale and gets aborted.
    pub fn attach_timer(&mut self, generation: u64, handle: AbortHandle) {
        match &mut self.timer {
            Some(timer) if timer.generation == generation => timer.handle = Some(handle),
            _ => handle.abort(),
        }
    }

    /// Called by a timer task once its window elapsed.
    ///
    /// Returns `false` if the timer is stale, in which case nothing should be flushed.
    pub fn timer_fired(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation == generation => {
                self.timer = None;
                true
            }
            _ => false,
        }
    }

    /// Aborts the running timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            if let Some(handle) = timer.handle {
                handle.abort();
            }
        }
    }

    /// Closes the current window, returning the requests to dispatch in priority order.
    ///
    /// At most `max_batch_size` requests are returned. The rest stay queued in arrival order,
    /// and the caller should [`arm`](Self::arm) a new window for them.
    pub fn close(&mut self) -> Vec<RequestId> {
        self.cancel_timer();

        let mut batch = std::mem::take(&mut self.pending);
        // sorting by `seq` as well keeps the order stable by arrival
        batch.sort_unstable_by_key(|pending| (pending.priority, pending.seq));

        let rest = batch.split_off(batch.len().min(self.max_batch_size));
        self.pending = rest;
        self.pending.sort_unstable_by_key(|pending| pending.seq);

        batch.into_iter().map(|pending| pending.id).collect()
    }

    /// Removes a request that has not been dispatched yet.
    ///
    /// The timer is cancelled when this empties the window.
    pub fn remove(&mut self, id: RequestId) -> bool {
        let Some(idx) = self.pending.iter().position(|pending| pending.id == id) else {
            return false;
        };
        self.pending.remove(idx);
        if self.pending.is_empty() {
            self.cancel_timer();
        }
        true
    }

    /// Drops all queued requests and the timer, returning the dropped requests.
    #[cfg(test)]
    pub fn clear(&mut self) -> Vec<RequestId> {
        self.cancel_timer();
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|pending| pending.id)
            .collect()
    }

    #[cfg(test)]
    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.iter().any(|pending| pending.id == id)
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn start_timer(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.timer = Some(Timer {
            generation,
            handle: None,
        });
        generation
    }
}
