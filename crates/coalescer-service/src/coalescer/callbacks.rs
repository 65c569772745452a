use std::fmt;
use std::sync::Arc;

use crate::error::CoalescerError;
use crate::types::{RequestBatch, TrackedRequest};

pub type RequestCallback = Arc<dyn Fn(&TrackedRequest) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&TrackedRequest, &CoalescerError) + Send + Sync>;
pub type BatchCallback = Arc<dyn Fn(&RequestBatch) + Send + Sync>;
pub type QueueCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Observer hooks, invoked without holding any internal lock.
///
/// Hooks must not block. They may call back into the [`Coalescer`](crate::Coalescer).
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_request_start: Option<RequestCallback>,
    pub on_request_complete: Option<RequestCallback>,
    /// Called for failed and for cancelled requests.
    pub on_request_error: Option<ErrorCallback>,
    pub on_batch_start: Option<BatchCallback>,
    /// Called with the final state of every request of the batch.
    pub on_batch_complete: Option<BatchCallback>,
    /// Called with the new length whenever the offline queue grows or shrinks.
    pub on_offline_queue_change: Option<QueueCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_request_start", &self.on_request_start.is_some())
            .field("on_request_complete", &self.on_request_complete.is_some())
            .field("on_request_error", &self.on_request_error.is_some())
            .field("on_batch_start", &self.on_batch_start.is_some())
            .field("on_batch_complete", &self.on_batch_complete.is_some())
            .field(
                "on_offline_queue_change",
                &self.on_offline_queue_change.is_some(),
            )
            .finish()
    }
}

impl Callbacks {
    pub fn on_request_start(mut self, f: impl Fn(&TrackedRequest) + Send + Sync + 'static) -> Self {
        self.on_request_start = Some(Arc::new(f));
        self
    }

    pub fn on_request_complete(
        mut self,
        f: impl Fn(&TrackedRequest) + Send + Sync + 'static,
    ) -> Self {
        self.on_request_complete = Some(Arc::new(f));
        self
    }

    pub fn on_request_error(
        mut self,
        f: impl Fn(&TrackedRequest, &CoalescerError) + Send + Sync + 'static,
    ) -> Self {
        self.on_request_error = Some(Arc::new(f));
        self
    }

    pub fn on_batch_start(mut self, f: impl Fn(&RequestBatch) + Send + Sync + 'static) -> Self {
        self.on_batch_start = Some(Arc::new(f));
        self
    }

    pub fn on_batch_complete(mut self, f: impl Fn(&RequestBatch) + Send + Sync + 'static) -> Self {
        self.on_batch_complete = Some(Arc::new(f));
        self
    }

    pub fn on_offline_queue_change(mut self, f: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_offline_queue_change = Some(Arc::new(f));
        self
    }
}

/// A callback invocation, collected while the state is locked and emitted afterwards.
#[derive(Debug)]
pub(super) enum Event {
    Completed(TrackedRequest),
    Failed(TrackedRequest, CoalescerError),
    OfflineQueueChanged(usize),
}

impl Callbacks {
    pub(super) fn emit(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Completed(tracked) => {
                    if let Some(f) = &self.on_request_complete {
                        f(&tracked);
                    }
                }
                Event::Failed(tracked, error) => {
                    if let Some(f) = &self.on_request_error {
                        f(&tracked, &error);
                    }
                }
                Event::OfflineQueueChanged(len) => {
                    if let Some(f) = &self.on_offline_queue_change {
                        f(len);
                    }
                }
            }
        }
    }

    pub(super) fn request_started(&self, tracked: &TrackedRequest) {
        if let Some(f) = &self.on_request_start {
            f(tracked);
        }
    }

    pub(super) fn batch_started(&self, batch: &RequestBatch) {
        if let Some(f) = &self.on_batch_start {
            f(batch);
        }
    }

    pub(super) fn batch_completed(&self, batch: &RequestBatch) {
        if let Some(f) = &self.on_batch_complete {
            f(batch);
        }
    }
}
