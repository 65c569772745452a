//! A client-side request coalescing and scheduling layer.
//!
//! The [`Coalescer`] sits between application call sites and a transport, represented by an
//! [`Executor`](executor::Executor). It reduces, batches, caches and retries outbound requests:
//!
//! - identical in-flight requests are deduplicated into a single execution,
//! - successful results are kept in a TTL-bounded cache,
//! - batchable requests are grouped within a time window and dispatched by priority,
//! - failed attempts are retried with exponential backoff and jitter,
//! - requests submitted while offline are held in a bounded queue until connectivity returns.

#[macro_use]
pub mod metrics;

pub mod batch;
pub mod cache_key;
pub mod caching;
pub mod coalescer;
pub mod config;
pub mod connectivity;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod logging;
pub mod offline;
pub mod retry;
pub mod stats;
pub mod types;
pub mod utils;


pub use coalescer::{Callbacks, Coalescer, CoalescerBuilder, RequestHandle};
pub use config::CoalescerConfig;
pub use error::CoalescerError;
pub use executor::{Executor, HttpExecutor};
pub use stats::CoalescerMetrics;
pub use types::{
    BatchEntryResult, BatchId, BatchResponse, CoalescedResponse, Method, Priority, RequestBatch,
    RequestConfig, RequestId, RequestStatus, TrackedRequest,
};
