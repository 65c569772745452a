use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::error::CoalescerError;

/// The number of completed requests the average latency is computed over.
const LATENCY_WINDOW: usize = 100;

/// A snapshot of the coalescer's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoalescerMetrics {
    /// Every call to `request`, counted once, including calls in a `batch_request`.
    pub total_requests: u64,
    /// Calls that attached to an identical in-flight request.
    pub coalesced_requests: u64,
    /// Executions avoided by deduplication.
    pub saved_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Requests dispatched as part of a batch.
    pub batched_requests: u64,
    pub total_batches: u64,
    pub average_batch_size: f64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    /// Attempts that ran into their timeout.
    pub timed_out_attempts: u64,
    /// Attempts beyond the first one.
    pub retried_attempts: u64,
    /// Mean latency of the most recently completed requests.
    pub average_latency_ms: f64,
    /// Requests that have not reached a terminal state yet.
    pub pending_requests: u64,
}

/// Accumulates [`CoalescerMetrics`] and mirrors them to statsd.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: CoalescerMetrics,
    batch_size_sum: u64,
    latencies: VecDeque<Duration>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&mut self) {
        self.counters.total_requests += 1;
        metric!(counter("requests.total") += 1);
    }

    pub fn record_coalesced(&mut self) {
        self.counters.coalesced_requests += 1;
        self.counters.saved_requests += 1;
        metric!(counter("requests.coalesced") += 1);
    }

    pub fn record_cache_lookup(&mut self, hit: bool) {
        if hit {
            self.counters.cache_hits += 1;
        } else {
            self.counters.cache_misses += 1;
        }
        metric!(counter("cache.access") += 1, "hit" => if hit { "true" } else { "false" });
    }

    pub fn record_batch(&mut self, size: usize) {
        self.counters.total_batches += 1;
        self.counters.batched_requests += size as u64;
        self.batch_size_sum += size as u64;
        self.counters.average_batch_size =
            self.batch_size_sum as f64 / self.counters.total_batches as f64;
        metric!(histogram("batch.size") = size as u64);
    }

    /// Records the attempts of one execution, regardless of its outcome.
    pub fn record_attempts(&mut self, retries: u32, timeouts: u32) {
        self.counters.retried_attempts += u64::from(retries);
        self.counters.timed_out_attempts += u64::from(timeouts);
        if retries > 0 {
            metric!(counter("requests.retried") += i64::from(retries));
        }
        if timeouts > 0 {
            metric!(counter("requests.timed_out") += i64::from(timeouts));
        }
    }

    pub fn record_completion(&mut self, latency: Duration) {
        if self.latencies.len() >= LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);

        let total: Duration = self.latencies.iter().sum();
        self.counters.average_latency_ms =
            total.as_secs_f64() * 1000.0 / self.latencies.len() as f64;
        metric!(timer("requests.duration") = latency);
    }

    pub fn record_failure(&mut self, error: &CoalescerError) {
        self.counters.failed_requests += 1;
        metric!(counter("requests.failed") += 1, "error" => error.metric_tag());
    }

    pub fn record_cancellation(&mut self) {
        self.counters.cancelled_requests += 1;
        metric!(counter("requests.cancelled") += 1);
    }

    /// Returns the current counters, with `pending` as the number of outstanding requests.
    pub fn snapshot(&self, pending: usize) -> CoalescerMetrics {
        metric!(gauge("requests.pending") = pending as u64);
        CoalescerMetrics {
            pending_requests: pending as u64,
            ..self.counters.clone()
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
