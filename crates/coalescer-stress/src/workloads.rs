use std::sync::atomic::{AtomicUsize, Ordering};

use coalescer_service::{Coalescer, CoalescerError, Priority, RequestConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The requests a single operation of a workload submits.
///
/// Endpoints are relative to the local test server, e.g. `echo/users` or `delay/20ms/users`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    /// The same request over and over, which should mostly be coalesced or cached.
    Identical {
        endpoint: String,
        #[serde(default)]
        priority: Priority,
    },
    /// Requests cycling through `keys` distinct payloads.
    Distinct {
        endpoint: String,
        keys: usize,
        #[serde(default)]
        priority: Priority,
    },
    /// A `batch_request` of all the given requests.
    Batch { requests: Vec<RequestConfig> },
}

pub enum ParsedPayload {
    Identical(RequestConfig),
    Distinct {
        request: RequestConfig,
        keys: usize,
        next: AtomicUsize,
    },
    Batch(Vec<RequestConfig>),
}

pub fn prepare_payload(payload: Payload) -> ParsedPayload {
    match payload {
        Payload::Identical { endpoint, priority } => {
            ParsedPayload::Identical(RequestConfig::new(endpoint).with_priority(priority))
        }
        Payload::Distinct {
            endpoint,
            keys,
            priority,
        } => ParsedPayload::Distinct {
            request: RequestConfig::new(endpoint).with_priority(priority),
            keys: keys.max(1),
            next: AtomicUsize::new(0),
        },
        Payload::Batch { requests } => ParsedPayload::Batch(requests),
    }
}

/// Runs one operation of a workload, returning the number of failed requests.
pub async fn process_payload(coalescer: &Coalescer, workload: &ParsedPayload) -> usize {
    match workload {
        ParsedPayload::Identical(request) => {
            failures(&coalescer.request(request.clone()).await)
        }
        ParsedPayload::Distinct {
            request,
            keys,
            next,
        } => {
            let key = next.fetch_add(1, Ordering::Relaxed) % keys;
            let request = request.clone().with_data(json!({ "key": key }));
            failures(&coalescer.request(request).await)
        }
        ParsedPayload::Batch(requests) => {
            let response = coalescer.batch_request(requests.clone()).await;
            response.results.iter().filter(|r| !r.success).count()
        }
    }
}

fn failures<T>(result: &Result<T, CoalescerError>) -> usize {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}
