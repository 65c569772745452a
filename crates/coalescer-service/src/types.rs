use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CoalescerError;

/// A process-unique identifier of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Identifies one closed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The request method handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority of a request within a batch.
///
/// Variants are declared in rank order, so the derived [`Ord`] sorts the most urgent first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    /// The numeric rank, `0` being the most urgent.
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Describes a single logical call.
///
/// The config is immutable once submitted. Construct it with [`RequestConfig::new`] and refine
/// it with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Where the request goes. Interpreted by the executor.
    pub endpoint: String,
    /// An opaque payload.
    #[serde(default)]
    pub data: Option<Value>,
    /// An explicit method. See [`effective_method`](Self::effective_method).
    #[serde(default)]
    pub method: Option<Method>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-attempt timeout, overriding the configured default.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Number of retries, overriding the configured default.
    #[serde(default)]
    pub retries: Option<u32>,
    /// An explicit identity key, replacing the one derived from method, endpoint and data.
    #[serde(default)]
    pub cache_key: Option<String>,
    /// Whether the request may wait for a batch window.
    #[serde(default = "default_true")]
    pub batchable: bool,
    /// Whether the request may share an in-flight execution with identical requests.
    #[serde(default = "default_true")]
    pub deduplicate: bool,
}

impl RequestConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            data: None,
            method: None,
            priority: Priority::default(),
            headers: BTreeMap::new(),
            timeout: None,
            retries: None,
            cache_key: None,
            batchable: true,
            deduplicate: true,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_batchable(mut self, batchable: bool) -> Self {
        self.batchable = batchable;
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    /// The method actually used: the explicit one, otherwise `POST` when a payload is present
    /// and `GET` when it is not.
    pub fn effective_method(&self) -> Method {
        match (self.method, &self.data) {
            (Some(method), _) => method,
            (None, Some(_)) => Method::Post,
            (None, None) => Method::Get,
        }
    }

    /// Rejects configs that can never be executed.
    pub fn validate(&self) -> Result<(), CoalescerError> {
        if self.endpoint.trim().is_empty() {
            return Err(CoalescerError::Validation("endpoint must not be empty".into()));
        }
        if matches!(&self.cache_key, Some(key) if key.is_empty()) {
            return Err(CoalescerError::Validation("cache key must not be empty".into()));
        }
        Ok(())
    }
}

/// The lifecycle state of a [`TrackedRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A submitted request and its lifecycle.
///
/// `result` is present iff the request completed, `error` iff it failed or was cancelled.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub id: RequestId,
    pub config: RequestConfig,
    pub status: RequestStatus,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    /// How many retries were needed, not counting the first attempt.
    pub retry_count: u32,
    pub result: Option<Value>,
    pub error: Option<CoalescerError>,
    /// The batch this request was dispatched in, if any.
    pub batch_id: Option<BatchId>,
}

impl TrackedRequest {
    pub(crate) fn new(id: RequestId, config: RequestConfig) -> Self {
        Self {
            id,
            config,
            status: RequestStatus::Pending,
            created_at: Instant::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            result: None,
            error: None,
            batch_id: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = RequestStatus::Executing;
        self.started_at = Some(Instant::now());
    }

    pub(crate) fn complete(&mut self, result: Value) {
        self.status = RequestStatus::Completed;
        self.completed_at = Some(Instant::now());
        self.result = Some(result);
    }

    pub(crate) fn fail(&mut self, error: CoalescerError) {
        self.status = RequestStatus::Failed;
        self.completed_at = Some(Instant::now());
        self.error = Some(error);
    }

    pub(crate) fn cancel(&mut self) {
        self.status = RequestStatus::Cancelled;
        self.completed_at = Some(Instant::now());
        self.error = Some(CoalescerError::Cancelled);
    }

    /// Time from submission until the request reached a terminal state.
    pub fn latency(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }
}

/// A group of requests released together by the batch scheduler.
///
/// The batch holds snapshots of its requests; it does not own their lifecycle.
#[derive(Debug, Clone)]
pub struct RequestBatch {
    pub id: BatchId,
    /// The requests in dispatch order.
    pub requests: Vec<TrackedRequest>,
    pub created_at: Instant,
}

impl RequestBatch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// The response delivered to a caller of [`Coalescer::request`](crate::Coalescer::request).
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedResponse {
    pub data: Value,
    /// Whether the response was served from the cache without executing anything.
    pub from_cache: bool,
    /// How many additional callers shared the execution that produced this response.
    pub coalesced_count: usize,
    pub batch_id: Option<BatchId>,
    pub latency: Duration,
}

/// The outcome of one entry of a [`Coalescer::batch_request`](crate::Coalescer::batch_request).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntryResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<CoalescerError>,
}

impl From<Result<CoalescedResponse, CoalescerError>> for BatchEntryResult {
    fn from(result: Result<CoalescedResponse, CoalescerError>) -> Self {
        match result {
            Ok(response) => Self {
                success: true,
                data: Some(response.data),
                error: None,
            },
            Err(error) => Self {
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

/// The aggregate response of a [`Coalescer::batch_request`](crate::Coalescer::batch_request).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResponse {
    /// One entry per input config, in input order.
    pub results: Vec<BatchEntryResult>,
    pub batch_id: BatchId,
    pub total_latency: Duration,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_effective_method() {
        let config = RequestConfig::new("/users");
        assert_eq!(config.effective_method(), Method::Get);

        let config = config.with_data(json!({"id": 1}));
        assert_eq!(config.effective_method(), Method::Post);

        let config = config.with_method(Method::Put);
        assert_eq!(config.effective_method(), Method::Put);
    }

    #[test]
    fn test_priority_rank_order() {
        let mut priorities = vec![
            Priority::Low,
            Priority::Critical,
            Priority::Background,
            Priority::Normal,
            Priority::High,
        ];
        priorities.sort();
        let ranks: Vec<_> = priorities.iter().map(Priority::rank).collect();
        assert_eq!(ranks, [0, 1, 2, 3, 4]);
        assert_eq!(priorities[0], Priority::Critical);
    }

    #[test]
    fn test_validate() {
        assert!(RequestConfig::new("/ok").validate().is_ok());
        assert!(matches!(
            RequestConfig::new("  ").validate(),
            Err(CoalescerError::Validation(_))
        ));
        assert!(matches!(
            RequestConfig::new("/ok").with_cache_key("").validate(),
            Err(CoalescerError::Validation(_))
        ));
    }

    #[test]
    fn test_deserialize_defaults() {
        let yaml = r#"
            endpoint: /search
            priority: high
            timeout: 2s
        "#;
        let config: RequestConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.endpoint, "/search");
        assert_eq!(config.priority, Priority::High);
        assert_eq!(config.timeout, Some(Duration::from_secs(2)));
        assert!(config.batchable);
        assert!(config.deduplicate);
        assert_eq!(config.data, None);
    }

    #[test]
    fn test_tracked_lifecycle() {
        let mut tracked = TrackedRequest::new(RequestId::new(1), RequestConfig::new("/a"));
        assert_eq!(tracked.status, RequestStatus::Pending);
        assert!(!tracked.status.is_terminal());

        tracked.start();
        assert_eq!(tracked.status, RequestStatus::Executing);
        assert!(tracked.started_at.is_some());

        tracked.complete(json!(42));
        assert!(tracked.status.is_terminal());
        assert_eq!(tracked.result, Some(json!(42)));
        assert!(tracked.error.is_none());
        assert!(tracked.latency().is_some());
    }
}
