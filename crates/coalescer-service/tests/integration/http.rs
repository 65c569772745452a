use std::time::Duration;

use coalescer_service::{Coalescer, CoalescerError, HttpExecutor, Method, RequestConfig};
use serde_json::{Value, json};

use crate::setup_coalescer;

#[tokio::test]
async fn test_echo_roundtrip() {
    let (coalescer, server) = setup_coalescer(|_| {});

    let request = RequestConfig::new("echo/users")
        .with_data(json!({"name": "ferris"}))
        .with_header("x-trace", "abc");
    let response = coalescer.request(request).await.unwrap();

    assert_eq!(
        response.data,
        json!({
            "method": "POST",
            "path": "/echo/users",
            "body": {"name": "ferris"},
            "headers": {"x-trace": "abc"},
        })
    );
    assert!(!response.from_cache);
    assert_eq!(server.accesses(), 1);

    let request = RequestConfig::new("echo/users/1").with_method(Method::Delete);
    let response = coalescer.request(request).await.unwrap();
    assert_eq!(response.data["method"], "DELETE");
    assert_eq!(response.data["body"], Value::Null);
}

#[tokio::test]
async fn test_status_errors() {
    let (coalescer, server) = setup_coalescer(|_| {});

    let request = RequestConfig::new("respond_statuscode/404/once").with_retries(0);
    let error = coalescer.request(request).await.unwrap_err();
    assert_eq!(error, CoalescerError::Status(404));
    assert_eq!(server.accesses(), 1);

    let request = RequestConfig::new("respond_statuscode/500/thrice").with_retries(2);
    let error = coalescer.request(request).await.unwrap_err();
    assert_eq!(
        error,
        CoalescerError::RetriesExhausted {
            attempts: 3,
            last: Box::new(CoalescerError::Status(500)),
        }
    );
    assert_eq!(server.accesses(), 3);

    let metrics = coalescer.metrics();
    assert_eq!(metrics.failed_requests, 2);
    assert_eq!(metrics.retried_attempts, 2);
}

#[tokio::test]
async fn test_recovers_after_failures() {
    let (coalescer, server) = setup_coalescer(|_| {});

    let request = RequestConfig::new("fail_times/2/flaky").with_retries(3);
    let response = coalescer.request(request).await.unwrap();

    assert_eq!(response.data, json!({"attempt": 3}));
    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_timeout() {
    let (coalescer, _server) = setup_coalescer(|_| {});

    let request = RequestConfig::new("delay/1h/stuck")
        .with_timeout(Duration::from_millis(100))
        .with_retries(0);
    let error = coalescer.request(request).await.unwrap_err();

    assert_eq!(error, CoalescerError::Timeout(Duration::from_millis(100)));
    assert_eq!(coalescer.metrics().timed_out_attempts, 1);
}

#[tokio::test]
async fn test_invalid_and_empty_bodies() {
    let (coalescer, _server) = setup_coalescer(|_| {});

    let request = RequestConfig::new("garbage_data/not-json").with_retries(0);
    let error = coalescer.request(request).await.unwrap_err();
    assert!(matches!(error, CoalescerError::Transport(_)), "{error:?}");

    let response = coalescer
        .request(RequestConfig::new("empty/nothing"))
        .await
        .unwrap();
    assert_eq!(response.data, Value::Null);
}

#[tokio::test]
async fn test_connection_refused() {
    // reserve a free port, and close it again right away
    let port = {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    };
    let base_url = format!("http://127.0.0.1:{port}/").parse().unwrap();
    let executor = HttpExecutor::default().with_base_url(base_url);
    let coalescer = Coalescer::builder(Default::default())
        .executor(executor)
        .build();

    let request = RequestConfig::new("echo/gone")
        .with_timeout(Duration::from_secs(5))
        .with_retries(0);
    let error = coalescer.request(request).await.unwrap_err();
    assert!(matches!(error, CoalescerError::Transport(_)), "{error:?}");
}

#[tokio::test]
async fn test_invalid_endpoint() {
    let coalescer = Coalescer::new(Default::default());

    let request = RequestConfig::new("no base url").with_retries(0);
    let error = coalescer.request(request).await.unwrap_err();
    assert!(matches!(error, CoalescerError::Transport(_)), "{error:?}");
}
