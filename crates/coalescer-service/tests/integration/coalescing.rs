use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coalescer_service::{
    Callbacks, Coalescer, CoalescerConfig, CoalescerError, Priority, RequestConfig,
};
use futures::future::join_all;
use serde_json::{Value, json};

use crate::setup_coalescer;

#[tokio::test]
async fn test_identical_requests_hit_server_once() {
    let (coalescer, server) = setup_coalescer(|_| {});

    let request = RequestConfig::new("echo/dedup").with_data(json!({"page": 1}));
    let responses = join_all((0..10).map(|_| coalescer.request(request.clone()))).await;

    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.data["body"], json!({"page": 1}));
        assert_eq!(response.coalesced_count, 9);
    }
    assert_eq!(server.accesses(), 1);

    let metrics = coalescer.metrics();
    assert_eq!(metrics.total_requests, 10);
    assert_eq!(metrics.saved_requests, 9);
}

#[tokio::test]
async fn test_distinct_payloads_are_not_coalesced() {
    let (coalescer, server) = setup_coalescer(|_| {});

    let a = RequestConfig::new("echo/search").with_data(json!({"q": "a"}));
    let b = RequestConfig::new("echo/search").with_data(json!({"q": "b"}));
    let (a, b) = tokio::join!(coalescer.request(a), coalescer.request(b));

    assert_eq!(a.unwrap().data["body"], json!({"q": "a"}));
    assert_eq!(b.unwrap().data["body"], json!({"q": "b"}));
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_explicit_cache_key() {
    let (coalescer, server) = setup_coalescer(|_| {});

    let a = RequestConfig::new("echo/one").with_cache_key("shared");
    let b = RequestConfig::new("echo/two").with_cache_key("shared");
    let first = coalescer.request(a).await.unwrap();
    let second = coalescer.request(b).await.unwrap();

    assert!(second.from_cache);
    assert_eq!(second.data, first.data);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_cache_expires() {
    let (coalescer, server) = setup_coalescer(|config| {
        config.cache_ttl = Duration::from_millis(100);
    });

    let request = RequestConfig::new("echo/ttl");
    assert!(!coalescer.request(request.clone()).await.unwrap().from_cache);
    assert!(coalescer.request(request.clone()).await.unwrap().from_cache);
    assert_eq!(server.accesses(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!coalescer.request(request).await.unwrap().from_cache);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_batch_request_partial_failure() {
    let (coalescer, server) = setup_coalescer(|_| {});

    let response = coalescer
        .batch_request(vec![
            RequestConfig::new("echo/a"),
            RequestConfig::new("respond_statuscode/500/b").with_retries(0),
            RequestConfig::new("echo/c"),
        ])
        .await;

    let success: Vec<_> = response.results.iter().map(|r| r.success).collect();
    assert_eq!(success, [true, false, true]);
    assert_eq!(response.results[1].error, Some(CoalescerError::Status(500)));
    assert_eq!(response.results[2].data.as_ref().unwrap()["path"], "/echo/c");
    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_custom_executor_priority_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let executor = {
        let order = order.clone();
        move |config: RequestConfig| {
            order.lock().unwrap().push(config.endpoint.clone());
            async move { Ok::<_, anyhow::Error>(Value::String(config.endpoint)) }
        }
    };

    let config = CoalescerConfig {
        batch_window: Duration::from_millis(50),
        ..Default::default()
    };
    let coalescer = Coalescer::builder(config).executor(executor).build();

    let response = coalescer
        .batch_request(vec![
            RequestConfig::new("background").with_priority(Priority::Background),
            RequestConfig::new("normal"),
            RequestConfig::new("critical").with_priority(Priority::Critical),
        ])
        .await;

    let data: Vec<_> = response
        .results
        .into_iter()
        .map(|result| result.data.unwrap())
        .collect();
    assert_eq!(data, ["background", "normal", "critical"]);
    assert_eq!(*order.lock().unwrap(), ["critical", "normal", "background"]);
}

#[tokio::test]
async fn test_callbacks_observe_lifecycle() {
    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let callbacks = Callbacks::default()
        .on_request_start({
            let started = started.clone();
            move |_| {
                started.fetch_add(1, Ordering::Relaxed);
            }
        })
        .on_request_complete({
            let completed = completed.clone();
            move |_| {
                completed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .on_request_error({
            let failed = failed.clone();
            move |_, _| {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });

    let executor = |config: RequestConfig| async move {
        match config.endpoint.as_str() {
            "fail" => Err(anyhow::Error::from(CoalescerError::Status(400))),
            _ => Ok(Value::Null),
        }
    };
    let coalescer = Coalescer::builder(Default::default())
        .executor(executor)
        .callbacks(callbacks)
        .build();

    let ok = RequestConfig::new("ok");
    coalescer.request(ok.clone()).await.unwrap();
    // served from the cache, without starting an execution
    coalescer.request(ok).await.unwrap();
    coalescer
        .request(RequestConfig::new("fail").with_retries(0))
        .await
        .unwrap_err();

    assert_eq!(started.load(Ordering::Relaxed), 2);
    assert_eq!(completed.load(Ordering::Relaxed), 2);
    assert_eq!(failed.load(Ordering::Relaxed), 1);
}
