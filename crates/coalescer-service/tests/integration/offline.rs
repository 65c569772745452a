use std::time::Duration;

use coalescer_service::{CoalescerError, RequestConfig, RequestStatus};
use futures::future::join_all;

use crate::setup_coalescer_with;

#[tokio::test]
async fn test_requests_wait_for_connectivity() {
    let (coalescer, server) = setup_coalescer_with(false, |_| {});

    let handles: Vec<_> = ["echo/1", "echo/2", "echo/3"]
        .into_iter()
        .map(|endpoint| coalescer.submit(RequestConfig::new(endpoint)).unwrap())
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.accesses(), 0);
    assert_eq!(coalescer.pending_count(), 3);
    assert_eq!(
        coalescer.request_status(handles[0].id()).unwrap().status,
        RequestStatus::Pending
    );

    coalescer.set_online(true);
    let responses = join_all(handles).await;
    let paths: Vec<_> = responses
        .into_iter()
        .map(|response| response.unwrap().data["path"].clone())
        .collect();

    assert_eq!(paths, ["/echo/1", "/echo/2", "/echo/3"]);
    assert_eq!(server.accesses(), 3);
    assert_eq!(coalescer.pending_count(), 0);
}

#[tokio::test]
async fn test_offline_queue_overflow() {
    let (coalescer, server) = setup_coalescer_with(false, |config| {
        config.max_offline_queue_size = 1;
    });

    let dropped = coalescer.submit(RequestConfig::new("echo/old")).unwrap();
    let kept = coalescer.submit(RequestConfig::new("echo/new")).unwrap();
    assert_eq!(dropped.await.unwrap_err(), CoalescerError::OfflineQueueFull);

    coalescer.set_online(true);
    assert_eq!(kept.await.unwrap().data["path"], "/echo/new");
    assert_eq!(server.all_hits(), [("/echo/new".to_owned(), 1)]);
}

#[tokio::test]
async fn test_connectivity_signal() {
    let (coalescer, server) = setup_coalescer_with(false, |_| {});
    let (signal, receiver) = tokio::sync::watch::channel(false);
    let watcher = coalescer.watch_connectivity(receiver);

    let handle = coalescer.submit(RequestConfig::new("echo/later")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.accesses(), 0);

    signal.send(true).unwrap();
    assert!(handle.await.is_ok());
    assert_eq!(server.accesses(), 1);

    // requests go out directly while online
    coalescer
        .request(RequestConfig::new("echo/now"))
        .await
        .unwrap();

    coalescer.shutdown();
    watcher.await.unwrap();
}
