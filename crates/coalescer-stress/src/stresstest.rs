use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use coalescer_service::config::Config;
use coalescer_service::{Coalescer, HttpExecutor};
use coalescer_test::HitCounter;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_payload, process_payload};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // start the server all requests go to
    let server = HitCounter::new();
    let executor = HttpExecutor::default().with_base_url(server.base_url());
    let coalescer = Coalescer::builder(config.coalescer)
        .executor(executor)
        .build();

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| (workload.concurrency, Arc::new(prepare_payload(workload.payload))))
        .collect();

    // warmup: run each workload once to make sure the server is up and caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let coalescer = coalescer.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move { process_payload(&coalescer, &workload).await })
        });

        let failed: usize = futures::future::join_all(futures)
            .await
            .into_iter()
            .map(|task| task.context("warmup task panicked"))
            .sum::<Result<usize>>()?;

        println!("Warmup: {:?} ({failed} failed requests)", start.elapsed());
    };
    println!();
    server.accesses();
    coalescer.reset_metrics();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let coalescer = coalescer.clone();

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failed_requests = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let coalescer = coalescer.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let failed_requests = Arc::clone(&failed_requests);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let failed = process_payload(&coalescer, &workload).await;
                            failed_requests.fetch_add(failed, Ordering::Relaxed);

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations, failed_requests.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, failed) = task.context("workload task panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failed} failed requests"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let seconds = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(seconds)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!("Server hits: {}", server.accesses());
    let metrics = serde_json::to_string_pretty(&coalescer.metrics())?;
    println!("Coalescer metrics: {metrics}");

    Ok(())
}
