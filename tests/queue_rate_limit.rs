use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use ws_resilience::core::{
    QueueEvent, RateLimiter, RateLimiterConfig, ResilienceError, RetryQueue, RetryQueueConfig,
};

#[tokio::test(start_paused = true)]
async fn queued_work_drains_in_priority_order_under_rate_limit() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimiterConfig::new(2, Duration::from_secs(1)).with_warnings(false),
    ));
    let queue = RetryQueue::new(RetryQueueConfig::default().with_logs(false));
    let completed = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    for (label, priority) in [(1u32, 1), (2, 5), (3, 9), (4, 5), (5, 1)] {
        let limiter = Arc::clone(&limiter);
        let completed = Arc::clone(&completed);
        queue.add(
            move || {
                let limiter = Arc::clone(&limiter);
                let completed = Arc::clone(&completed);
                async move {
                    limiter.acquire().await;
                    completed.lock().push((label, start.elapsed()));
                    Ok(())
                }
            },
            priority,
        );
    }

    queue.idle().await;

    let completed = completed.lock().clone();
    let labels: Vec<u32> = completed.iter().map(|(label, _)| *label).collect();
    assert_eq!(labels, vec![3, 2, 4, 1, 5]);

    let times: Vec<Duration> = completed.iter().map(|(_, at)| *at).collect();
    assert_eq!(
        times,
        vec![
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn queue_events_report_retries_and_final_failure() {
    let queue = RetryQueue::new(
        RetryQueueConfig::default()
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(100))
            .with_logs(false),
    );
    let mut events = queue.subscribe();

    let id = queue.add_default(|| async {
        Err(ResilienceError::SendFailed("peer offline".to_string()))
    });
    queue.idle().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(matches!(&seen[0], QueueEvent::Queued { id: queued, priority: 5 } if *queued == id));
    assert!(matches!(
        &seen[1],
        QueueEvent::Retrying { attempt: 1, delay, .. } if *delay == Duration::from_millis(100)
    ));
    assert!(matches!(
        &seen[2],
        QueueEvent::Failed { attempts: 2, error: ResilienceError::SendFailed(_), .. }
    ));
    assert_eq!(seen.len(), 3);
    assert!(queue.is_empty());
}
