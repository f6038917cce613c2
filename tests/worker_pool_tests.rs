
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reliable_fetch::ledger::staging_key;
use reliable_fetch::worker::handler_fn;
use reliable_fetch::{JobError, MemoryBroker, Processor, ProcessorError};
use test_harness::{
    assert_eventually, test_config, Behaviour, RecordingHandler, RecordingRetry,
    RunningProcessor,
};

#[tokio::test]
async fn test_successful_jobs_are_acknowledged() {
    let broker = MemoryBroker::new();
    for i in 0..5 {
        broker.push("default", format!("job-{i}"));
    }
    let handler = RecordingHandler::new(Behaviour::Succeed);
    let processor = Processor::new(
        test_config(&[("default", 1)], 2),
        Arc::new(broker.clone()),
        handler.clone(),
    )
    .unwrap();
    let running = RunningProcessor::start(processor);

    let stats = running.stats.clone();
    assert_eventually(
        || {
            let stats = stats.clone();
            async move { stats.snapshot().acknowledged == 5 }
        },
        Duration::from_secs(5),
        "all jobs should be acknowledged",
    )
    .await;

    assert_eq!(handler.count(), 5);
    assert!(broker.is_empty("default"));
    assert!(broker.is_empty(&staging_key("default")));
    assert_eq!(running.stats.snapshot().succeeded, 5);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_terminal_failure_is_acknowledged() {
    let broker = MemoryBroker::new();
    broker.push("default", "corrupt");
    let handler = RecordingHandler::new(Behaviour::Fail);
    let processor = Processor::new(
        test_config(&[("default", 1)], 1),
        Arc::new(broker.clone()),
        handler.clone(),
    )
    .unwrap();
    let running = RunningProcessor::start(processor);

    let stats = running.stats.clone();
    assert_eventually(
        || {
            let stats = stats.clone();
            async move { stats.snapshot().acknowledged == 1 }
        },
        Duration::from_secs(5),
        "terminal failure should be acknowledged",
    )
    .await;

    let snap = running.stats.snapshot();
    assert_eq!(snap.failed, 1);
    assert_eq!(snap.retry_handoffs, 0);
    assert!(broker.is_empty(&staging_key("default")));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_retryable_failure_stays_in_flight() {
    let broker = MemoryBroker::new();
    broker.push("default", "flaky");
    let handler = RecordingHandler::new(Behaviour::Retry);
    let retry = Arc::new(RecordingRetry::default());
    let processor = Processor::new(
        test_config(&[("default", 1)], 1),
        Arc::new(broker.clone()),
        handler.clone(),
    )
    .unwrap()
    .with_retry_handoff(retry.clone());
    let running = RunningProcessor::start(processor);

    let stats = running.stats.clone();
    assert_eventually(
        || {
            let stats = stats.clone();
            async move { stats.snapshot().retry_handoffs == 1 }
        },
        Duration::from_secs(5),
        "retryable failure should be handed off",
    )
    .await;

    running.stop().await.unwrap();

    let received = retry.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "flaky");
    assert_eq!(received[0].1, "try again later");
    assert!(broker.contains(&staging_key("default"), b"flaky"));
}

#[tokio::test]
async fn test_panicking_handler_does_not_kill_slot() {
    let broker = MemoryBroker::new();
    // Claimed in push order
    broker.push("default", "boom-1");
    broker.push("default", "fine-1");
    broker.push("default", "boom-2");
    broker.push("default", "fine-2");

    let handler = RecordingHandler::new(Behaviour::PanicOnBoom);
    let processor = Processor::new(
        test_config(&[("default", 1)], 1),
        Arc::new(broker.clone()),
        handler.clone(),
    )
    .unwrap();
    let running = RunningProcessor::start(processor);

    let stats = running.stats.clone();
    assert_eventually(
        || {
            let stats = stats.clone();
            async move { stats.snapshot().acknowledged == 4 }
        },
        Duration::from_secs(5),
        "single slot should survive panics and process everything",
    )
    .await;

    let snap = running.stats.snapshot();
    assert_eq!(snap.panics, 2);
    assert_eq!(snap.succeeded, 2);
    assert_eq!(
        handler.seen_payloads(),
        vec!["boom-1", "fine-1", "boom-2", "fine-2"]
    );

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_jobs_held_never_exceed_worker_slots() {
    const SLOTS: usize = 3;

    let broker = MemoryBroker::new();
    for i in 0..40 {
        broker.push(if i % 2 == 0 { "even" } else { "odd" }, format!("job-{i}"));
    }

    let running_jobs = Arc::new(AtomicUsize::new(0));
    let max_held = Arc::new(AtomicUsize::new(0));
    let dispatch_slot: Arc<std::sync::OnceLock<Arc<reliable_fetch::dispatch::DispatchQueue>>> =
        Arc::new(std::sync::OnceLock::new());

    let handler = {
        let running_jobs = running_jobs.clone();
        let max_held = max_held.clone();
        let dispatch_slot = dispatch_slot.clone();
        handler_fn(move |_job, ctx| {
            let running_jobs = running_jobs.clone();
            let max_held = max_held.clone();
            let dispatch_slot = dispatch_slot.clone();
            async move {
                let now = running_jobs.fetch_add(1, Ordering::SeqCst) + 1;
                let buffered = dispatch_slot.get().map(|d| d.len()).unwrap_or(0);
                max_held.fetch_max(now + buffered, Ordering::SeqCst);
                ctx.suspend(tokio::time::sleep(Duration::from_millis(2))).await;
                running_jobs.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), JobError>(())
            }
        })
    };

    let processor = Processor::new(
        test_config(&[("even", 1), ("odd", 1)], SLOTS),
        Arc::new(broker.clone()),
        Arc::new(handler),
    )
    .unwrap();
    let _ = dispatch_slot.set(processor.dispatch());
    let running = RunningProcessor::start(processor);

    let stats = running.stats.clone();
    assert_eventually(
        || {
            let stats = stats.clone();
            async move { stats.snapshot().acknowledged == 40 }
        },
        Duration::from_secs(10),
        "all jobs should complete",
    )
    .await;

    assert!(max_held.load(Ordering::SeqCst) >= 1);
    assert!(
        max_held.load(Ordering::SeqCst) <= SLOTS,
        "held {} jobs with {} slots",
        max_held.load(Ordering::SeqCst),
        SLOTS
    );
    assert!(running.capacity.outstanding() <= SLOTS);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_configuration_is_fatal() {
    let broker = MemoryBroker::new();
    let handler = RecordingHandler::new(Behaviour::Succeed);

    let no_queues = Processor::new(
        test_config(&[], 4),
        Arc::new(broker.clone()),
        handler.clone(),
    );
    assert!(matches!(
        no_queues,
        Err(ProcessorError::FatalConfiguration(_))
    ));

    let no_workers = Processor::new(test_config(&[("q", 1)], 0), Arc::new(broker), handler);
    assert!(matches!(
        no_workers,
        Err(ProcessorError::FatalConfiguration(_))
    ));
}
