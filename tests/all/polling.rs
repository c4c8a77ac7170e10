use crate::helpers::{eventually, FakeQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warren::consumers::{ConfigurationError, HandlerError};
use warren::polling::{PollingConsumer, PollingError, Received, MAX_POLLING_WORKERS};

#[derive(Default)]
struct Context {
    running: AtomicUsize,
    peak_concurrency: AtomicUsize,
    failed: Mutex<Vec<String>>,
}

async fn handler(received: Received<'_, Context>) -> Result<(), HandlerError> {
    let context = &received.context;
    let now_running = context.running.fetch_add(1, Ordering::SeqCst) + 1;
    context
        .peak_concurrency
        .fetch_max(now_running, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    context.running.fetch_sub(1, Ordering::SeqCst);

    if received.message.body == "poison" {
        return Err(HandlerError::msg("Cannot process a poisoned message"));
    }
    Ok(())
}

async fn record_failure(received: Received<'_, Context>) -> Result<(), HandlerError> {
    received
        .context
        .failed
        .lock()
        .unwrap()
        .push(received.message.body.clone());
    Ok(())
}

#[tokio::test]
async fn worker_counts_outside_the_supported_range_are_rejected() {
    for worker_count in [0, MAX_POLLING_WORKERS + 1] {
        let outcome = PollingConsumer::builder(
            Arc::new(FakeQueue::new()),
            Arc::new(Context::default()),
        )
        .worker_count(worker_count)
        .handler(handler);

        assert_eq!(
            outcome.err(),
            Some(ConfigurationError::InvalidWorkerCount {
                actual: worker_count,
                min: 1,
                max: 10
            })
        );
    }

    for worker_count in [1, MAX_POLLING_WORKERS] {
        let consumer = PollingConsumer::builder(
            Arc::new(FakeQueue::new()),
            Arc::new(Context::default()),
        )
        .worker_count(worker_count)
        .handler(handler)
        .unwrap();
        assert_eq!(consumer.worker_count(), worker_count);
    }
}

#[tokio::test(start_paused = true)]
async fn processed_messages_are_deleted_and_failed_ones_are_left_on_the_queue() {
    // Arrange
    let queue = Arc::new(FakeQueue::new());
    queue.push_batch(&["invoice-1", "poison", "invoice-2"]);
    let context = Arc::new(Context::default());
    let consumer = PollingConsumer::builder(Arc::clone(&queue), Arc::clone(&context))
        .worker_count(2)
        .with_error_closure(record_failure)
        .handler(handler)
        .unwrap();
    let cancellation = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(cancellation.clone()));

    // Act
    eventually(|| queue.deleted().len() == 2 && context.failed.lock().unwrap().len() == 1).await;
    cancellation.cancel();
    let outcome = handle.await.unwrap();

    // Assert
    assert!(outcome.unwrap_err().is_cancelled());
    let mut deleted = queue.deleted();
    deleted.sort();
    assert_eq!(deleted, vec!["receipt-0-0", "receipt-0-2"]);
    assert_eq!(*context.failed.lock().unwrap(), vec!["poison".to_string()]);
    assert!(context.peak_concurrency.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn a_failed_delete_is_handed_to_the_error_handlers() {
    // Arrange
    let queue = Arc::new(FakeQueue::new());
    queue.push_batch(&["invoice-1"]);
    queue.fail_next_deletes(1);
    let context = Arc::new(Context::default());
    let consumer = PollingConsumer::builder(Arc::clone(&queue), Arc::clone(&context))
        .with_error_closure(record_failure)
        .handler(handler)
        .unwrap();
    let cancellation = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(cancellation.clone()));

    // Act
    eventually(|| !context.failed.lock().unwrap().is_empty()).await;
    cancellation.cancel();
    handle.await.unwrap().unwrap_err();

    // Assert
    assert!(queue.deleted().is_empty());
    assert_eq!(*context.failed.lock().unwrap(), vec!["invoice-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn a_failed_receive_stops_the_consumer() {
    // Arrange
    let queue = Arc::new(FakeQueue::new());
    queue.push_batch(&["invoice-1"]);
    queue.push_receive_error("The security token included in the request is invalid");
    let consumer =
        PollingConsumer::builder(Arc::clone(&queue), Arc::new(Context::default()))
            .handler(handler)
            .unwrap();

    // Act
    let outcome = consumer.run(CancellationToken::new()).await;

    // Assert
    assert!(matches!(outcome, Err(PollingError::Receive(_))));
    assert_eq!(queue.receive_calls(), 2);
    // In-flight work completes before returning.
    assert_eq!(queue.deleted(), vec!["receipt-0-0".to_string()]);
}
