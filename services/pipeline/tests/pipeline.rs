use chrono::{NaiveDate, TimeZone, Utc};
use futures::TryStreamExt;
use parcel_pipeline::{
    DurableQueue, FnProcessor, ItemId, ItemState, JobMessage, LifecycleMover, LocalCapabilities,
    Metadata, NewWorkItem, ObjectStore, Order, Outcome, PipelineError, Producer, ReportStore,
    RetryPolicy, RetryingWriter, StatusStore, Worker, WorkerSettings,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "arn:aws:sns:us-east-1:000000000000:processing-notifications";

fn writer() -> RetryingWriter {
    RetryingWriter::new(RetryPolicy::immediate(3))
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        topic: Some(TOPIC.to_string()),
        max_messages: 10,
        wait: Duration::ZERO,
        idle_backoff_min: Duration::from_millis(10),
        idle_backoff_max: Duration::from_millis(50),
    }
}

/// Marks every object as resized; objects containing "corrupt" fail
fn resizer() -> Arc<FnProcessor<impl Fn(&JobMessage, &[u8]) -> parcel_pipeline::Result<Metadata> + Send + Sync>> {
    Arc::new(FnProcessor::new(|_: &JobMessage, body: &[u8]| {
        if body.windows(7).any(|w| w == b"corrupt") {
            return Err(PipelineError::Processing("cannot decode image".into()));
        }
        let mut metadata = Metadata::new();
        metadata.insert("resized".into(), json!(true));
        Ok(metadata)
    }))
}

fn setup() -> (LocalCapabilities, Producer, Worker) {
    let local = LocalCapabilities::new(Duration::from_secs(30), 3);
    let producer = Producer::new(local.capabilities(), "hot", writer());
    let worker = Worker::new(local.capabilities(), resizer(), writer(), settings());
    (local, producer, worker)
}

#[tokio::test]
async fn test_upload_to_processed() {
    let (local, producer, worker) = setup();

    let item = producer
        .submit(
            NewWorkItem::new("uploads/cat.png", b"\x89PNG....".to_vec())
                .with_item_id(ItemId::from("img-1"))
                .with_metadata("owner", "alice"),
        )
        .await
        .unwrap();
    assert_eq!(item.item_id.as_str(), "img-1");

    let uploaded = local.status.get(&item.item_id).await.unwrap().unwrap();
    assert_eq!(uploaded.state, ItemState::Uploaded);

    let outcomes = worker.poll_once().await.unwrap();
    assert_eq!(outcomes, vec![Outcome::Processed]);

    let record = local.status.get(&item.item_id).await.unwrap().unwrap();
    assert_eq!(record.state, ItemState::Processed);
    assert_eq!(record.metadata["resized"], json!(true));
    assert_eq!(record.metadata["owner"], json!("alice"));
    assert_eq!(record.last_error, None);

    let published = local.notifier.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, TOPIC);
    assert_eq!(published[0].1.item_id, item.item_id);
    assert_eq!(published[0].1.state, ItemState::Processed);

    assert!(local.queue.is_empty());
}

#[tokio::test]
async fn test_processor_failure_is_recorded_and_acknowledged() {
    let (local, producer, worker) = setup();

    let item = producer
        .submit(NewWorkItem::new("uploads/bad.png", b"corrupt bytes".to_vec()))
        .await
        .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), vec![Outcome::Failed]);

    let record = local.status.get(&item.item_id).await.unwrap().unwrap();
    assert_eq!(record.state, ItemState::Error);
    assert!(record.last_error.unwrap().contains("cannot decode image"));

    let events = local.notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, ItemState::Error);

    // acknowledged, so not redelivered
    assert!(local.queue.is_empty());
    assert!(local.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn test_redelivered_message_converges_to_same_status() {
    let (local, producer, worker) = setup();
    let item = producer
        .submit(NewWorkItem::new("uploads/cat.png", b"png".to_vec()))
        .await
        .unwrap();
    worker.poll_once().await.unwrap();
    let first = local.status.get(&item.item_id).await.unwrap().unwrap();

    // the same job delivered again, as after a lost acknowledge
    local
        .queue
        .enqueue(item.job_message().to_bytes().unwrap())
        .await
        .unwrap();
    assert_eq!(worker.poll_once().await.unwrap(), vec![Outcome::Processed]);

    let second = local.status.get(&item.item_id).await.unwrap().unwrap();
    assert!(first.same_outcome(&second));
    assert_eq!(local.status.len(), 1);
}

#[tokio::test]
async fn test_unrecordable_outcome_is_redelivered() {
    let (local, producer, worker) = setup();
    let item = producer
        .submit(NewWorkItem::new("uploads/cat.png", b"png".to_vec()))
        .await
        .unwrap();

    // outlasts the three attempts of the `processing` write
    local.status.fail_next_writes(3);
    assert_eq!(worker.poll_once().await.unwrap(), vec![Outcome::Unacknowledged]);
    assert_eq!(
        local.status.get(&item.item_id).await.unwrap().unwrap().state,
        ItemState::Uploaded
    );
    assert!(local.notifier.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_poison_message_is_dead_lettered() {
    let (local, _producer, worker) = setup();
    local.queue.enqueue(b"{not json".to_vec()).await.unwrap();

    for _ in 0..3 {
        assert_eq!(worker.poll_once().await.unwrap(), vec![Outcome::Malformed]);
        tokio::time::advance(Duration::from_secs(31)).await;
    }

    // the fourth receive redrives instead of delivering
    assert!(worker.poll_once().await.unwrap().is_empty());
    assert_eq!(local.queue.dead_letters(), vec![b"{not json".to_vec()]);
    assert_eq!(local.queue.dead_letter_depth().await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_worker_run_drains_queue_and_stops() {
    let (local, producer, worker) = setup();
    for i in 0..5 {
        producer
            .submit(NewWorkItem::new(format!("uploads/{i}.png"), b"png".to_vec()))
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let worker = Arc::new(worker);
    let task = tokio::spawn({
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while local.notifier.events().len() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.processed, 5);
    assert!(local.queue.is_empty());
}

fn order(id: &str, product: &str, day: u32) -> Order {
    Order {
        order_id: id.to_string(),
        customer_id: "C1".to_string(),
        product: product.to_string(),
        quantity: 2,
        price: 9.5,
        timestamp: Utc.with_ymd_and_hms(2024, 1, day, 10, 30, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_reports_publish_query_and_archive() {
    let local = LocalCapabilities::new(Duration::from_secs(30), 3);
    let objects: Arc<dyn ObjectStore> = local.objects.clone();
    let reports = ReportStore::new(objects.clone(), writer(), "hot", "daily_reports");

    let jan = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
    reports
        .publish_daily(jan(1), &[order("O1", "Widget A", 1), order("O2", "Widget B", 1)])
        .await
        .unwrap();
    reports
        .publish_daily(jan(3), &[order("O3", "Widget A", 3)])
        .await
        .unwrap();

    let entries: Vec<_> = reports
        .query(jan(1), jan(3), Some("Widget A".to_string()))
        .try_collect()
        .await
        .unwrap();
    let dates: Vec<_> = entries.iter().map(|e| e.date).collect();
    assert_eq!(dates, vec![jan(1), jan(3)]);
    assert!(entries[0].content.starts_with("Order ID,Customer ID,Product,Quantity,Price,Timestamp"));
    assert!(entries[0].content.contains("O1,C1,Widget A,2,9.50,"));

    let mover = LifecycleMover::new(objects, writer(), "hot", "cold", "daily_reports", 1);
    let now = Utc.with_ymd_and_hms(2024, 2, 2, 12, 0, 0).unwrap();

    // 2024-01-01 is 32 days old, 2024-01-03 is 30 days and 12 hours
    let report = mover.sweep(chrono::Duration::days(31), now).await.unwrap();
    assert_eq!(report.moved, 2);
    assert_eq!(report.retained, 1);
    assert!(local.objects.contains("cold", "daily_reports/2024-01-01/Widget A"));
    assert!(local.objects.contains("cold", "daily_reports/2024-01-01/Widget B"));
    assert!(local.objects.contains("hot", "daily_reports/2024-01-03/Widget A"));

    let again = mover.sweep(chrono::Duration::days(31), now).await.unwrap();
    assert_eq!(again.moved, 0);
    assert_eq!(again.scanned, 1);

    // archived days no longer show up in the hot range query
    let remaining: Vec<_> = reports
        .query(jan(1), jan(3), None)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].date, jan(3));
}
