//! Submits work items: store the object, record `uploaded`, announce it.

use crate::capabilities::Capabilities;
use crate::error::Result;
use crate::model::{ItemId, Metadata, ObjectLocation, StatusRecord, WorkItem};
use crate::retry::RetryingWriter;
use chrono::Utc;
use tracing::{info, instrument};

/// A work item as handed in by a caller, before it is stored
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    /// Caller-generated ID; a random one is assigned when absent
    pub item_id: Option<ItemId>,
    pub key: String,
    pub body: Vec<u8>,
    pub metadata: Metadata,
}

impl NewWorkItem {
    pub fn new(key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            item_id: None,
            key: key.into(),
            body,
            metadata: Metadata::new(),
        }
    }

    pub fn with_item_id(mut self, item_id: ItemId) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Writes uploads into the hot bucket and enqueues their job messages
pub struct Producer {
    capabilities: Capabilities,
    bucket: String,
    writer: RetryingWriter,
}

impl Producer {
    pub fn new(capabilities: Capabilities, bucket: impl Into<String>, writer: RetryingWriter) -> Self {
        Self {
            capabilities,
            bucket: bucket.into(),
            writer,
        }
    }

    /// Store the object, upsert its `uploaded` status, then enqueue.
    ///
    /// The message goes out last so a worker never sees an item whose
    /// object or status is missing.
    #[instrument(skip(self, item), fields(key = %item.key, size_bytes = item.body.len()))]
    pub async fn submit(&self, item: NewWorkItem) -> Result<WorkItem> {
        let NewWorkItem {
            item_id,
            key,
            body,
            metadata,
        } = item;

        let work_item = WorkItem {
            item_id: item_id.unwrap_or_default(),
            source: ObjectLocation::new(&self.bucket, key),
            metadata,
            created_at: Utc::now(),
        };

        let objects = &self.capabilities.objects;
        let source = &work_item.source;
        self.writer
            .write("put object", || objects.put(&source.bucket, &source.key, body.clone()))
            .await?;

        let record = StatusRecord::uploaded(work_item.item_id.clone(), work_item.metadata.clone());
        let status = &self.capabilities.status;
        self.writer
            .write("upsert uploaded status", || status.upsert(&record))
            .await?;

        let message = work_item.job_message().to_bytes()?;
        let queue = &self.capabilities.queue;
        let message_id = self
            .writer
            .write("enqueue job", || queue.enqueue(message.clone()))
            .await?;

        info!(
            item_id = %work_item.item_id,
            message_id = %message_id,
            source = %work_item.source,
            "Work item submitted"
        );
        metrics::counter!("pipeline.items.submitted").increment(1);

        Ok(work_item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::LocalCapabilities;
    use crate::model::{ItemState, JobMessage};
    use crate::queue::DurableQueue;
    use crate::retry::RetryPolicy;
    use crate::status::StatusStore;
    use std::time::Duration;

    fn producer(local: &LocalCapabilities) -> Producer {
        Producer::new(
            local.capabilities(),
            "uploads",
            RetryingWriter::new(RetryPolicy::immediate(3)),
        )
    }

    #[tokio::test]
    async fn test_submit_stores_records_and_enqueues() {
        let local = LocalCapabilities::new(Duration::from_secs(30), 3);
        let item = NewWorkItem::new("incoming/photo.jpg", b"jpeg".to_vec())
            .with_item_id(ItemId::from("X"))
            .with_metadata("original_name", "photo.jpg");

        let work_item = producer(&local).submit(item).await.unwrap();

        assert!(local.objects.contains("uploads", "incoming/photo.jpg"));

        let record = local.status.get(&ItemId::from("X")).await.unwrap().unwrap();
        assert_eq!(record.state, ItemState::Uploaded);
        assert_eq!(record.metadata["original_name"], "photo.jpg");

        let delivered = local.queue.receive(1, Duration::ZERO).await.unwrap();
        let job = JobMessage::from_bytes(&delivered[0].body).unwrap();
        assert_eq!(job, work_item.job_message());
    }

    #[tokio::test]
    async fn test_submit_retries_transient_status_failure() {
        let local = LocalCapabilities::new(Duration::from_secs(30), 3);
        local.status.fail_next_writes(2);

        let work_item = producer(&local)
            .submit(NewWorkItem::new("k", b"x".to_vec()))
            .await
            .unwrap();

        assert!(local.status.get(&work_item.item_id).await.unwrap().is_some());
        assert_eq!(local.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_does_not_enqueue_when_status_write_exhausted() {
        let local = LocalCapabilities::new(Duration::from_secs(30), 3);
        local.status.fail_next_writes(3);

        let err = producer(&local)
            .submit(NewWorkItem::new("k", b"x".to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::PipelineError::WriteExhausted { attempts: 3, .. }));
        assert!(local.queue.is_empty());
    }
}
