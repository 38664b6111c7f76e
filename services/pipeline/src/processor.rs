//! Pluggable transformation invoked by the worker for each item.
//!
//! The worker only cares that a processor returns metadata to merge into the
//! status record, or an error to record as `lastError`. What the
//! transformation does to the object is up to the implementation.

use crate::error::{PipelineError, Result};
use crate::model::{JobMessage, Metadata};
use crate::object_store::ObjectStore;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Processes one work item. Must be idempotent: running it twice on the
/// same item yields the same metadata and the same stored objects.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &JobMessage, objects: &dyn ObjectStore) -> Result<Metadata>;
}

/// Closure-based processor over the object's bytes
pub struct FnProcessor<F>
where
    F: Fn(&JobMessage, &[u8]) -> Result<Metadata> + Send + Sync,
{
    handler: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&JobMessage, &[u8]) -> Result<Metadata> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&JobMessage, &[u8]) -> Result<Metadata> + Send + Sync,
{
    async fn process(&self, job: &JobMessage, objects: &dyn ObjectStore) -> Result<Metadata> {
        let body = objects.get(&job.bucket, &job.key).await?;
        (self.handler)(job, &body)
    }
}

/// Records basic facts about the object and writes nothing back.
/// Empty objects are rejected.
#[derive(Debug, Default, Clone)]
pub struct InspectProcessor;

#[async_trait]
impl Processor for InspectProcessor {
    async fn process(&self, job: &JobMessage, objects: &dyn ObjectStore) -> Result<Metadata> {
        let body = objects.get(&job.bucket, &job.key).await?;
        if body.is_empty() {
            return Err(PipelineError::Processing(format!(
                "{} is empty",
                job.source()
            )));
        }

        let mut metadata = Metadata::new();
        metadata.insert("size_bytes".into(), Value::from(body.len()));
        metadata.insert("format".into(), Value::from(sniff_format(&body)));

        debug!(item_id = %job.item_id, size_bytes = body.len(), "Object inspected");
        Ok(metadata)
    }
}

/// Identify a handful of common formats by magic bytes
fn sniff_format(body: &[u8]) -> &'static str {
    match body {
        [0xFF, 0xD8, 0xFF, ..] => "jpeg",
        [0x89, b'P', b'N', b'G', ..] => "png",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        [b'%', b'P', b'D', b'F', ..] => "pdf",
        _ if std::str::from_utf8(body).is_ok() => "text",
        _ => "binary",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemId;
    use crate::object_store::InMemoryObjectStore;
    use chrono::Utc;

    fn job(key: &str) -> JobMessage {
        JobMessage {
            item_id: ItemId::from("item-1"),
            bucket: "uploads".into(),
            key: key.into(),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_inspect_records_size_and_format() {
        let store = InMemoryObjectStore::new();
        store
            .put("uploads", "a.png", vec![0x89, b'P', b'N', b'G', 0, 0])
            .await
            .unwrap();

        let meta = InspectProcessor.process(&job("a.png"), &store).await.unwrap();

        assert_eq!(meta["size_bytes"], 6);
        assert_eq!(meta["format"], "png");
    }

    #[tokio::test]
    async fn test_inspect_rejects_empty_and_missing_objects() {
        let store = InMemoryObjectStore::new();
        store.put("uploads", "empty", vec![]).await.unwrap();

        let err = InspectProcessor.process(&job("empty"), &store).await.unwrap_err();
        assert!(matches!(err, PipelineError::Processing(_)));

        let err = InspectProcessor.process(&job("missing"), &store).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fn_processor_sees_object_bytes() {
        let store = InMemoryObjectStore::new();
        store.put("uploads", "k", b"abc".to_vec()).await.unwrap();

        let processor = FnProcessor::new(|_: &JobMessage, body: &[u8]| {
            let mut meta = Metadata::new();
            meta.insert("len".into(), Value::from(body.len()));
            Ok(meta)
        });

        let meta = processor.process(&job("k"), &store).await.unwrap();
        assert_eq!(meta["len"], 3);
    }

    #[test]
    fn test_sniff_format() {
        assert_eq!(sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0]), "jpeg");
        assert_eq!(sniff_format(b"order_id,product\n"), "text");
        assert_eq!(sniff_format(&[0x00, 0xFF, 0xFE]), "binary");
    }
}
