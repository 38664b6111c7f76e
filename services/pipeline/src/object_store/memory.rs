use super::{ListPage, ObjectStore};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Process-local object store. Buckets spring into existence on first write.
///
/// Continuation tokens are the last key of the previous page, so listings
/// stay consistent while keys are deleted mid-walk.
pub struct InMemoryObjectStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    page_size: usize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.buckets
            .read()
            .get(bucket)
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }

    /// All keys in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
            .ok_or_else(|| PipelineError::NotFound(format!("{bucket}/{key}")))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(objects) = self.buckets.write().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        let mut buckets = self.buckets.write();
        let body = buckets
            .get(src_bucket)
            .and_then(|objects| objects.get(src_key).cloned())
            .ok_or_else(|| PipelineError::NotFound(format!("{src_bucket}/{src_key}")))?;

        buckets
            .entry(dst_bucket.to_string())
            .or_default()
            .insert(dst_key.to_string(), body);
        Ok(())
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let buckets = self.buckets.read();
        let Some(objects) = buckets.get(bucket) else {
            return Ok(ListPage::default());
        };

        let mut keys = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation.as_deref().map_or(true, |after| k.as_str() > after));

        let page: Vec<String> = keys.by_ref().take(self.page_size).cloned().collect();
        let next_token = match (keys.next(), page.last()) {
            (Some(_), Some(last)) => Some(last.clone()),
            _ => None,
        };

        Ok(ListPage {
            keys: page,
            next_token,
        })
    }
}
