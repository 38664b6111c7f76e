//! Object store capability: byte blobs addressed by bucket + key.

mod memory;
mod s3;

pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

/// One page of a prefix listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Token for the following page; `None` on the last page
    pub next_token: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// Fails with `NotFound` when the key is absent
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Deleting an absent key succeeds
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Server-side copy. Fails with `NotFound` when the source is absent.
    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()>;

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage>;
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Every key under `prefix`, fetched page by page as the stream is polled
pub fn list_keys<'a>(
    store: &'a dyn ObjectStore,
    bucket: &'a str,
    prefix: &'a str,
) -> BoxStream<'a, Result<String>> {
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let token = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
        };

        let page = store.list_page(bucket, prefix, token).await?;
        let next = match page.next_token {
            Some(token) => Cursor::Next(token),
            None => Cursor::Done,
        };

        let keys = stream::iter(page.keys.into_iter().map(Ok::<String, PipelineError>));
        Ok::<_, PipelineError>(Some((keys, next)))
    })
    .try_flatten()
    .boxed()
}
