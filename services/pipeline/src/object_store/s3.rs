use super::{ListPage, ObjectStore};
use crate::aws::classify;
use crate::config::{AwsConfig, StorageConfig};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};

/// Object store backed by S3 (or any S3-compatible endpoint)
pub struct S3ObjectStore {
    client: S3Client,
    page_size: i32,
}

impl S3ObjectStore {
    /// Create a new S3 object store from the shared SDK configuration
    pub fn new(sdk_config: &SdkConfig, aws: &AwsConfig, storage: &StorageConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Force path-style access for MinIO/LocalStack compatibility
        if aws.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %aws.region,
            hot_bucket = %storage.hot_bucket,
            cold_bucket = %storage.cold_bucket,
            "S3 object store initialized"
        );

        Self {
            client,
            page_size: storage.list_page_size,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| classify("put_object", &target(bucket, key), e))?;

        debug!(bucket, key, "Object stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("get_object", &target(bucket, key), e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| PipelineError::transient(format!("read body {bucket}/{key}"), e))?;

        Ok(body.into_bytes().to_vec())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("delete_object", &target(bucket, key), e))?;

        debug!(bucket, key, "Object deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        self.client
            .copy_object()
            .copy_source(format!("{}/{}", src_bucket, encode_copy_source(src_key)))
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| classify("copy_object", &target(src_bucket, src_key), e))?;

        debug!(src_bucket, src_key, dst_bucket, dst_key, "Object copied");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(self.page_size)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| classify("list_objects_v2", &target(bucket, prefix), e))?;

        let keys: Vec<String> = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(String::from)
        } else {
            None
        };

        Ok(ListPage { keys, next_token })
    }
}

fn target(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

/// Percent-encode a key for the `x-amz-copy-source` header, keeping `/`
fn encode_copy_source(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Get content type from the key's extension
fn content_type_for(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    match extension.as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
