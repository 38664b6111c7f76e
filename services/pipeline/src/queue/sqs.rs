use super::{DurableQueue, QueueMessage, ReceiptHandle};
use crate::aws::classify;
use crate::config::QueueConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::error::ProvideErrorMetadata;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// SQS caps a single receive at 10 messages and a long poll at 20 seconds
const MAX_BATCH: usize = 10;
const MAX_WAIT_SECS: u64 = 20;

const INVALID_RECEIPT_CODES: &[&str] = &[
    "ReceiptHandleIsInvalid",
    "AWS.SimpleQueueService.ReceiptHandleIsInvalid",
];

/// Durable queue backed by SQS. Redrive to the dead-letter queue is the
/// queue's own `RedrivePolicy`; see [`provision_queues`].
pub struct SqsQueue {
    client: SqsClient,
    queue_url: String,
    dead_letter_queue_url: Option<String>,
    visibility_timeout_secs: i32,
}

impl SqsQueue {
    pub fn new(
        client: SqsClient,
        queue_url: impl Into<String>,
        dead_letter_queue_url: Option<String>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            dead_letter_queue_url,
            visibility_timeout_secs: config.visibility_timeout_secs as i32,
        }
    }

    /// Build from configuration, resolving queue URLs by name when they are
    /// not given explicitly
    pub async fn connect(sdk_config: &SdkConfig, config: &QueueConfig) -> Result<Self> {
        let client = SqsClient::new(sdk_config);

        let queue_url = match &config.queue_url {
            Some(url) => url.clone(),
            None => queue_url_for(&client, &config.queue_name).await?,
        };

        let dead_letter_queue_url = match &config.dead_letter_queue_url {
            Some(url) => Some(url.clone()),
            None => match queue_url_for(&client, &config.dead_letter_queue_name).await {
                Ok(url) => Some(url),
                Err(e) if e.is_not_found() => {
                    warn!(
                        queue = %config.dead_letter_queue_name,
                        "Dead-letter queue not found, depth will not be reported"
                    );
                    None
                }
                Err(e) => return Err(e),
            },
        };

        info!(queue_url = %queue_url, "SQS queue connected");
        Ok(Self::new(client, queue_url, dead_letter_queue_url, config))
    }
}

#[async_trait]
impl DurableQueue for SqsQueue {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn enqueue(&self, body: Vec<u8>) -> Result<String> {
        let body = String::from_utf8(body)
            .map_err(|e| PipelineError::Malformed(format!("queue body is not UTF-8: {e}")))?;

        let response = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| classify("send_message", &self.queue_url, e))?;

        let message_id = response.message_id().unwrap_or_default().to_string();
        debug!(message_id = %message_id, "Message enqueued");
        Ok(message_id)
    }

    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, MAX_BATCH) as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| classify("receive_message", &self.queue_url, e))?;

        let messages = response
            .messages()
            .iter()
            .filter_map(|m| {
                let Some(receipt) = m.receipt_handle() else {
                    warn!(message_id = ?m.message_id(), "Message without receipt handle skipped");
                    return None;
                };

                let receive_count = m
                    .attributes()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);

                Some(QueueMessage {
                    message_id: m.message_id().unwrap_or_default().to_string(),
                    body: m.body().unwrap_or_default().as_bytes().to_vec(),
                    receipt_handle: ReceiptHandle(receipt.to_string()),
                    receive_count,
                })
            })
            .collect();

        Ok(messages)
    }

    #[instrument(skip(self))]
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<()> {
        let result = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&receipt.0)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code().is_some_and(|c| INVALID_RECEIPT_CODES.contains(&c)) => {
                debug!("Acknowledge for stale receipt ignored");
                Ok(())
            }
            Err(e) => Err(classify("delete_message", &self.queue_url, e)),
        }
    }

    async fn dead_letter_depth(&self) -> Result<Option<u64>> {
        let Some(dlq_url) = &self.dead_letter_queue_url else {
            return Ok(None);
        };

        let response = self
            .client
            .get_queue_attributes()
            .queue_url(dlq_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| classify("get_queue_attributes", dlq_url, e))?;

        let depth = response
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|n| n.parse().ok());

        Ok(depth)
    }
}

async fn queue_url_for(client: &SqsClient, name: &str) -> Result<String> {
    let response = client
        .get_queue_url()
        .queue_name(name)
        .send()
        .await
        .map_err(|e| classify("get_queue_url", name, e))?;

    response
        .queue_url()
        .map(String::from)
        .ok_or_else(|| PipelineError::NotFound(format!("queue url for {name}")))
}

/// URLs of a provisioned work queue and its dead-letter queue
#[derive(Debug, Clone)]
pub struct ProvisionedQueues {
    pub queue_url: String,
    pub dead_letter_queue_url: String,
}

/// Create the dead-letter queue, then the work queue with a redrive policy
/// pointing at it. Safe to run against queues that already exist.
pub async fn provision_queues(client: &SqsClient, config: &QueueConfig) -> Result<ProvisionedQueues> {
    let dead_letter_queue_url = create_or_get(client, &config.dead_letter_queue_name, &[]).await?;

    let attributes = client
        .get_queue_attributes()
        .queue_url(&dead_letter_queue_url)
        .attribute_names(QueueAttributeName::QueueArn)
        .send()
        .await
        .map_err(|e| classify("get_queue_attributes", &dead_letter_queue_url, e))?;

    let dead_letter_arn = attributes
        .attributes()
        .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
        .cloned()
        .ok_or_else(|| {
            PipelineError::NotFound(format!("arn for {}", config.dead_letter_queue_name))
        })?;

    let redrive = redrive_policy(&dead_letter_arn, config.max_delivery_attempts);
    let queue_url = create_or_get(
        client,
        &config.queue_name,
        &[
            (QueueAttributeName::RedrivePolicy, redrive),
            (
                QueueAttributeName::VisibilityTimeout,
                config.visibility_timeout_secs.to_string(),
            ),
        ],
    )
    .await?;

    info!(
        queue_url = %queue_url,
        dead_letter_queue_url = %dead_letter_queue_url,
        max_receive_count = config.max_delivery_attempts,
        "Queues provisioned"
    );

    Ok(ProvisionedQueues {
        queue_url,
        dead_letter_queue_url,
    })
}

async fn create_or_get(
    client: &SqsClient,
    name: &str,
    attributes: &[(QueueAttributeName, String)],
) -> Result<String> {
    let mut request = client.create_queue().queue_name(name);
    for (attribute, value) in attributes {
        request = request.attributes(attribute.clone(), value);
    }

    match request.send().await {
        Ok(response) => response
            .queue_url()
            .map(String::from)
            .ok_or_else(|| PipelineError::NotFound(format!("queue url for {name}"))),
        Err(e) if e.code() == Some("QueueAlreadyExists") => {
            warn!(queue = name, "Queue exists with different attributes, reusing it");
            queue_url_for(client, name).await
        }
        Err(e) => Err(classify("create_queue", name, e)),
    }
}

fn redrive_policy(dead_letter_arn: &str, max_receive_count: u32) -> String {
    serde_json::json!({
        "deadLetterTargetArn": dead_letter_arn,
        "maxReceiveCount": max_receive_count.to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redrive_policy_document() {
        let policy = redrive_policy("arn:aws:sqs:us-east-1:000000000000:parcel-dlq", 3);
        let parsed: serde_json::Value = serde_json::from_str(&policy).unwrap();

        assert_eq!(
            parsed["deadLetterTargetArn"],
            "arn:aws:sqs:us-east-1:000000000000:parcel-dlq"
        );
        assert_eq!(parsed["maxReceiveCount"], "3");
    }
}
