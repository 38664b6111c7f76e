use super::Notifier;
use crate::aws::classify;
use crate::error::Result;
use crate::model::CompletionEvent;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sns::types::MessageAttributeValue;
use aws_sdk_sns::Client as SnsClient;
use tracing::{debug, instrument};

/// Publishes completion events as JSON to an SNS topic.
///
/// The item state is also sent as a message attribute so subscribers can
/// filter on it.
pub struct SnsNotifier {
    client: SnsClient,
}

impl SnsNotifier {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: SnsClient::new(sdk_config),
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    #[instrument(skip(self, event), fields(item_id = %event.item_id, state = %event.state))]
    async fn publish(&self, topic: &str, event: &CompletionEvent) -> Result<String> {
        let message = serde_json::to_string(event)?;

        let state = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(event.state.as_str())
            .build()
            .map_err(|e| crate::error::PipelineError::Config(e.to_string()))?;

        let response = self
            .client
            .publish()
            .topic_arn(topic)
            .message(message)
            .message_attributes("state", state)
            .send()
            .await
            .map_err(|e| classify("publish", topic, e))?;

        let message_id = response.message_id().unwrap_or_default().to_string();
        debug!(message_id = %message_id, "Completion event published");
        Ok(message_id)
    }
}
