//! Durable queue capability.
//!
//! At-least-once delivery: a received message stays invisible to other
//! consumers for the visibility timeout and reappears unless acknowledged.
//! After `max_delivery_attempts` receives the queue itself moves it to a
//! dead-letter channel; consumers never see that happen.

mod memory;
mod sqs;

pub use memory::InMemoryQueue;
pub use sqs::{provision_queues, ProvisionedQueues, SqsQueue};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Opaque token identifying one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivered message
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub receipt_handle: ReceiptHandle,
    /// How many times this message has been delivered, including this one
    pub receive_count: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Returns the message ID
    async fn enqueue(&self, body: Vec<u8>) -> Result<String>;

    /// Long poll: returns as soon as at least one message is available, or an
    /// empty list once `wait` has elapsed
    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

    /// Idempotent. Unknown or already-deleted handles are a no-op.
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<()>;

    /// Approximate dead-letter depth, `None` when no dead-letter channel is
    /// configured for observation
    async fn dead_letter_depth(&self) -> Result<Option<u64>>;
}
