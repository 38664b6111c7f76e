//! Completion fan-out.

mod memory;
mod sns;

pub use memory::RecordingNotifier;
pub use sns::SnsNotifier;

use crate::error::Result;
use crate::model::CompletionEvent;
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish `event` to `topic`, returning the publish ID
    async fn publish(&self, topic: &str, event: &CompletionEvent) -> Result<String>;
}
