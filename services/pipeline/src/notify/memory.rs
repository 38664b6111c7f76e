use super::Notifier;
use crate::error::{PipelineError, Result};
use crate::model::CompletionEvent;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Keeps every published event in memory, in publish order
#[derive(Default)]
pub struct RecordingNotifier {
    published: Mutex<Vec<(String, CompletionEvent)>>,
    pending_failures: Mutex<u32>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with a transient error
    pub fn fail_next_publishes(&self, n: u32) {
        *self.pending_failures.lock() = n;
    }

    pub fn events(&self) -> Vec<CompletionEvent> {
        self.published.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn published(&self) -> Vec<(String, CompletionEvent)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, topic: &str, event: &CompletionEvent) -> Result<String> {
        {
            let mut pending = self.pending_failures.lock();
            if *pending > 0 {
                *pending -= 1;
                return Err(PipelineError::transient(
                    format!("publish {topic}"),
                    "injected failure",
                ));
            }
        }

        let mut published = self.published.lock();
        published.push((topic.to_string(), event.clone()));
        Ok(format!("local-{}", published.len()))
    }
}
