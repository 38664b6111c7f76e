use super::{DurableQueue, QueueMessage, ReceiptHandle};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

struct Entry {
    message_id: String,
    body: Vec<u8>,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

#[derive(Default)]
struct State {
    messages: VecDeque<Entry>,
    dead_letters: Vec<Entry>,
}

/// Process-local queue with visibility timeout and dead-letter redrive
pub struct InMemoryQueue {
    state: Mutex<State>,
    arrivals: Notify,
    visibility_timeout: Duration,
    max_delivery_attempts: u32,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration, max_delivery_attempts: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            visibility_timeout,
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    /// Messages not yet acknowledged or dead-lettered, including in-flight ones
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of dead-lettered messages, oldest first
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .dead_letters
            .iter()
            .map(|e| e.body.clone())
            .collect()
    }

    /// Deliver up to `max` visible messages; redrive exhausted ones first.
    /// Returns the deliveries and the earliest moment an invisible message
    /// becomes visible again.
    fn take_visible(&self, max: usize) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut delivered = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut i = 0;

        while i < state.messages.len() && delivered.len() < max {
            let entry = &mut state.messages[i];

            if !entry.is_visible(now) {
                next_visible = match (next_visible, entry.invisible_until) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                i += 1;
                continue;
            }

            if entry.receive_count >= self.max_delivery_attempts {
                if let Some(dead) = state.messages.remove(i) {
                    warn!(
                        message_id = %dead.message_id,
                        receive_count = dead.receive_count,
                        "Message exceeded delivery attempts, moved to dead-letter queue"
                    );
                    state.dead_letters.push(dead);
                }
                continue;
            }

            let receipt = format!("{}:{}", entry.message_id, Uuid::new_v4());
            entry.receive_count += 1;
            entry.invisible_until = Some(now + self.visibility_timeout);
            entry.receipt = Some(receipt.clone());

            delivered.push(QueueMessage {
                message_id: entry.message_id.clone(),
                body: entry.body.clone(),
                receipt_handle: ReceiptHandle(receipt),
                receive_count: entry.receive_count,
            });
            i += 1;
        }

        (delivered, next_visible)
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, body: Vec<u8>) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        self.state.lock().messages.push_back(Entry {
            message_id: message_id.clone(),
            body,
            receive_count: 0,
            invisible_until: None,
            receipt: None,
        });
        self.arrivals.notify_waiters();

        debug!(message_id = %message_id, "Message enqueued");
        Ok(message_id)
    }

    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait;
        let max = max_messages.max(1);

        loop {
            // Register before checking so an enqueue in between is not missed
            let arrival = self.arrivals.notified();
            let (delivered, next_visible) = self.take_visible(max);

            if !delivered.is_empty() {
                return Ok(delivered);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<()> {
        let mut state = self.state.lock();
        let position = state
            .messages
            .iter()
            .position(|e| e.receipt.as_deref() == Some(receipt.0.as_str()));

        match position {
            Some(i) => {
                state.messages.remove(i);
                debug!(receipt = %receipt, "Message acknowledged");
            }
            None => debug!(receipt = %receipt, "Acknowledge for unknown receipt ignored"),
        }
        Ok(())
    }

    async fn dead_letter_depth(&self) -> Result<Option<u64>> {
        Ok(Some(self.state.lock().dead_letters.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InMemoryQueue {
        InMemoryQueue::new(Duration::from_secs(30), 3)
    }

    #[tokio::test]
    async fn test_received_message_is_invisible_until_timeout() {
        let q = queue();
        q.enqueue(b"a".to_vec()).await.unwrap();

        let first = q.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        let second = q.receive(1, Duration::ZERO).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_is_redelivered() {
        let q = queue();
        q.enqueue(b"a".to_vec()).await.unwrap();
        let first = q.receive(1, Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        let again = q.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_after_max_delivery_attempts() {
        let q = queue();
        q.enqueue(b"poison".to_vec()).await.unwrap();

        for attempt in 1..=3 {
            let got = q.receive(1, Duration::ZERO).await.unwrap();
            assert_eq!(got[0].receive_count, attempt);
            tokio::time::advance(Duration::from_secs(31)).await;
        }

        let got = q.receive(1, Duration::ZERO).await.unwrap();
        assert!(got.is_empty());
        assert!(q.is_empty());
        assert_eq!(q.dead_letters(), vec![b"poison".to_vec()]);
        assert_eq!(q.dead_letter_depth().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let q = queue();
        q.enqueue(b"a".to_vec()).await.unwrap();
        let msg = q.receive(1, Duration::ZERO).await.unwrap().remove(0);

        q.acknowledge(&msg.receipt_handle).await.unwrap();
        q.acknowledge(&msg.receipt_handle).await.unwrap();
        q.acknowledge(&ReceiptHandle("never-issued".into())).await.unwrap();

        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let q = queue();
        let started = Instant::now();

        let got = q.receive(1, Duration::from_secs(5)).await.unwrap();

        assert!(got.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_enqueue() {
        let q = std::sync::Arc::new(queue());
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            producer.enqueue(b"late".to_vec()).await.unwrap();
        });

        let started = Instant::now();
        let got = q.receive(1, Duration::from_secs(20)).await.unwrap();

        assert_eq!(got.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_receive_respects_max_messages() {
        let q = queue();
        for i in 0..5u8 {
            q.enqueue(vec![i]).await.unwrap();
        }

        let got = q.receive(3, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(q.len(), 5);
    }
}
