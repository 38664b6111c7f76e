//! Queue-driven processing worker.
//!
//! Each delivery walks the item through
//! `uploaded -> processing -> processed | error`:
//!
//! 1. parse the job message
//! 2. persist `processing`
//! 3. run the processor
//! 4. persist `processed` (merging the processor's metadata) or `error`
//! 5. publish a completion event
//! 6. acknowledge
//!
//! Status and notify writes go through the retrying writer. If they still
//! fail the message is left unacknowledged and the queue redelivers it (and
//! eventually dead-letters it). A processor failure is an outcome, not a
//! delivery failure: it is recorded and the message is acknowledged.

use crate::capabilities::Capabilities;
use crate::config::{NotifierConfig, QueueConfig};
use crate::error::Result;
use crate::model::{CompletionEvent, JobMessage, StatusUpdate};
use crate::processor::Processor;
use crate::queue::QueueMessage;
use crate::retry::{jittered_backoff, RetryingWriter};
use crate::status;
use backoff::backoff::Backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed, recorded, notified, acknowledged
    Processed,
    /// Processor failed; `error` recorded, notified, acknowledged
    Failed,
    /// Body could not be parsed; left for the queue to dead-letter
    Malformed,
    /// Bookkeeping or acknowledge failed; the queue will redeliver
    Unacknowledged,
}

/// Running totals for one worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub unacknowledged: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Malformed => self.malformed += 1,
            Outcome::Unacknowledged => self.unacknowledged += 1,
        }
    }
}

/// Polling and publishing settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Topic for completion events; publishing is skipped when unset
    pub topic: Option<String>,
    pub max_messages: usize,
    pub wait: Duration,
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
}

impl WorkerSettings {
    pub fn from_config(queue: &QueueConfig, notifier: &NotifierConfig) -> Self {
        Self {
            topic: notifier.topic_arn.clone(),
            max_messages: queue.max_messages.max(1) as usize,
            wait: Duration::from_secs(queue.wait_time_secs),
            idle_backoff_min: Duration::from_millis(queue.idle_backoff_min_ms),
            idle_backoff_max: Duration::from_millis(queue.idle_backoff_max_ms),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default(), &NotifierConfig::default())
    }
}

/// Single sequential consumer of the work queue
pub struct Worker {
    capabilities: Capabilities,
    processor: Arc<dyn Processor>,
    writer: RetryingWriter,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        capabilities: Capabilities,
        processor: Arc<dyn Processor>,
        writer: RetryingWriter,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            capabilities,
            processor,
            writer,
            settings,
        }
    }

    /// Consume until `shutdown` fires.
    ///
    /// Shutdown interrupts a pending receive or idle sleep, never an item in
    /// flight. Messages received but not started when shutdown arrives stay
    /// invisible until their visibility timeout and are then redelivered.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        let mut idle = jittered_backoff(self.settings.idle_backoff_min, self.settings.idle_backoff_max);

        info!(
            max_messages = self.settings.max_messages,
            wait_secs = self.settings.wait.as_secs(),
            "Starting message consumption loop"
        );

        'poll: loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.capabilities.queue.receive(self.settings.max_messages, self.settings.wait) => received,
            };

            let messages = match received {
                Ok(messages) if messages.is_empty() => {
                    let delay = idle.next_backoff().unwrap_or(self.settings.idle_backoff_max);
                    debug!(delay_ms = delay.as_millis() as u64, "Queue empty, backing off");
                    if sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "Queue receive failed");
                    metrics::counter!("pipeline.messages.receive_errors").increment(1);
                    let delay = idle.next_backoff().unwrap_or(self.settings.idle_backoff_max);
                    if sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            idle.reset();
            let total = messages.len();

            for (handled, message) in messages.into_iter().enumerate() {
                if shutdown.is_cancelled() {
                    info!(
                        left_for_redelivery = total - handled,
                        "Stop requested between items"
                    );
                    break 'poll;
                }
                let outcome = self.handle(message).await;
                stats.record(&outcome);
            }
        }

        self.report_dead_letter_depth().await;
        info!(?stats, "Consumption loop stopped");
        Ok(stats)
    }

    /// One receive; every delivered message is handled before returning
    pub async fn poll_once(&self) -> Result<Vec<Outcome>> {
        let messages = self
            .capabilities
            .queue
            .receive(self.settings.max_messages, self.settings.wait)
            .await?;

        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.handle(message).await);
        }
        Ok(outcomes)
    }

    /// Drive one delivery through the state machine
    #[instrument(skip(self, message), fields(message_id = %message.message_id, receive_count = message.receive_count))]
    pub async fn handle(&self, message: QueueMessage) -> Outcome {
        metrics::counter!("pipeline.messages.received").increment(1);

        let job = match JobMessage::from_bytes(&message.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Malformed job message, leaving it for the dead-letter queue");
                metrics::counter!("pipeline.messages.malformed").increment(1);
                return Outcome::Malformed;
            }
        };

        let started = Instant::now();
        let outcome = match self.process_job(&job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(item_id = %job.item_id, error = %e, "Bookkeeping failed, message will be redelivered");
                metrics::counter!("pipeline.messages.unacknowledged").increment(1);
                return Outcome::Unacknowledged;
            }
        };

        let queue = &self.capabilities.queue;
        let receipt = &message.receipt_handle;
        if let Err(e) = self.writer.write("acknowledge", || queue.acknowledge(receipt)).await {
            error!(item_id = %job.item_id, error = %e, "Acknowledge failed, message will be redelivered");
            metrics::counter!("pipeline.messages.unacknowledged").increment(1);
            return Outcome::Unacknowledged;
        }

        metrics::counter!("pipeline.messages.acknowledged").increment(1);
        metrics::histogram!("pipeline.items.duration_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Steps 2 to 5. `Err` means the outcome could not be durably recorded.
    async fn process_job(&self, job: &JobMessage) -> Result<Outcome> {
        let statuses = self.capabilities.status.as_ref();
        let item_id = &job.item_id;

        self.writer
            .write("record processing", || {
                status::transition(statuses, item_id, StatusUpdate::processing())
            })
            .await?;

        let (update, outcome, produced) =
            match self.processor.process(job, self.capabilities.objects.as_ref()).await {
                Ok(metadata) => {
                    info!(item_id = %item_id, "Item processed");
                    metrics::counter!("pipeline.items.processed").increment(1);
                    (StatusUpdate::processed(metadata.clone()), Outcome::Processed, metadata)
                }
                Err(e) => {
                    warn!(item_id = %item_id, error = %e, "Processing failed, recording error");
                    metrics::counter!("pipeline.items.failed").increment(1);
                    (StatusUpdate::error(e.to_string()), Outcome::Failed, Default::default())
                }
            };

        let record = self
            .writer
            .write("record outcome", || {
                status::transition(statuses, item_id, update.clone())
            })
            .await?;

        if let Some(topic) = &self.settings.topic {
            let event = CompletionEvent::from_record(&record, produced);
            let notifier = &self.capabilities.notifier;
            self.writer
                .write("publish completion", || notifier.publish(topic, &event))
                .await?;
        } else {
            debug!(item_id = %item_id, "No notification topic configured");
        }

        Ok(outcome)
    }

    async fn report_dead_letter_depth(&self) {
        match self.capabilities.queue.dead_letter_depth().await {
            Ok(Some(depth)) => {
                metrics::gauge!("pipeline.dead_letter.depth").set(depth as f64);
                if depth > 0 {
                    warn!(depth, "Dead-letter queue is not empty");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Could not read dead-letter depth"),
        }
    }
}

/// Returns true when cancelled before the delay elapsed
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
