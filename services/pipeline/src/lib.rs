//! Parcel Pipeline
//!
//! Durable, queue-driven job processing with a storage lifecycle. Producers
//! drop work items into object storage and announce them on a queue; workers
//! pull announcements, run a pluggable processor, record a status per item
//! and fan out completion events. A lifecycle mover relocates aged,
//! date-partitioned objects from the hot bucket to a cold archive.
//!
//! ## Features
//!
//! - **At-least-once consumption**: messages are acknowledged only after the
//!   outcome is durably recorded; the queue redrives poison messages to a
//!   dead-letter queue
//! - **Per-item status**: `uploaded -> processing -> processed | error`, with
//!   additive metadata merges
//! - **Bounded retries**: transient write failures are retried with jittered
//!   exponential backoff
//! - **Date-partitioned reports**: daily CSV partitions per product, range
//!   queries that skip missing days, copy-then-delete archival
//!
//! ## Architecture
//!
//! ```text
//!  Producer                  Hot Bucket               Cold Bucket
//! ┌──────────────┐   put    ┌──────────────┐  copy   ┌──────────────┐
//! │ submit()     │─────────▶│ uploads/     │────────▶│ daily_       │
//! └──────────────┘          │ daily_       │ delete  │   reports/   │
//!    │       │              │   reports/   │◀─ ─ ─ ─ └──────────────┘
//!    │       │ enqueue      └──────────────┘    ▲
//!    │       ▼                     │ get         │
//!    │  ┌──────────────┐           ▼             │
//!    │  │ Work Queue   │    ┌──────────────┐  ┌──────────────┐
//!    │  │  └▶ DLQ      │───▶│ Worker       │  │ Lifecycle    │
//!    │  └──────────────┘    │  Processor   │  │ Mover        │
//!    │                      └──────────────┘  └──────────────┘
//!    │ uploaded                │        │
//!    ▼                         ▼        ▼
//! ┌──────────────┐  status  ┌──────┐ ┌──────────────┐
//! │ Status Store │◀─────────┘      │ │ Notifier     │
//! └──────────────┘                 │ └──────────────┘
//!                                  └─ acknowledge
//! ```
//!
//! Every external service sits behind a trait ([`ObjectStore`],
//! [`DurableQueue`], [`StatusStore`], [`Notifier`]) with an AWS or Postgres
//! adapter and an in-memory one.

pub mod api;
pub mod aws;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod object_store;
pub mod processor;
pub mod producer;
pub mod queue;
pub mod reports;
pub mod retry;
pub mod status;
pub mod worker;

pub use capabilities::{Capabilities, LocalCapabilities};
pub use config::Config;
pub use error::{PipelineError, Result};
pub use lifecycle::{LifecycleMover, SweepReport};
pub use model::{
    CompletionEvent, ItemId, ItemState, JobMessage, Metadata, ObjectLocation, StatusRecord,
    StatusUpdate, WorkItem,
};
pub use notify::{Notifier, RecordingNotifier, SnsNotifier};
pub use object_store::{InMemoryObjectStore, ObjectStore, S3ObjectStore};
pub use processor::{FnProcessor, InspectProcessor, Processor};
pub use producer::{NewWorkItem, Producer};
pub use queue::{DurableQueue, InMemoryQueue, QueueMessage, ReceiptHandle, SqsQueue};
pub use reports::{DailyRevenue, MonthlySummary, Order, ReportEntry, ReportStore};
pub use retry::{RetryPolicy, RetryingWriter};
pub use status::{InMemoryStatusStore, PgStatusStore, StatusStore};
pub use worker::{Outcome, Worker, WorkerSettings, WorkerStats};
