//! Core data model.
//!
//! A work item is an object sitting in the hot bucket that needs processing.
//! Queue messages reference it by `item_id` plus its location; the status
//! store tracks where it is in its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque caller/processing metadata. Merged additively on status updates.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Work item
// ---------------------------------------------------------------------------

/// Newtype for work item IDs. Caller-generated, globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Bucket + key address of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// An uploaded object awaiting processing. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: ItemId,
    pub source: ObjectLocation,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Reference carried by queue messages
    pub fn job_message(&self) -> JobMessage {
        JobMessage {
            item_id: self.item_id.clone(),
            bucket: self.source.bucket.clone(),
            key: self.source.key.clone(),
            submitted_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue envelope
// ---------------------------------------------------------------------------

/// JSON body of every queue message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub item_id: ItemId,
    pub bucket: String,
    pub key: String,
    pub submitted_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn source(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.key)
    }

    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(body: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Object stored and message enqueued.
    Uploaded,
    /// A worker has dequeued the item and is running the transformation.
    Processing,
    /// Done successfully. Terminal.
    Processed,
    /// Transformation failed for this delivery. Terminal until replayed.
    Error,
}

impl ItemState {
    /// Can transition from self to `to`?
    ///
    /// Terminal states may re-enter `Processing` because redelivery and
    /// replay reprocess the same item.
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Uploaded, Processing)
                | (Processing, Processed)
                | (Processing, Error)
                | (Processing, Processing) // redelivered after a crash
                | (Processed, Processing)
                | (Error, Processing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Uploaded => "uploaded",
            ItemState::Processing => "processing",
            ItemState::Processed => "processed",
            ItemState::Error => "error",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = crate::error::PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(ItemState::Uploaded),
            "processing" => Ok(ItemState::Processing),
            "processed" => Ok(ItemState::Processed),
            "error" => Ok(ItemState::Error),
            other => Err(crate::error::PipelineError::Malformed(format!(
                "unknown item state: {other}"
            ))),
        }
    }
}

/// One row per item in the status store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub item_id: ItemId,
    pub state: ItemState,
    #[serde(default)]
    pub metadata: Metadata,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    /// Initial record written by the producer
    pub fn uploaded(item_id: ItemId, metadata: Metadata) -> Self {
        Self {
            item_id,
            state: ItemState::Uploaded,
            metadata,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Same record with observable content only, for idempotence checks
    pub fn same_outcome(&self, other: &StatusRecord) -> bool {
        self.item_id == other.item_id
            && self.state == other.state
            && self.metadata == other.metadata
            && self.last_error == other.last_error
    }
}

/// A state change to apply to a status record
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub state: ItemState,
    /// Merged key-by-key into the existing metadata
    pub metadata: Metadata,
    /// Replaces `last_error`; `None` clears it
    pub last_error: Option<String>,
}

impl StatusUpdate {
    pub fn processing() -> Self {
        Self {
            state: ItemState::Processing,
            metadata: Metadata::new(),
            last_error: None,
        }
    }

    pub fn processed(metadata: Metadata) -> Self {
        Self {
            state: ItemState::Processed,
            metadata,
            last_error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: ItemState::Error,
            metadata: Metadata::new(),
            last_error: Some(message.into()),
        }
    }

    /// Apply to an existing record (or start a fresh one)
    pub fn apply(self, item_id: &ItemId, existing: Option<StatusRecord>) -> StatusRecord {
        let mut metadata = existing.map(|r| r.metadata).unwrap_or_default();
        for (k, v) in self.metadata {
            metadata.insert(k, v);
        }

        StatusRecord {
            item_id: item_id.clone(),
            state: self.state,
            metadata,
            last_error: self.last_error,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Event fanned out after an item reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub item_id: ItemId,
    pub state: ItemState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn from_record(record: &StatusRecord, metadata: Metadata) -> Self {
        Self {
            item_id: record.item_id.clone(),
            state: record.state,
            error: record.last_error.clone(),
            metadata,
            timestamp: Utc::now(),
        }
    }
}
