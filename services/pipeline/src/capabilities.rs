use crate::notify::{Notifier, RecordingNotifier};
use crate::object_store::{InMemoryObjectStore, ObjectStore};
use crate::queue::{DurableQueue, InMemoryQueue};
use crate::status::{InMemoryStatusStore, StatusStore};
use std::sync::Arc;
use std::time::Duration;

/// The external services a pipeline component talks to, injected at
/// construction
#[derive(Clone)]
pub struct Capabilities {
    pub objects: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn DurableQueue>,
    pub status: Arc<dyn StatusStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Concrete in-memory adapters behind a [`Capabilities`], kept so callers
/// can inspect them
#[derive(Clone)]
pub struct LocalCapabilities {
    pub objects: Arc<InMemoryObjectStore>,
    pub queue: Arc<InMemoryQueue>,
    pub status: Arc<InMemoryStatusStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl LocalCapabilities {
    pub fn new(visibility_timeout: Duration, max_delivery_attempts: u32) -> Self {
        Self {
            objects: Arc::new(InMemoryObjectStore::new()),
            queue: Arc::new(InMemoryQueue::new(visibility_timeout, max_delivery_attempts)),
            status: Arc::new(InMemoryStatusStore::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            objects: self.objects.clone(),
            queue: self.queue.clone(),
            status: self.status.clone(),
            notifier: self.notifier.clone(),
        }
    }
}
