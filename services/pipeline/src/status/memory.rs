use super::StatusStore;
use crate::error::{PipelineError, Result};
use crate::model::{ItemId, ItemState, StatusRecord};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Process-local status store.
///
/// `fail_next_writes` injects transient upsert failures so retry paths can
/// be exercised without a database.
#[derive(Default)]
pub struct InMemoryStatusStore {
    records: RwLock<HashMap<ItemId, StatusRecord>>,
    pending_failures: Mutex<u32>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upserts fail with a transient error
    pub fn fail_next_writes(&self, n: u32) {
        *self.pending_failures.lock() = n;
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn upsert(&self, record: &StatusRecord) -> Result<()> {
        {
            let mut pending = self.pending_failures.lock();
            if *pending > 0 {
                *pending -= 1;
                return Err(PipelineError::transient(
                    format!("upsert status {}", record.item_id),
                    "injected failure",
                ));
            }
        }

        self.records
            .write()
            .insert(record.item_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, item_id: &ItemId) -> Result<Option<StatusRecord>> {
        Ok(self.records.read().get(item_id).cloned())
    }

    async fn list(&self, state: Option<ItemState>, limit: usize) -> Result<Vec<StatusRecord>> {
        let mut records: Vec<StatusRecord> = self
            .records
            .read()
            .values()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        records.truncate(limit);
        Ok(records)
    }
}
