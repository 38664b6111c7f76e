//! Status store capability: one record per work item, upserted by key.

mod memory;
mod postgres;

pub use memory::InMemoryStatusStore;
pub use postgres::PgStatusStore;

use crate::error::Result;
use crate::model::{ItemId, ItemState, StatusRecord, StatusUpdate};
use async_trait::async_trait;
use tracing::warn;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert or replace the record for `record.item_id`
    async fn upsert(&self, record: &StatusRecord) -> Result<()>;

    async fn get(&self, item_id: &ItemId) -> Result<Option<StatusRecord>>;

    /// Most recently updated records first, optionally in one state
    async fn list(&self, state: Option<ItemState>, limit: usize) -> Result<Vec<StatusRecord>>;
}

/// Read the current record, merge `update` into it and write it back.
///
/// Not atomic across concurrent writers to the same item; the last write
/// wins. Out-of-order transitions are logged but still written, since
/// redelivery legitimately replays them.
pub async fn transition(
    store: &dyn StatusStore,
    item_id: &ItemId,
    update: StatusUpdate,
) -> Result<StatusRecord> {
    let existing = store.get(item_id).await?;

    if let Some(current) = &existing {
        if !current.state.can_transition_to(update.state) {
            warn!(
                item_id = %item_id,
                from = %current.state,
                to = %update.state,
                "Unexpected status transition"
            );
        }
    }

    let record = update.apply(item_id, existing);
    store.upsert(&record).await?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemState, Metadata};

    #[tokio::test]
    async fn test_transition_merges_into_existing_record() {
        let store = InMemoryStatusStore::new();
        let id = ItemId::from("item-1");
        let mut meta = Metadata::new();
        meta.insert("original_name".into(), "a.jpg".into());
        store.upsert(&StatusRecord::uploaded(id.clone(), meta)).await.unwrap();

        let record = transition(&store, &id, StatusUpdate::processing()).await.unwrap();

        assert_eq!(record.state, ItemState::Processing);
        assert_eq!(record.metadata["original_name"], "a.jpg");
        assert_eq!(store.get(&id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_transition_without_existing_record_creates_one() {
        let store = InMemoryStatusStore::new();
        let id = ItemId::from("orphan");

        let record = transition(&store, &id, StatusUpdate::error("boom")).await.unwrap();

        assert_eq!(record.state, ItemState::Error);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_unexpected_transition_is_still_written() {
        let store = InMemoryStatusStore::new();
        let id = ItemId::from("skipped-processing");
        store
            .upsert(&StatusRecord::uploaded(id.clone(), Metadata::new()))
            .await
            .unwrap();
        assert!(!ItemState::Uploaded.can_transition_to(ItemState::Processed));

        let record = transition(&store, &id, StatusUpdate::processed(Metadata::new()))
            .await
            .unwrap();

        assert_eq!(record.state, ItemState::Processed);
        assert_eq!(store.get(&id).await.unwrap().unwrap().state, ItemState::Processed);
    }

    #[tokio::test]
    async fn test_transition_propagates_read_failure() {
        let mut store = MockStatusStore::new();
        store
            .expect_get()
            .returning(|_| Err(crate::error::PipelineError::transient("get", "db down")));
        store.expect_upsert().never();

        let err = transition(&store, &ItemId::from("x"), StatusUpdate::processing())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
