//! Moves aged partitions from the hot bucket to the cold bucket.

use crate::error::Result;
use crate::object_store::{list_keys, ObjectStore};
use crate::retry::RetryingWriter;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Tally of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: u64,
    pub moved: u64,
    /// Younger than the threshold
    pub retained: u64,
    /// Date segment missing or unparseable
    pub skipped_malformed: u64,
    /// Gone from the hot bucket between listing and copy
    pub already_moved: u64,
    /// Copy or delete failed; the hot object is still there
    pub failed: u64,
}

/// Copy-then-delete mover for date-partitioned keys
pub struct LifecycleMover {
    objects: Arc<dyn ObjectStore>,
    writer: RetryingWriter,
    hot_bucket: String,
    cold_bucket: String,
    prefix: String,
    date_segment: usize,
}

impl LifecycleMover {
    /// `date_segment` is the zero-based index of the `YYYY-MM-DD` segment
    /// in a `/`-separated key
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        writer: RetryingWriter,
        hot_bucket: impl Into<String>,
        cold_bucket: impl Into<String>,
        prefix: impl Into<String>,
        date_segment: usize,
    ) -> Self {
        Self {
            objects,
            writer,
            hot_bucket: hot_bucket.into(),
            cold_bucket: cold_bucket.into(),
            prefix: prefix.into(),
            date_segment,
        }
    }

    /// One pass over every key under the prefix.
    ///
    /// Objects whose date is more than `threshold` before `now` are copied
    /// to the cold bucket under the same key and only then deleted from the
    /// hot bucket. A failing object is counted and skipped; the pass goes
    /// on. Listing failures abort the pass, leaving earlier moves in place.
    #[instrument(skip(self), fields(bucket = %self.hot_bucket, prefix = %self.prefix))]
    pub async fn sweep(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let root = self.prefix.trim_end_matches('/');
        // an empty prefix sweeps the whole bucket
        let list_prefix = if root.is_empty() {
            String::new()
        } else {
            format!("{root}/")
        };
        let mut keys = list_keys(self.objects.as_ref(), &self.hot_bucket, &list_prefix);

        while let Some(key) = keys.try_next().await? {
            report.scanned += 1;

            let Some(date) = partition_date(&key, self.date_segment) else {
                warn!(key = %key, "No partition date in key, skipping");
                metrics::counter!("lifecycle.objects.skipped").increment(1);
                report.skipped_malformed += 1;
                continue;
            };

            if !is_stale(date, threshold, now) {
                report.retained += 1;
                continue;
            }

            match self.relocate(&key).await {
                Ok(true) => {
                    debug!(key = %key, %date, "Moved to cold storage");
                    metrics::counter!("lifecycle.objects.moved").increment(1);
                    report.moved += 1;
                }
                Ok(false) => report.already_moved += 1,
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to move object, left in hot storage");
                    metrics::counter!("lifecycle.objects.failed").increment(1);
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            moved = report.moved,
            retained = report.retained,
            skipped = report.skipped_malformed,
            failed = report.failed,
            "Lifecycle sweep complete"
        );
        Ok(report)
    }

    /// Copy to cold, then delete from hot. `Ok(false)` when the hot object
    /// no longer exists.
    async fn relocate(&self, key: &str) -> Result<bool> {
        let objects = &self.objects;
        let copied = self
            .writer
            .write("copy to cold storage", || {
                objects.copy(&self.hot_bucket, key, &self.cold_bucket, key)
            })
            .await;

        match copied {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Hot object already gone");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.writer
            .write("delete from hot storage", || objects.delete(&self.hot_bucket, key))
            .await?;
        Ok(true)
    }

    /// Sweep every `interval` until `shutdown` fires. A failed sweep is
    /// logged and retried on the next tick.
    pub async fn run(&self, threshold: chrono::Duration, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Starting lifecycle mover");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweep(threshold, Utc::now()).await {
                error!(error = %e, "Lifecycle sweep aborted");
            }
        }

        info!("Lifecycle mover stopped");
    }
}

/// Date at `segment` in a `/`-separated key
pub fn partition_date(key: &str, segment: usize) -> Option<NaiveDate> {
    let part = key.split('/').nth(segment)?;
    NaiveDate::parse_from_str(part, "%Y-%m-%d").ok()
}

fn is_stale(date: NaiveDate, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
    let partition_start = date.and_time(NaiveTime::MIN).and_utc();
    now - partition_start > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::object_store::{InMemoryObjectStore, ListPage, MockObjectStore};
    use crate::retry::RetryPolicy;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn mover(objects: Arc<dyn ObjectStore>) -> LifecycleMover {
        LifecycleMover::new(
            objects,
            RetryingWriter::new(RetryPolicy::immediate(3)),
            "hot",
            "cold",
            "daily_reports",
            1,
        )
    }

    async fn seeded() -> Arc<InMemoryObjectStore> {
        let store = Arc::new(InMemoryObjectStore::with_page_size(2));
        for key in [
            "daily_reports/2024-01-01/Widget A",
            "daily_reports/2024-01-01/Widget B",
            "daily_reports/2024-02-25/Widget A",
            "daily_reports/not-a-date/Widget A",
        ] {
            store.put("hot", key, key.as_bytes().to_vec()).await.unwrap();
        }
        store
    }

    #[test]
    fn test_partition_date() {
        assert_eq!(
            partition_date("daily_reports/2024-01-05/Widget A", 1),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(partition_date("daily_reports/2024-13-05/x", 1), None);
        assert_eq!(partition_date("daily_reports", 1), None);
        assert_eq!(partition_date("a/b/2024-01-05/x", 2), NaiveDate::from_ymd_opt(2024, 1, 5));
    }

    #[test]
    fn test_is_stale_is_strictly_greater() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let exactly = date.and_time(NaiveTime::MIN).and_utc() + chrono::Duration::days(30);

        assert!(!is_stale(date, chrono::Duration::days(30), exactly));
        assert!(is_stale(date, chrono::Duration::days(30), exactly + chrono::Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_sweep_moves_only_stale_partitions() {
        let store = seeded().await;

        let report = mover(store.clone())
            .sweep(chrono::Duration::days(30), now())
            .await
            .unwrap();

        assert_eq!(report.scanned, 4);
        assert_eq!(report.moved, 2);
        assert_eq!(report.retained, 1);
        assert_eq!(report.skipped_malformed, 1);

        assert!(store.contains("cold", "daily_reports/2024-01-01/Widget A"));
        assert!(!store.contains("hot", "daily_reports/2024-01-01/Widget A"));
        assert!(store.contains("hot", "daily_reports/2024-02-25/Widget A"));
        assert!(store.contains("hot", "daily_reports/not-a-date/Widget A"));
        assert_eq!(
            store.get("cold", "daily_reports/2024-01-01/Widget B").await.unwrap(),
            b"daily_reports/2024-01-01/Widget B"
        );
    }

    #[tokio::test]
    async fn test_second_sweep_is_a_no_op() {
        let store = seeded().await;
        let mover = mover(store.clone());
        mover.sweep(chrono::Duration::days(30), now()).await.unwrap();
        let hot_before = store.keys("hot");
        let cold_before = store.keys("cold");

        let report = mover.sweep(chrono::Duration::days(30), now()).await.unwrap();

        assert_eq!(report.moved, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(store.keys("hot"), hot_before);
        assert_eq!(store.keys("cold"), cold_before);
    }

    #[tokio::test]
    async fn test_copy_failure_keeps_hot_object_and_continues() {
        let mut store = MockObjectStore::new();
        store.expect_list_page().returning(|_, _, _| {
            Ok(ListPage {
                keys: vec![
                    "daily_reports/2024-01-01/Widget A".into(),
                    "daily_reports/2024-01-02/Widget A".into(),
                ],
                next_token: None,
            })
        });
        store.expect_copy().returning(|_, src_key, _, _| {
            if src_key.contains("2024-01-01") {
                Err(PipelineError::transient("copy_object", "503 SlowDown"))
            } else {
                Ok(())
            }
        });
        // only the successfully copied object may be deleted
        store
            .expect_delete()
            .withf(|bucket, key| bucket == "hot" && key == "daily_reports/2024-01-02/Widget A")
            .times(1)
            .returning(|_, _| Ok(()));

        let report = mover(Arc::new(store))
            .sweep(chrono::Duration::days(30), now())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.moved, 1);
    }

    #[tokio::test]
    async fn test_vanished_source_counts_as_already_moved() {
        let mut store = MockObjectStore::new();
        store.expect_list_page().returning(|_, _, _| {
            Ok(ListPage {
                keys: vec!["daily_reports/2024-01-01/Widget A".into()],
                next_token: None,
            })
        });
        store
            .expect_copy()
            .times(1)
            .returning(|_, k, _, _| Err(PipelineError::NotFound(k.to_string())));
        store.expect_delete().never();

        let report = mover(Arc::new(store))
            .sweep(chrono::Duration::days(30), now())
            .await
            .unwrap();

        assert_eq!(report.already_moved, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_empty_prefix_sweeps_whole_bucket() {
        let store = Arc::new(InMemoryObjectStore::new());
        for key in ["2024-01-01/Widget A", "2024-02-28/Widget A"] {
            store.put("hot", key, b"x".to_vec()).await.unwrap();
        }
        let mover = LifecycleMover::new(
            store.clone(),
            RetryingWriter::new(RetryPolicy::immediate(3)),
            "hot",
            "cold",
            "",
            0,
        );

        let report = mover.sweep(chrono::Duration::days(30), now()).await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.moved, 1);
        assert!(store.contains("cold", "2024-01-01/Widget A"));
        assert!(store.contains("hot", "2024-02-28/Widget A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_until_cancelled() {
        let store = seeded().await;
        let mover = Arc::new(mover(store.clone()));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let mover = mover.clone();
            let shutdown = shutdown.clone();
            async move {
                mover
                    .run(chrono::Duration::days(30), Duration::from_secs(3600), shutdown)
                    .await
            }
        });

        // first tick fires immediately
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert!(store.contains("cold", "daily_reports/2024-01-01/Widget A"));
    }
}
