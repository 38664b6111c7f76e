//! Date-partitioned reports: `{prefix}/{YYYY-MM-DD}/{shard}`.
//!
//! The daily batch writes one CSV partition per product; queries walk a
//! date range one day at a time and skip days with no data. The monthly
//! batch folds a month of partitions into one `Date,Daily Revenue` summary
//! at `{monthly_prefix}/{YYYY-MM}_report.csv`.

use crate::error::{PipelineError, Result};
use crate::object_store::{list_keys, ObjectStore};
use crate::retry::RetryingWriter;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";
const CSV_HEADER: [&str; 6] = ["Order ID", "Customer ID", "Product", "Quantity", "Price", "Timestamp"];
const MONTHLY_HEADER: [&str; 2] = ["Date", "Daily Revenue"];
const QUANTITY_COLUMN: usize = 3;
const PRICE_COLUMN: usize = 4;

/// One order row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    pub product: String,
    pub quantity: u32,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// A report partition as returned by queries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub date: NaiveDate,
    #[serde(rename = "product")]
    pub shard: String,
    pub content: String,
}

/// A partition written by [`ReportStore::publish_daily`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedPartition {
    pub date: NaiveDate,
    pub shard: String,
    pub key: String,
    pub rows: usize,
    /// Sum of quantity times price over the partition
    pub revenue: f64,
}

/// Revenue of one day, summed across its partitions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRevenue {
    pub date: NaiveDate,
    pub revenue: f64,
}

/// A summary written by [`ReportStore::publish_monthly`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySummary {
    pub key: String,
    /// Days that had data, in date order
    pub days: Vec<DailyRevenue>,
    pub total: f64,
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| PipelineError::Malformed(format!("invalid date {value:?}, expected YYYY-MM-DD")))
}

/// `YYYY-MM` into year and month
pub fn parse_month(value: &str) -> Result<(i32, u32)> {
    let first = NaiveDate::parse_from_str(&format!("{value}-01"), DATE_FORMAT)
        .map_err(|_| PipelineError::Malformed(format!("invalid month {value:?}, expected YYYY-MM")))?;
    Ok((first.year(), first.month()))
}

pub fn report_key(prefix: &str, date: NaiveDate, shard: &str) -> String {
    match prefix.trim_end_matches('/') {
        "" => format!("{}/{}", date.format(DATE_FORMAT), shard),
        root => format!("{}/{}/{}", root, date.format(DATE_FORMAT), shard),
    }
}

/// First and last day of a calendar month
fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate)> {
    let invalid = || PipelineError::Malformed(format!("invalid month {year}-{month:02}"));
    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let end = start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .ok_or_else(invalid)?;
    Ok((start, end))
}

/// Reads and writes report partitions in one bucket
pub struct ReportStore {
    objects: Arc<dyn ObjectStore>,
    writer: RetryingWriter,
    bucket: String,
    prefix: String,
    monthly_prefix: String,
}

impl ReportStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        writer: RetryingWriter,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            objects,
            writer,
            bucket: bucket.into(),
            prefix: prefix.into(),
            monthly_prefix: "monthly_reports".to_string(),
        }
    }

    pub fn with_monthly_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.monthly_prefix = prefix.into();
        self
    }

    pub fn monthly_key(&self, year: i32, month: u32) -> String {
        format!(
            "{}/{year:04}-{month:02}_report.csv",
            self.monthly_prefix.trim_end_matches('/')
        )
    }

    /// Partitions for each day in `[start, end]`, in date order.
    ///
    /// With a shard there is one lookup per day; without one, every shard
    /// under the day is listed. Days are fetched only as the stream is
    /// polled, and missing partitions are skipped. Calling again starts
    /// over from `start`.
    pub fn query(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        shard: Option<String>,
    ) -> BoxStream<'_, Result<ReportEntry>> {
        let days = start.iter_days().take_while(move |day| *day <= end);

        stream::iter(days)
            .then(move |day| {
                let shard = shard.clone();
                async move { self.entries_for_day(day, shard.as_deref()).await }
            })
            .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, PipelineError>)))
            .try_flatten()
            .boxed()
    }

    async fn entries_for_day(&self, day: NaiveDate, shard: Option<&str>) -> Result<Vec<ReportEntry>> {
        match shard {
            Some(shard) => {
                let key = report_key(&self.prefix, day, shard);
                Ok(self.fetch(day, shard, &key).await?.into_iter().collect())
            }
            None => {
                // `{prefix}/{date}/`
                let day_prefix = report_key(&self.prefix, day, "");
                let keys: Vec<String> = list_keys(self.objects.as_ref(), &self.bucket, &day_prefix)
                    .try_collect()
                    .await?;

                let mut entries = Vec::with_capacity(keys.len());
                for key in keys {
                    let shard = match key.strip_prefix(day_prefix.as_str()) {
                        Some(shard) if !shard.is_empty() && !shard.contains('/') => shard.to_string(),
                        _ => {
                            debug!(key = %key, "Nested object under day prefix, skipping");
                            continue;
                        }
                    };
                    if let Some(entry) = self.fetch(day, &shard, &key).await? {
                        entries.push(entry);
                    }
                }
                Ok(entries)
            }
        }
    }

    /// `None` when the partition is absent or not UTF-8
    async fn fetch(&self, day: NaiveDate, shard: &str, key: &str) -> Result<Option<ReportEntry>> {
        let body = match self.objects.get(&self.bucket, key).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                debug!(key, "No partition");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match String::from_utf8(body) {
            Ok(content) => Ok(Some(ReportEntry {
                date: day,
                shard: shard.to_string(),
                content,
            })),
            Err(_) => {
                warn!(key, "Partition is not valid UTF-8, skipping");
                Ok(None)
            }
        }
    }

    /// Split `orders` by product and upload one CSV partition per product
    #[instrument(skip(self, orders), fields(date = %date, orders = orders.len()))]
    pub async fn publish_daily(&self, date: NaiveDate, orders: &[Order]) -> Result<Vec<PublishedPartition>> {
        let mut published = Vec::new();

        for (shard, rows) in partition_orders(orders) {
            if shard.is_empty() || shard.contains('/') {
                warn!(product = %shard, "Product name cannot be used as a partition key, skipping");
                continue;
            }

            let key = report_key(&self.prefix, date, &shard);
            let body = render_csv(&rows).into_bytes();
            let objects = &self.objects;
            self.writer
                .write("upload report", || objects.put(&self.bucket, &key, body.clone()))
                .await?;

            debug!(key = %key, rows = rows.len(), "Daily report uploaded");
            metrics::counter!("reports.partitions.published").increment(1);

            published.push(PublishedPartition {
                date,
                shard,
                key,
                rows: rows.len(),
                revenue: rows.iter().map(|o| f64::from(o.quantity) * o.price).sum(),
            });
        }

        info!(partitions = published.len(), "Daily reports published");
        Ok(published)
    }

    /// Sum every daily partition of the month and upload the summary.
    ///
    /// Days without partitions are left out of the summary. An empty month
    /// still writes a header-only summary.
    #[instrument(skip(self))]
    pub async fn publish_monthly(&self, year: i32, month: u32) -> Result<MonthlySummary> {
        let (start, end) = month_bounds(year, month)?;

        let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        let mut entries = self.query(start, end, None);
        while let Some(entry) = entries.try_next().await? {
            *by_day.entry(entry.date).or_default() += partition_revenue(&entry.content);
        }

        let days: Vec<DailyRevenue> = by_day
            .into_iter()
            .map(|(date, revenue)| DailyRevenue { date, revenue })
            .collect();
        let total = days.iter().map(|d| d.revenue).sum();

        let key = self.monthly_key(year, month);
        let body = render_monthly_csv(&days).into_bytes();
        let objects = &self.objects;
        self.writer
            .write("upload monthly report", || objects.put(&self.bucket, &key, body.clone()))
            .await?;

        info!(key = %key, days = days.len(), total, "Monthly report published");
        metrics::counter!("reports.monthly.published").increment(1);

        Ok(MonthlySummary { key, days, total })
    }

    /// The stored summary for a month, `None` if it was never published
    pub async fn fetch_monthly(&self, year: i32, month: u32) -> Result<Option<String>> {
        let key = self.monthly_key(year, month);
        match self.objects.get(&self.bucket, &key).await {
            Ok(body) => String::from_utf8(body)
                .map(Some)
                .map_err(|_| PipelineError::Malformed(format!("{key} is not valid UTF-8"))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Orders grouped by product, products in sorted order
pub fn partition_orders(orders: &[Order]) -> BTreeMap<String, Vec<&Order>> {
    let mut partitions: BTreeMap<String, Vec<&Order>> = BTreeMap::new();
    for order in orders {
        partitions.entry(order.product.clone()).or_default().push(order);
    }
    partitions
}

pub fn render_csv(orders: &[&Order]) -> String {
    let mut out = String::new();
    push_row(&mut out, CSV_HEADER.iter().map(|s| s.to_string()));

    for order in orders {
        push_row(
            &mut out,
            [
                order.order_id.clone(),
                order.customer_id.clone(),
                order.product.clone(),
                order.quantity.to_string(),
                format!("{:.2}", order.price),
                order.timestamp.to_rfc3339(),
            ],
        );
    }
    out
}

pub fn render_monthly_csv(days: &[DailyRevenue]) -> String {
    let mut out = String::new();
    push_row(&mut out, MONTHLY_HEADER.iter().map(|s| s.to_string()));
    for day in days {
        push_row(
            &mut out,
            [day.date.format(DATE_FORMAT).to_string(), format!("{:.2}", day.revenue)],
        );
    }
    out
}

/// Quantity times price over the data rows of a daily partition. Rows that
/// do not parse are skipped.
fn partition_revenue(content: &str) -> f64 {
    parse_csv(content)
        .into_iter()
        .skip(1)
        .filter_map(|row| {
            let quantity = row.get(QUANTITY_COLUMN)?.parse::<f64>().ok();
            let price = row.get(PRICE_COLUMN)?.parse::<f64>().ok();
            match quantity.zip(price) {
                Some((quantity, price)) => Some(quantity * price),
                None => {
                    warn!(row = ?row, "Unparseable report row, left out of revenue");
                    None
                }
            }
        })
        .sum()
}

/// Records of a CSV document as written by [`push_row`]
fn parse_csv(content: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

fn push_row(out: &mut String, fields: impl IntoIterator<Item = String>) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;

        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(&field);
        }
    }
    out.push_str("\r\n");
}
